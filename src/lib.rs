//! Headless DOM and window environment.
//!
//! Runs code written for browsers without a browser: a DOM with live
//! collections and W3C event dispatch, a window with a cooperative event
//! loop, and a Browser → Context → Page → Frame hierarchy that drives
//! navigation and tracks when a page has settled.
//!
//! Notes for embedders:
//!  - Async entry points are meant for a current-thread Tokio runtime:
//!    `#[tokio::main(flavor = "current_thread")] async fn main() { /* ... */ }`
//!  - The script engine is a collaborator ([`js_engine::ScriptEngine`]); the
//!    default one accepts every script and evaluates it to `null`.

use std::sync::Once;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod browser;
pub mod core;
pub mod js_engine;
pub mod window;

pub use crate::browser::{Browser, BrowserContext, BrowserFrame, BrowserPage};
pub use crate::core::css::SelectorError;
pub use crate::core::dom::{Document, DomError, Element, Node};
pub use crate::core::events::{AbortController, AbortSignal, Event, EventInit, EventListener};
pub use crate::core::network::{
    NetworkError, Resource, ResourceLoader, ResourceRequest, StaticResourceLoader,
};
pub use crate::js_engine::{ClosureScriptEngine, JSError, NoopScriptEngine, ScriptEngine};
pub use crate::window::{ClockMode, Window};

#[derive(Error, Debug, Clone)]
pub enum BrowserError {
    #[error("DOM error: {0}")]
    Dom(DomError),
    #[error("Network error: {0}")]
    Network(NetworkError),
    #[error("JavaScript error: {0}")]
    JS(JSError),
    #[error("Selector error: {0}")]
    Selector(SelectorError),
    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("{0} is closed")]
    Closed(String),
    #[error("Invalid settings: {0}")]
    Settings(String),
}

impl From<DomError> for BrowserError {
    fn from(e: DomError) -> Self {
        BrowserError::Dom(e)
    }
}
impl From<NetworkError> for BrowserError {
    fn from(e: NetworkError) -> Self {
        BrowserError::Network(e)
    }
}
impl From<JSError> for BrowserError {
    fn from(e: JSError) -> Self {
        BrowserError::JS(e)
    }
}
impl From<SelectorError> for BrowserError {
    fn from(e: SelectorError) -> Self {
        BrowserError::Selector(e)
    }
}
impl From<url::ParseError> for BrowserError {
    fn from(e: url::ParseError) -> Self {
        BrowserError::InvalidUrl(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrowserError>;

/// Size of the emulated screen. Only reported through `inner_width` and
/// friends; nothing is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            device_scale_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    /// Upper bound applied to every timer delay, in milliseconds.
    pub max_timeout: Option<u64>,
    /// Intervals stop after this many runs.
    pub max_interval_iterations: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationSettings {
    pub disable_main_frame_navigation: bool,
    pub disable_child_frame_navigation: bool,
    /// Time allowed for fetching a document, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for NavigationSettings {
    fn default() -> Self {
        Self {
            disable_main_frame_navigation: false,
            disable_child_frame_navigation: false,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_ms: u64,
    pub max_response_bytes: usize,
    pub max_redirects: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_response_bytes: 16 * 1024 * 1024,
            max_redirects: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub user_agent: String,
    pub viewport: Viewport,

    pub disable_javascript_evaluation: bool,
    pub disable_javascript_file_loading: bool,
    pub disable_css_file_loading: bool,
    pub disable_iframe_page_loading: bool,
    /// Uncaught errors only go to the log, not to the console or `error` listeners.
    pub disable_error_capturing: bool,

    pub timer: TimerSettings,
    pub navigation: NavigationSettings,
    pub fetch: FetchSettings,

    // data: URL controls
    pub allow_data_urls: bool,
    pub max_data_url_bytes: usize,
    pub allowed_data_mime_prefixes: Vec<String>,

    pub clock: ClockMode,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            user_agent: format!(
                "Mozilla/5.0 (X11; Linux x86_64) HeadlessDom/{}",
                env!("CARGO_PKG_VERSION")
            ),
            viewport: Viewport::default(),
            disable_javascript_evaluation: false,
            disable_javascript_file_loading: false,
            disable_css_file_loading: false,
            disable_iframe_page_loading: false,
            disable_error_capturing: false,
            timer: TimerSettings::default(),
            navigation: NavigationSettings::default(),
            fetch: FetchSettings::default(),

            allow_data_urls: true,
            max_data_url_bytes: 256 * 1024, // 256 KiB cap
            allowed_data_mime_prefixes: vec![
                "text/html".to_string(),
                "text/plain".to_string(),
                "text/css".to_string(),
                "application/javascript".to_string(),
                "text/javascript".to_string(),
                "application/json".to_string(),
                "application/xhtml+xml".to_string(),
                "image/".to_string(),
                "font/".to_string(),
            ],

            clock: ClockMode::Virtual,
        }
    }
}

impl BrowserSettings {
    /// Unknown fields are ignored and missing ones take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BrowserError::Settings(e.to_string()))
    }

    pub fn data_mime_allowed(&self, mime: &str) -> bool {
        let mime = mime.trim().to_ascii_lowercase();
        self.allowed_data_mime_prefixes
            .iter()
            .any(|prefix| mime.starts_with(&prefix.to_ascii_lowercase()))
    }
}

static LOGGING: Once = Once::new();

/// Installs a `tracing` fmt subscriber. `RUST_LOG` wins over `filter` when
/// set. Calling it again, or after another subscriber was installed, does
/// nothing.
pub fn init_logging(filter: &str) {
    LOGGING.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_from_partial_json() {
        let settings = BrowserSettings::from_json(
            r#"{
                "disable_javascript_evaluation": true,
                "viewport": { "width": 800 },
                "timer": { "max_timeout": 1000 },
                "clock": "system",
                "something_else": 1
            }"#,
        )
        .unwrap();
        assert!(settings.disable_javascript_evaluation);
        assert_eq!(settings.viewport.width, 800);
        assert_eq!(settings.viewport.height, 768);
        assert_eq!(settings.timer.max_timeout, Some(1000));
        assert_eq!(settings.clock, ClockMode::System);
        assert!(settings.allow_data_urls);
    }

    #[test]
    fn malformed_settings_are_an_error() {
        assert!(matches!(
            BrowserSettings::from_json("{ nope"),
            Err(BrowserError::Settings(_))
        ));
    }

    #[test]
    fn data_mime_prefixes() {
        let settings = BrowserSettings::default();
        assert!(settings.data_mime_allowed("image/png"));
        assert!(settings.data_mime_allowed("Text/HTML"));
        assert!(!settings.data_mime_allowed("application/octet-stream"));
    }

    #[test]
    fn init_logging_is_idempotent() {
        init_logging("headless_dom=debug");
        init_logging("off");
    }
}

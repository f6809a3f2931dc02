//! Resource loading collaborator: the requests the DOM and window hand out
//! (scripts, stylesheets, media, frames, `fetch`) and the loaders that
//! answer them.

pub mod data_url;
pub mod fetch;
#[cfg(feature = "http")]
mod http;

pub use fetch::{FetchOptions, FetchResponse, HttpMethod};
#[cfg(feature = "http")]
pub use http::HttpResourceLoader;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid data URL: {0}")]
    DataUrl(String),
    #[error("Request aborted: {0}")]
    Aborted(String),
    #[error("Security policy violation: {0}")]
    SecurityPolicy(String),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

/// What a request is for; decides how the caller treats the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Document,
    Iframe,
    Script,
    Style,
    Image,
    Media,
    Fetch,
}

impl Destination {
    /// `Accept` header a browser would send for this destination.
    pub fn accept(self) -> &'static str {
        match self {
            Destination::Document | Destination::Iframe => {
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
            }
            Destination::Script => "*/*",
            Destination::Style => "text/css,*/*;q=0.1",
            Destination::Image => "image/avif,image/webp,image/*,*/*;q=0.8",
            Destination::Media | Destination::Fetch => "*/*",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub url: Url,
    pub destination: Destination,
    pub referrer: Option<Url>,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ResourceRequest {
    pub fn new(url: Url, destination: Destination) -> Self {
        Self {
            url,
            destination,
            referrer: None,
            method: HttpMethod::Get,
            headers: Vec::new(),
            body: None,
        }
    }

    /// `about:` referrers are never sent.
    pub fn with_referrer(mut self, referrer: Url) -> Self {
        if referrer.scheme() != "about" {
            self.referrer = Some(referrer);
        }
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// A loaded response.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("bytes", &self.body.len())
            .finish()
    }
}

impl Resource {
    pub fn new(url: Url, status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url,
            status,
            content_type: content_type.map(str::to_string),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn mime(&self) -> Option<mime::Mime> {
        self.content_type.as_deref()?.parse().ok()
    }

    /// `essence` of the content type (`text/html` for `text/html; charset=utf-8`).
    pub fn mime_essence(&self) -> Option<String> {
        self.mime().map(|m| m.essence_str().to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Answers resource requests. Implementations must be cheap to share; the
/// window clones the `Arc` into every load it spawns.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, request: ResourceRequest) -> Result<Resource>;
}

/// Hosts allowed or refused before any request goes out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub allowed_schemes: Vec<String>,
    pub blocked_hosts: Vec<String>,
    pub allowed_hosts: Option<Vec<String>>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            blocked_hosts: Vec::new(),
            allowed_hosts: None,
        }
    }
}

impl SecurityPolicy {
    pub fn check_url(&self, url: &Url) -> Result<()> {
        if !self.allowed_schemes.iter().any(|s| s == url.scheme()) {
            return Err(NetworkError::SecurityPolicy(format!(
                "Scheme '{}' not allowed",
                url.scheme()
            )));
        }
        if let Some(host) = url.host_str() {
            if self.blocked_hosts.iter().any(|h| h == host) {
                return Err(NetworkError::SecurityPolicy(format!("Host '{host}' is blocked")));
            }
            if let Some(allowed) = &self.allowed_hosts {
                if !allowed.iter().any(|h| h == host) {
                    return Err(NetworkError::SecurityPolicy(format!(
                        "Host '{host}' not in allowlist"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum StaticRoute {
    Respond {
        status: u16,
        content_type: Option<String>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        delay: Option<Duration>,
    },
    Fail(NetworkError),
}

/// In-memory loader keyed by absolute URL (fragment ignored). Unknown URLs
/// answer `404`. Every request is recorded so callers can assert on what
/// was loaded.
#[derive(Default)]
pub struct StaticResourceLoader {
    routes: DashMap<String, StaticRoute>,
    requests: Mutex<Vec<ResourceRequest>>,
}

impl fmt::Debug for StaticResourceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticResourceLoader")
            .field("routes", &self.routes.len())
            .field("requests", &self.requests.lock().len())
            .finish()
    }
}

fn route_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

impl StaticResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_html(self, url: &str, html: &str) -> Self {
        self.with_resource(url, "text/html; charset=utf-8", html.as_bytes())
    }

    pub fn with_resource(self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.insert(url, 200, Some(content_type), body);
        self
    }

    pub fn with_status(self, url: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.insert(url, status, None, body);
        self
    }

    /// Answers `url` only after `delay` of real time.
    pub fn with_delayed(self, url: &str, content_type: &str, body: impl Into<Vec<u8>>, delay: Duration) -> Self {
        self.routes.insert(
            route_key(url),
            StaticRoute::Respond {
                status: 200,
                content_type: Some(content_type.to_string()),
                headers: Vec::new(),
                body: body.into(),
                delay: Some(delay),
            },
        );
        self
    }

    pub fn with_failure(self, url: &str, error: NetworkError) -> Self {
        self.routes.insert(route_key(url), StaticRoute::Fail(error));
        self
    }

    pub fn insert(&self, url: &str, status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) {
        self.routes.insert(
            route_key(url),
            StaticRoute::Respond {
                status,
                content_type: content_type.map(str::to_string),
                headers: Vec::new(),
                body: body.into(),
                delay: None,
            },
        );
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<ResourceRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        let key = route_key(url);
        self.requests
            .lock()
            .iter()
            .filter(|r| route_key(r.url.as_str()) == key)
            .count()
    }
}

#[async_trait]
impl ResourceLoader for StaticResourceLoader {
    async fn load(&self, request: ResourceRequest) -> Result<Resource> {
        trace!(url = %request.url, destination = ?request.destination, "static load");
        self.requests.lock().push(request.clone());
        if request.url.scheme() == "data" {
            return data_url::load(&request.url, usize::MAX);
        }
        let route = self
            .routes
            .get(&route_key(request.url.as_str()))
            .map(|entry| entry.value().clone());
        match route {
            Some(StaticRoute::Respond {
                status,
                content_type,
                headers,
                body,
                delay,
            }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(Resource {
                    url: request.url,
                    status,
                    content_type,
                    headers,
                    body,
                })
            }
            Some(StaticRoute::Fail(error)) => Err(error),
            None => {
                debug!(url = %request.url, "no static route");
                Ok(Resource::new(request.url, 404, Some("text/plain"), "Not Found"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn static_loader_serves_routes_and_404s() {
        let loader = StaticResourceLoader::new()
            .with_html("https://example.test/", "<p>hi</p>")
            .with_failure("https://example.test/down", NetworkError::Connection("refused".into()));

        let page = loader
            .load(ResourceRequest::new(url("https://example.test/#top"), Destination::Document))
            .await
            .unwrap();
        assert!(page.is_success());
        assert_eq!(page.text(), "<p>hi</p>");
        assert_eq!(page.mime_essence().as_deref(), Some("text/html"));

        let missing = loader
            .load(ResourceRequest::new(url("https://example.test/nope"), Destination::Script))
            .await
            .unwrap();
        assert_eq!(missing.status, 404);

        let down = loader
            .load(ResourceRequest::new(url("https://example.test/down"), Destination::Fetch))
            .await;
        assert!(matches!(down, Err(NetworkError::Connection(_))));
        assert_eq!(loader.request_count("https://example.test/"), 1);
        assert_eq!(loader.requests().len(), 3);
    }

    #[test]
    fn about_referrers_are_dropped() {
        let request = ResourceRequest::new(url("https://a.test/x.js"), Destination::Script)
            .with_referrer(url("about:blank"));
        assert!(request.referrer.is_none());
    }

    #[test]
    fn security_policy_checks_scheme_and_hosts() {
        let policy = SecurityPolicy {
            blocked_hosts: vec!["evil.test".into()],
            ..SecurityPolicy::default()
        };
        assert!(policy.check_url(&url("https://ok.test/")).is_ok());
        assert!(policy.check_url(&url("https://evil.test/")).is_err());
        assert!(policy.check_url(&url("ftp://ok.test/")).is_err());
    }
}

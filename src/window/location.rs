use std::fmt;

use tracing::{debug, warn};
use url::{Position, Url};

use super::{WeakWindow, Window};
use crate::core::dom::{DomError, Result};
use crate::core::events::{dispatch_trusted, Event, EventInit, EventTarget};

/// `window.location`. Reads go to the document URL; anything that leaves
/// the document is handed to the frame as a navigation request.
#[derive(Clone)]
pub struct Location {
    window: WeakWindow,
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Location").field(&self.href()).finish()
    }
}

impl Location {
    pub(crate) fn new(window: &Window) -> Self {
        Self {
            window: window.downgrade(),
        }
    }

    fn url(&self) -> Option<Url> {
        self.window
            .upgrade()
            .map(|window| window.document().url_value())
    }

    fn with_url<T: Default>(&self, f: impl FnOnce(&Url) -> T) -> T {
        self.url().map(|url| f(&url)).unwrap_or_default()
    }

    pub fn href(&self) -> String {
        self.with_url(|url| url.to_string())
    }

    pub fn protocol(&self) -> String {
        self.with_url(|url| format!("{}:", url.scheme()))
    }

    pub fn host(&self) -> String {
        self.with_url(|url| url[Position::BeforeHost..Position::AfterPort].to_string())
    }

    pub fn hostname(&self) -> String {
        self.with_url(|url| url.host_str().unwrap_or_default().to_string())
    }

    pub fn port(&self) -> String {
        self.with_url(|url| url.port().map(|p| p.to_string()).unwrap_or_default())
    }

    pub fn pathname(&self) -> String {
        self.with_url(|url| url.path().to_string())
    }

    pub fn search(&self) -> String {
        self.with_url(|url| match url.query() {
            Some(query) if !query.is_empty() => format!("?{query}"),
            _ => String::new(),
        })
    }

    pub fn hash(&self) -> String {
        self.with_url(|url| match url.fragment() {
            Some(fragment) if !fragment.is_empty() => format!("#{fragment}"),
            _ => String::new(),
        })
    }

    pub fn origin(&self) -> String {
        self.with_url(|url| url.origin().ascii_serialization())
    }

    /// Fragment-only change: updates the document URL and fires `hashchange`
    /// without leaving the document.
    pub fn set_hash(&self, hash: &str) {
        let Some(window) = self.window.upgrade() else {
            return;
        };
        let document = window.document();
        let mut url = document.url_value();
        let fragment = hash.trim_start_matches('#');
        let previous = url.fragment().map(str::to_string);
        url.set_fragment(Some(fragment));
        if previous.as_deref() == Some(fragment) {
            return;
        }
        debug!(url = %url, "hash changed");
        document.set_url(url);
        let event = Event::new("hashchange", EventInit::default());
        if let Err(error) = dispatch_trusted(&EventTarget::Window(window), &event) {
            warn!(%error, "could not fire hashchange");
        }
    }

    fn resolve(&self, window: &Window, target: &str) -> Result<Url> {
        window
            .document()
            .resolve_url(target)
            .map_err(|_| DomError::Syntax(format!("'{target}' is not a valid URL")))
    }

    fn navigate(&self, target: &str, replace: bool) -> Result<()> {
        let Some(window) = self.window.upgrade() else {
            return Ok(());
        };
        let url = self.resolve(&window, target)?;
        let current = window.document().url_value();
        if url.fragment().is_some() && url[..Position::AfterQuery] == current[..Position::AfterQuery] {
            self.set_hash(url.fragment().unwrap_or_default());
            return Ok(());
        }
        match window.frame_host() {
            Some(host) => host.request_navigation(url, replace),
            None => window
                .console()
                .warn(&format!("Navigation to {url} ignored: the window has no frame")),
        }
        Ok(())
    }

    /// Setting `href` navigates like `assign`.
    pub fn set_href(&self, href: &str) -> Result<()> {
        self.navigate(href, false)
    }

    pub fn assign(&self, url: &str) -> Result<()> {
        self.navigate(url, false)
    }

    pub fn replace(&self, url: &str) -> Result<()> {
        self.navigate(url, true)
    }

    pub fn reload(&self) {
        let Some(window) = self.window.upgrade() else {
            return;
        };
        let url = window.document().url_value();
        if let Some(host) = window.frame_host() {
            host.request_navigation(url, true);
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.href())
    }
}

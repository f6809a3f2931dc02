use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    /// Set when no `Domain` attribute was given: only the exact host matches.
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let domain_ok = if self.host_only {
            host.eq_ignore_ascii_case(&self.domain)
        } else {
            host.eq_ignore_ascii_case(&self.domain)
                || host
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", self.domain.to_ascii_lowercase()))
        };
        domain_ok && path_matches(url.path(), &self.path) && (!self.secure || url.scheme() == "https")
    }
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/')))
}

/// Directory of the request path, used when a cookie carries no `Path`.
fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

/// Cookie store shared by every page of a browser context.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Arc<RwLock<Vec<Cookie>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one `Set-Cookie` style string as `document.cookie` would:
    /// `HttpOnly` cookies cannot be written from the document.
    pub fn set_cookie(&self, url: &Url, cookie: &str) {
        self.store(url, cookie, false);
    }

    /// Applies a `Set-Cookie` response header.
    pub fn set_cookie_from_header(&self, url: &Url, header: &str) {
        self.store(url, header, true);
    }

    fn store(&self, url: &Url, raw: &str, from_http: bool) {
        let Some(host) = url.host_str() else {
            return;
        };
        let mut parts = raw.split(';');
        let Some((name, value)) = parts.next().and_then(|pair| pair.split_once('=')) else {
            debug!(cookie = raw, "ignoring cookie without a name/value pair");
            return;
        };
        let mut cookie = Cookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
            domain: host.to_string(),
            host_only: true,
            path: default_path(url),
            secure: false,
            http_only: false,
        };
        let mut expired = false;
        for attribute in parts {
            let (key, value) = match attribute.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !value.is_empty() => {
                    let domain = value.trim_start_matches('.').to_ascii_lowercase();
                    let host = host.to_ascii_lowercase();
                    if host != domain && !host.ends_with(&format!(".{domain}")) {
                        debug!(%domain, %host, "cookie domain does not match the request host");
                        return;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if value.starts_with('/') => cookie.path = value.to_string(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "max-age" => expired = value.parse::<i64>().is_ok_and(|age| age <= 0),
                _ => {}
            }
        }
        if cookie.http_only && !from_http {
            return;
        }

        let mut cookies = self.cookies.write();
        let existing = cookies.iter().position(|c| {
            c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
        });
        if let Some(index) = existing {
            if cookies[index].http_only && !from_http {
                return;
            }
            cookies.remove(index);
        }
        if !expired {
            cookies.push(cookie);
        }
    }

    /// Cookies sent with a request to `url`.
    pub fn cookies_for(&self, url: &Url) -> Vec<Cookie> {
        let mut matching: Vec<Cookie> = self
            .cookies
            .read()
            .iter()
            .filter(|cookie| cookie.matches(url))
            .cloned()
            .collect();
        // longer paths first
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matching
    }

    /// The `document.cookie` getter: script-visible cookies as `a=1; b=2`.
    pub fn cookie_string(&self, url: &Url) -> String {
        self.cookies_for(url)
            .into_iter()
            .filter(|cookie| !cookie.http_only)
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn all(&self) -> Vec<Cookie> {
        self.cookies.read().clone()
    }

    pub fn clear(&self) {
        self.cookies.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn scoping_by_domain_and_path() {
        let jar = CookieJar::new();
        let page = url("https://www.example.com/app/index.html");
        jar.set_cookie(&page, "a=1");
        jar.set_cookie(&page, "b=2; Domain=example.com; Path=/");
        jar.set_cookie(&page, "c=3; Domain=other.com");

        assert_eq!(jar.cookie_string(&page), "a=1; b=2");
        assert_eq!(jar.cookie_string(&url("https://api.example.com/")), "b=2");
        assert_eq!(jar.cookie_string(&url("https://www.example.com/")), "b=2");
    }

    #[test]
    fn http_only_and_max_age() {
        let jar = CookieJar::new();
        let page = url("https://example.com/");
        jar.set_cookie_from_header(&page, "session=abc; HttpOnly");
        jar.set_cookie(&page, "session=evil");
        jar.set_cookie(&page, "theme=dark");
        assert_eq!(jar.cookie_string(&page), "theme=dark");
        assert_eq!(jar.cookies_for(&page).len(), 2);

        jar.set_cookie(&page, "theme=dark; Max-Age=0");
        assert_eq!(jar.cookie_string(&page), "");
    }

    #[test]
    fn secure_cookies_need_https() {
        let jar = CookieJar::new();
        jar.set_cookie(&url("https://example.com/"), "s=1; Secure");
        assert_eq!(jar.cookie_string(&url("http://example.com/")), "");
    }
}

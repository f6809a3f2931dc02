use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{NetworkError, Resource};
use crate::core::events::AbortSignal;

/// Options of `window.fetch`.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub signal: Option<AbortSignal>,
    /// Overrides the window's fetch timeout.
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn with_signal(mut self, signal: &AbortSignal) -> Self {
        self.signal = Some(signal.clone());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// Response handed back by `window.fetch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub url: Url,
    pub redirected: bool,
}

impl FetchResponse {
    pub(crate) fn from_resource(requested: &Url, resource: Resource) -> Self {
        Self {
            status: resource.status,
            redirected: resource.url != *requested,
            headers: resource.headers,
            body: resource.body,
            url: resource.url,
        }
    }

    /// Status in the 200-299 range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| NetworkError::Protocol(format!("invalid JSON body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_reports_redirects_and_decodes_json() {
        let requested = Url::parse("https://a.test/data").unwrap();
        let resource = Resource::new(
            Url::parse("https://a.test/data.json").unwrap(),
            200,
            Some("application/json"),
            br#"{"items":[1,2]}"#.to_vec(),
        );
        let response = FetchResponse::from_resource(&requested, resource);
        assert!(response.ok());
        assert!(response.redirected);
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["items"][1], 2);
    }
}

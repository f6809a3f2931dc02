use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::{debug, warn};

use super::{data_url, NetworkError, Resource, ResourceLoader, ResourceRequest, Result, SecurityPolicy};
use crate::BrowserSettings;

/// Loader backed by `reqwest`. `data:` URLs are decoded locally.
#[derive(Debug, Clone)]
pub struct HttpResourceLoader {
    client: Client,
    policy: SecurityPolicy,
    timeout: Duration,
    max_response_bytes: usize,
    allow_data_urls: bool,
    max_data_url_bytes: usize,
}

impl HttpResourceLoader {
    pub fn new(settings: &BrowserSettings) -> Result<Self> {
        let timeout = Duration::from_millis(settings.fetch.timeout_ms);
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(settings.fetch.max_redirects))
            .build()
            .map_err(|e| NetworkError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            policy: SecurityPolicy::default(),
            timeout,
            max_response_bytes: settings.fetch.max_response_bytes,
            allow_data_urls: settings.allow_data_urls,
            max_data_url_bytes: settings.max_data_url_bytes,
        })
    }

    pub fn with_policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl ResourceLoader for HttpResourceLoader {
    async fn load(&self, request: ResourceRequest) -> Result<Resource> {
        if request.url.scheme() == "data" {
            if !self.allow_data_urls {
                return Err(NetworkError::SecurityPolicy("Scheme 'data' not allowed".into()));
            }
            return data_url::load(&request.url, self.max_data_url_bytes);
        }
        self.policy.check_url(&request.url)?;

        let method = Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| NetworkError::Protocol(e.to_string()))?;
        let mut builder = self
            .client
            .request(method, request.url.clone())
            .header(reqwest::header::ACCEPT, request.destination.accept());
        if let Some(referrer) = &request.referrer {
            builder = builder.header(reqwest::header::REFERER, referrer.as_str());
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        debug!(url = %request.url, method = request.method.as_str(), "HTTP request");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::Timeout(format!("{} after {:?}", request.url, self.timeout))
            } else if e.is_connect() {
                NetworkError::Connection(e.to_string())
            } else {
                NetworkError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let url = response.url().clone();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| NetworkError::RequestFailed(format!("Failed to read body: {e}")))?
            .to_vec();
        if body.len() > self.max_response_bytes {
            warn!(url = %url, bytes = body.len(), "response too large");
            return Err(NetworkError::RequestFailed("Response too large".to_string()));
        }

        Ok(Resource {
            url,
            status,
            content_type,
            headers,
            body,
        })
    }
}

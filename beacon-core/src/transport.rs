//! Blocking REST transport for the tracking server
//!
//! The queue and the client facade only see the [`Transport`] trait. The
//! HTTP implementation drives an async `reqwest` client on a private
//! current-thread runtime so callers stay synchronous.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::Value;

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Query string parameters
pub type Params<'a> = [(&'a str, String)];

/// Synchronous access to the server's REST API.
///
/// Endpoints are relative to the API root (e.g. `buckets/`). Any non-2xx
/// answer or connection failure is an [`Error::Transport`]. Successful
/// bodies are decoded as JSON; a body that is not JSON comes back as
/// [`Value::String`] and an empty body as [`Value::Null`].
pub trait Transport: Send + Sync {
    fn get(&self, endpoint: &str, params: &Params<'_>) -> Result<Value>;

    fn post(&self, endpoint: &str, payload: &Value, params: &Params<'_>) -> Result<Value>;

    fn delete(&self, endpoint: &str, payload: &Value) -> Result<Value>;
}

/// HTTP transport for `http://{host}:{port}/api/0/`
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
    runtime: tokio::runtime::Runtime,
}

impl HttpTransport {
    /// Create a transport from server configuration
    pub fn new(server: &ServerConfig) -> Result<Self> {
        server.validate()?;
        Self::with_base_url(server.api_url(), server.timeout())
    }

    /// Create a transport for an explicit API root
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            runtime,
        })
    }

    /// API root this transport talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn send(&self, method: &str, endpoint: &str, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(None, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            tracing::warn!(
                method,
                endpoint,
                status = status.as_u16(),
                message = %body,
                "Request to server failed"
            );
            return Err(Error::transport(
                Some(status.as_u16()),
                format!("{} {} returned {}: {}", method, endpoint, status, body),
            ));
        }

        Ok(decode_body(body))
    }
}

impl Transport for HttpTransport {
    fn get(&self, endpoint: &str, params: &Params<'_>) -> Result<Value> {
        let request = self.http_client.get(self.url(endpoint)).query(params);
        self.runtime.block_on(self.send("GET", endpoint, request))
    }

    fn post(&self, endpoint: &str, payload: &Value, params: &Params<'_>) -> Result<Value> {
        let request = self
            .http_client
            .post(self.url(endpoint))
            .query(params)
            .json(payload);
        self.runtime.block_on(self.send("POST", endpoint, request))
    }

    fn delete(&self, endpoint: &str, payload: &Value) -> Result<Value> {
        let request = self.http_client.delete(self.url(endpoint)).json(payload);
        self.runtime.block_on(self.send("DELETE", endpoint, request))
    }
}

fn decode_body(body: String) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&body).unwrap_or(Value::String(body))
}

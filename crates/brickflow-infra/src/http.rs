//! ReqwestNetworkClient -- concrete [`NetworkClient`] over HTTP.
//!
//! Relative endpoints are joined onto the configured base URL. Every request
//! carries the configured default headers, overridden per call by the
//! brick's own headers. The per-call timeout aborts the request.

use std::collections::BTreeMap;
use std::time::Duration;

use brickflow_core::network::{NetworkClient, NetworkError, NetworkRequest};
use brickflow_types::config::HttpSettings;
use reqwest::Method;
use serde_json::Value;

const DEFAULT_USER_AGENT: &str = concat!("brickflow/", env!("CARGO_PKG_VERSION"));

pub struct ReqwestNetworkClient {
    client: reqwest::Client,
    base_url: Option<String>,
    default_headers: BTreeMap<String, String>,
}

impl ReqwestNetworkClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, NetworkError> {
        let user_agent = settings
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| NetworkError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings
                .base_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
            default_headers: settings.default_headers.clone(),
        })
    }

    /// Absolute endpoints pass through; relative ones join the base URL.
    pub fn resolve_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        match &self.base_url {
            Some(base) => format!("{base}/{}", endpoint.trim_start_matches('/')),
            None => endpoint.to_string(),
        }
    }
}

impl NetworkClient for ReqwestNetworkClient {
    async fn send(&self, request: NetworkRequest) -> Result<Value, NetworkError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|e| {
            NetworkError::Transport(format!("invalid HTTP method '{}': {e}", request.method))
        })?;
        let url = self.resolve_url(&request.url);
        let timeout_ms = request.timeout_ms;

        let mut builder = self
            .client
            .request(method, &url)
            .timeout(Duration::from_millis(timeout_ms));
        let mut headers = self.default_headers.clone();
        headers.extend(request.headers);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }

        tracing::debug!(method = %request.method, url = %url, timeout_ms, "sending backend request");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::Timeout { timeout_ms }
            } else {
                NetworkError::Transport(format!("HTTP request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(url = %url, status = status.as_u16(), "backend request rejected");
            return Err(NetworkError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::Timeout { timeout_ms }
            } else {
                NetworkError::Transport(format!("failed to read response body: {e}"))
            }
        })?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| NetworkError::Decode(e.to_string()))
    }
}

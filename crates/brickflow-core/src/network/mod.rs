//! Network collaborator port.
//!
//! Bricks never build HTTP requests themselves beyond method, endpoint,
//! headers and JSON body; URL construction, auth and transport live behind
//! [`NetworkClient`], implemented in `brickflow-infra`.

pub mod dedup;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use brickflow_types::error::BrickError;
use serde_json::Value;

pub use dedup::CallDeduplicator;

/// One outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub json_body: Option<Value>,
    pub timeout_ms: u64,
}

impl NetworkRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            json_body: None,
            timeout_ms,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.json_body = Some(body);
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Failures a network call can end in. Cloneable so in-flight results can
/// be shared between deduplicated callers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NetworkError {
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl NetworkError {
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Status { status, .. } => *status >= 500,
            NetworkError::Timeout { .. } | NetworkError::Transport(_) => true,
            NetworkError::Decode(_) => false,
        }
    }
}

impl From<NetworkError> for BrickError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Timeout { timeout_ms } => BrickError::timeout(timeout_ms),
            other => {
                let retryable = other.is_retryable();
                BrickError::execution(other.to_string()).with_retryable(retryable)
            }
        }
    }
}

/// Sends one request and parses the JSON response. Non-2xx is an error.
pub trait NetworkClient: Send + Sync {
    fn send(
        &self,
        request: NetworkRequest,
    ) -> impl Future<Output = Result<Value, NetworkError>> + Send;
}

/// Object-safe version of [`NetworkClient`] with boxed futures.
pub trait NetworkClientDyn: Send + Sync {
    fn send_boxed(
        &self,
        request: NetworkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, NetworkError>> + Send + '_>>;
}

impl<T: NetworkClient> NetworkClientDyn for T {
    fn send_boxed(
        &self,
        request: NetworkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, NetworkError>> + Send + '_>> {
        Box::pin(self.send(request))
    }
}

/// Type-erased, cheaply cloneable network client shared by all bricks.
#[derive(Clone)]
pub struct BoxNetworkClient {
    inner: Arc<dyn NetworkClientDyn>,
}

impl BoxNetworkClient {
    pub fn new<T: NetworkClient + 'static>(client: T) -> Self {
        Self {
            inner: Arc::new(client),
        }
    }

    pub async fn send(&self, request: NetworkRequest) -> Result<Value, NetworkError> {
        self.inner.send_boxed(request).await
    }
}

impl std::fmt::Debug for BoxNetworkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNetworkClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brickflow_types::error::BrickErrorKind;

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let server: BrickError = NetworkError::Status { status: 503, body: String::new() }.into();
        let client: BrickError = NetworkError::Status { status: 404, body: "missing".into() }.into();
        assert!(server.retryable);
        assert!(!client.retryable);
        assert_eq!(client.kind, BrickErrorKind::Execution);
    }

    #[test]
    fn timeouts_map_to_timeout_kind() {
        let err: BrickError = NetworkError::Timeout { timeout_ms: 250 }.into();
        assert_eq!(err.kind, BrickErrorKind::Timeout);
        assert!(err.retryable);
    }
}

//! Fakes shared by the unit tests in this crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::network::{NetworkClient, NetworkError, NetworkRequest};

#[derive(Default)]
struct RecordingState {
    requests: Vec<NetworkRequest>,
    default: Option<Result<Value, NetworkError>>,
    routes: HashMap<String, Result<Value, NetworkError>>,
    delay: Duration,
}

/// Network client that records requests and replays canned responses.
#[derive(Clone, Default)]
pub struct RecordingClient {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(self, value: Value) -> Self {
        self.state.lock().unwrap().default = Some(Ok(value));
        self
    }

    pub fn fail_with(self, error: NetworkError) -> Self {
        self.state.lock().unwrap().default = Some(Err(error));
        self
    }

    /// Response for one URL, taking precedence over the default.
    pub fn route(self, url: &str, response: Result<Value, NetworkError>) -> Self {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(url.to_string(), response);
        self
    }

    pub fn delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn requests(&self) -> Vec<NetworkRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl NetworkClient for RecordingClient {
    async fn send(&self, request: NetworkRequest) -> Result<Value, NetworkError> {
        let (delay, response) = {
            let mut state = self.state.lock().unwrap();
            let response = state
                .routes
                .get(&request.url)
                .cloned()
                .or_else(|| state.default.clone())
                .unwrap_or(Ok(Value::Null));
            state.requests.push(request);
            (state.delay, response)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        response
    }
}

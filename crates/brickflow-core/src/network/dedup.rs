//! Sharing of identical in-flight backend calls.
//!
//! Calls are keyed by endpoint plus serialized payload. A second identical
//! call made while the first is in flight, or within the window after it
//! succeeded, receives the first call's result instead of hitting the
//! network. Failed calls are forgotten as soon as they settle so a retry
//! reaches the network; successful ones are evicted once the window has
//! passed.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::{BoxNetworkClient, NetworkError, NetworkRequest};

type SharedCall = Shared<BoxFuture<'static, Result<Value, NetworkError>>>;

struct DedupEntry {
    id: Uuid,
    call: SharedCall,
    settled_at: Arc<OnceLock<Instant>>,
}

#[derive(Clone)]
pub struct CallDeduplicator {
    window: Duration,
    entries: Arc<DashMap<String, DedupEntry>>,
}

impl CallDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn key(request: &NetworkRequest) -> String {
        let payload = request
            .json_body
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
        format!("{}|{payload}", request.url)
    }

    /// Send `request`, sharing the result with identical concurrent calls.
    pub async fn call(
        &self,
        client: &BoxNetworkClient,
        request: NetworkRequest,
    ) -> Result<Value, NetworkError> {
        let key = Self::key(&request);
        let call = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get()) {
                    let entry = self.start(client.clone(), request, key);
                    let call = entry.call.clone();
                    occupied.insert(entry);
                    call
                } else {
                    tracing::debug!(key = %occupied.key(), "sharing in-flight backend call");
                    occupied.get().call.clone()
                }
            }
            Entry::Vacant(vacant) => {
                let entry = self.start(client.clone(), request, key);
                let call = entry.call.clone();
                vacant.insert(entry);
                call
            }
        };
        call.await
    }

    /// Send without sharing; the timeout still applies.
    pub async fn call_direct(
        client: &BoxNetworkClient,
        request: NetworkRequest,
    ) -> Result<Value, NetworkError> {
        send_with_timeout(client.clone(), request).await
    }

    fn is_expired(&self, entry: &DedupEntry) -> bool {
        entry
            .settled_at
            .get()
            .is_some_and(|at| at.elapsed() >= self.window)
    }

    fn start(&self, client: BoxNetworkClient, request: NetworkRequest, key: String) -> DedupEntry {
        let id = Uuid::now_v7();
        let settled_at = Arc::new(OnceLock::new());
        let settled = settled_at.clone();
        let entries = self.entries.clone();
        let window = self.window;

        let call = async move {
            let result = send_with_timeout(client, request).await;
            let _ = settled.set(Instant::now());
            if result.is_err() {
                entries.remove_if(&key, |_, entry| entry.id == id);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    entries.remove_if(&key, |_, entry| entry.id == id);
                });
            }
            result
        }
        .boxed()
        .shared();
        // Driven on its own task so the entry settles even if every caller
        // stops waiting.
        tokio::spawn(call.clone());

        DedupEntry {
            id,
            call,
            settled_at,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CallDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_millis(2_000))
    }
}

async fn send_with_timeout(
    client: BoxNetworkClient,
    request: NetworkRequest,
) -> Result<Value, NetworkError> {
    let timeout_ms = request.timeout_ms;
    // Dropping the send future on expiry aborts the request.
    match tokio::time::timeout(Duration::from_millis(timeout_ms), client.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout { timeout_ms }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingClient;
    use serde_json::json;

    fn request(body: Value) -> NetworkRequest {
        NetworkRequest::new("POST", "/api/generate", 1_000).with_body(body)
    }

    #[tokio::test(start_paused = true)]
    async fn identical_concurrent_calls_hit_the_network_once() {
        let recorder = RecordingClient::new()
            .respond_with(json!({"url": "a.png"}))
            .delay(Duration::from_millis(50));
        let client = BoxNetworkClient::new(recorder.clone());
        let dedup = CallDeduplicator::new(Duration::from_secs(2));

        let (a, b) = tokio::join!(
            dedup.call(&client, request(json!({"p": 1}))),
            dedup.call(&client, request(json!({"p": 1}))),
        );

        assert_eq!(recorder.call_count(), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn settled_result_is_shared_within_window_only() {
        let recorder = RecordingClient::new().respond_with(json!({"ok": true}));
        let client = BoxNetworkClient::new(recorder.clone());
        let dedup = CallDeduplicator::new(Duration::from_secs(2));

        dedup.call(&client, request(json!({}))).await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        dedup.call(&client, request(json!({}))).await.unwrap();
        assert_eq!(recorder.call_count(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        dedup.call(&client, request(json!({}))).await.unwrap();
        assert_eq!(recorder.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_entries_are_evicted_after_the_window() {
        let recorder = RecordingClient::new().respond_with(json!({}));
        let client = BoxNetworkClient::new(recorder.clone());
        let dedup = CallDeduplicator::new(Duration::from_secs(2));

        for n in 0..50 {
            dedup.call(&client, request(json!({ "n": n }))).await.unwrap();
        }
        assert_eq!(dedup.len(), 50);

        tokio::time::sleep(Duration::from_secs(3)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(dedup.is_empty());

        dedup.call(&client, request(json!({ "n": 0 }))).await.unwrap();
        assert_eq!(dedup.len(), 1);
        assert_eq!(recorder.call_count(), 51);
    }

    #[tokio::test(start_paused = true)]
    async fn different_payloads_are_not_shared() {
        let recorder = RecordingClient::new().respond_with(json!({}));
        let client = BoxNetworkClient::new(recorder.clone());
        let dedup = CallDeduplicator::default();

        dedup.call(&client, request(json!({"p": 1}))).await.unwrap();
        dedup.call(&client, request(json!({"p": 2}))).await.unwrap();

        assert_eq!(recorder.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let recorder = RecordingClient::new().fail_with(NetworkError::Status {
            status: 500,
            body: "down".into(),
        });
        let client = BoxNetworkClient::new(recorder.clone());
        let dedup = CallDeduplicator::default();

        assert!(dedup.call(&client, request(json!({}))).await.is_err());
        assert!(dedup.call(&client, request(json!({}))).await.is_err());

        assert_eq!(recorder.call_count(), 2);
        assert!(dedup.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let recorder = RecordingClient::new()
            .respond_with(json!({}))
            .delay(Duration::from_secs(10));
        let client = BoxNetworkClient::new(recorder);

        let err = CallDeduplicator::call_direct(
            &client,
            NetworkRequest::new("GET", "/slow", 100),
        )
        .await
        .unwrap_err();

        assert_eq!(err, NetworkError::Timeout { timeout_ms: 100 });
    }
}

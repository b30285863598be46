//! The shared workflow data store.
//!
//! One keyed mapping per run, shared by every active brick. Top-level writes
//! replace the previous value for that key; nothing is silently dropped.
//! Readers that need a value which has not been produced yet park on a
//! per-key `watch` channel instead of polling.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use brickflow_types::error::BrickError;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Default)]
struct DataInner {
    values: RwLock<Map<String, Value>>,
    /// key -> brick id of the first brick that wrote it.
    owners: DashMap<String, String>,
    watchers: DashMap<String, watch::Sender<u64>>,
}

/// Handle onto the run's data. Cloning shares the same store.
#[derive(Clone, Default)]
pub struct WorkflowData {
    inner: Arc<DataInner>,
}

impl WorkflowData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        let data = Self::default();
        data.replace(values);
        data
    }

    /// Value at a dot path (`result.images.0.url`).
    pub fn get(&self, path: &str) -> Option<Value> {
        let values = self.inner.values.read().unwrap_or_else(PoisonError::into_inner);
        lookup_path(&values, path).cloned()
    }

    /// Write a top-level key.
    pub fn set(&self, key: &str, value: Value) {
        {
            let mut values = self.inner.values.write().unwrap_or_else(PoisonError::into_inner);
            values.insert(key.to_string(), value);
        }
        self.notify(key);
    }

    /// Write a top-level key on behalf of a brick.
    ///
    /// Keys have a single writer by convention; a write from a second brick
    /// still lands but is logged.
    pub fn set_as(&self, brick_id: &str, key: &str, value: Value) {
        let owner = self
            .inner
            .owners
            .entry(key.to_string())
            .or_insert_with(|| brick_id.to_string())
            .clone();
        if owner != brick_id {
            tracing::warn!(key, owner = %owner, writer = brick_id, "workflow data key written by a second brick");
        }
        self.set(key, value);
    }

    /// Shallow-merge top-level keys.
    pub fn merge(&self, updates: Map<String, Value>) {
        let keys: Vec<String> = updates.keys().cloned().collect();
        {
            let mut values = self.inner.values.write().unwrap_or_else(PoisonError::into_inner);
            values.extend(updates);
        }
        for key in keys {
            self.notify(&key);
        }
    }

    /// Replace the whole store, e.g. when resuming from a snapshot.
    pub fn replace(&self, values: Map<String, Value>) {
        let keys: Vec<String> = values.keys().cloned().collect();
        {
            let mut current = self.inner.values.write().unwrap_or_else(PoisonError::into_inner);
            *current = values;
        }
        self.inner.owners.clear();
        for key in keys {
            self.notify(&key);
        }
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.values.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Wait until `path` holds a non-null value, for at most `timeout`.
    pub async fn wait_for(&self, path: &str, timeout: Duration) -> Result<Value, BrickError> {
        let deadline = Instant::now() + timeout;
        let mut changes = self.watch(top_level_key(path));
        loop {
            // Subscribed before the check, so a write in between is not missed.
            match self.get(path) {
                Some(value) if !value.is_null() => return Ok(value),
                _ => {}
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => {
                    tracing::debug!(path, ?timeout, "data path never became available");
                    return Err(BrickError::data_unavailable(path));
                }
            }
        }
    }

    fn watch(&self, key: &str) -> watch::Receiver<u64> {
        self.inner
            .watchers
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    fn notify(&self, key: &str) {
        if let Some(sender) = self.inner.watchers.get(key) {
            sender.send_modify(|version| *version += 1);
        }
    }
}

impl std::fmt::Debug for WorkflowData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowData")
            .field("values", &self.snapshot())
            .finish()
    }
}

/// Strip the optional `workflowData.` prefix.
pub fn normalize_path(path: &str) -> &str {
    path.trim().strip_prefix("workflowData.").unwrap_or(path.trim())
}

fn top_level_key(path: &str) -> &str {
    let path = normalize_path(path);
    path.split('.').next().unwrap_or(path)
}

/// Walk a dot path through objects and array indices.
pub fn lookup_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let path = normalize_path(path);
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_walks_objects_and_arrays() {
        let data = WorkflowData::new();
        data.set("result", json!({"images": [{"url": "a.png"}, {"url": "b.png"}]}));

        assert_eq!(data.get("result.images.1.url"), Some(json!("b.png")));
        assert_eq!(data.get("workflowData.result.images.0.url"), Some(json!("a.png")));
        assert_eq!(data.get("result.images.9.url"), None);
        assert_eq!(data.get("missing"), None);
    }

    #[test]
    fn later_writes_win_and_merge_is_shallow() {
        let data = WorkflowData::new();
        data.set("name", json!("Ada"));
        data.set("profile", json!({"age": 36}));

        let mut updates = Map::new();
        updates.insert("name".into(), json!("Grace"));
        updates.insert("profile".into(), json!({"city": "NYC"}));
        data.merge(updates);

        assert_eq!(data.get("name"), Some(json!("Grace")));
        assert_eq!(data.get("profile"), Some(json!({"city": "NYC"})));
    }

    #[test]
    fn second_writer_still_lands() {
        let data = WorkflowData::new();
        data.set_as("a", "shared", json!(1));
        data.set_as("b", "shared", json!(2));
        assert_eq!(data.get("shared"), Some(json!(2)));
    }

    #[tokio::test]
    async fn wait_for_wakes_on_write() {
        let data = WorkflowData::new();
        let writer = data.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set("result", json!({"url": "x.png"}));
        });

        let value = data
            .wait_for("result.url", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value, json!("x.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_fails_after_bounded_wait() {
        let data = WorkflowData::new();
        let err = data
            .wait_for("result.url", Duration::from_millis(5_000))
            .await
            .unwrap_err();
        assert_eq!(err.kind, brickflow_types::error::BrickErrorKind::DataUnavailable);
        assert!(err.message.contains("result.url"));
    }
}

//! Checkpoints handed to the persistence collaborator.
//!
//! Submissions are fire-and-forget: the orchestrator never waits for them.
//! For a given workflow at most one submission is in flight; snapshots
//! requested meanwhile are coalesced and only the latest one is submitted
//! once the current submission settles.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use brickflow_types::workflow::WorkflowSnapshot;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CheckpointError {
    #[error("snapshot store error: {0}")]
    Store(String),

    #[error("snapshot is corrupt: {0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Persistence collaborator for run snapshots.
pub trait SnapshotStore: Send + Sync {
    fn submit_snapshot(
        &self,
        snapshot: &WorkflowSnapshot,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Latest snapshot for a workflow, if any.
    fn load_snapshot(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Option<WorkflowSnapshot>, CheckpointError>> + Send;
}

/// Object-safe version of [`SnapshotStore`] with boxed futures.
pub trait SnapshotStoreDyn: Send + Sync {
    fn submit_snapshot_boxed<'a>(
        &'a self,
        snapshot: &'a WorkflowSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>>;

    fn load_snapshot_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WorkflowSnapshot>, CheckpointError>> + Send + 'a>>;
}

impl<T: SnapshotStore> SnapshotStoreDyn for T {
    fn submit_snapshot_boxed<'a>(
        &'a self,
        snapshot: &'a WorkflowSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>> {
        Box::pin(self.submit_snapshot(snapshot))
    }

    fn load_snapshot_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WorkflowSnapshot>, CheckpointError>> + Send + 'a>>
    {
        Box::pin(self.load_snapshot(workflow_id))
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SaveSlot {
    queued: Option<WorkflowSnapshot>,
}

/// Coalescing front for a [`SnapshotStore`]. Cloning shares the store and
/// the in-flight bookkeeping.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn SnapshotStoreDyn>,
    slots: Arc<DashMap<String, SaveSlot>>,
    idle: Arc<Notify>,
}

impl CheckpointManager {
    pub fn new<S: SnapshotStore + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(store),
            slots: Arc::new(DashMap::new()),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Submit a snapshot without waiting for the store.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, snapshot: WorkflowSnapshot) {
        let key = snapshot.workflow_id.clone();
        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                tracing::debug!(workflow_id = %key, step = %snapshot.current_step, "coalescing checkpoint");
                slot.get_mut().queued = Some(snapshot);
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(SaveSlot::default());
            }
        }

        let manager = self.clone();
        tokio::spawn(async move { manager.drain(key, snapshot).await });
    }

    async fn drain(&self, key: String, first: WorkflowSnapshot) {
        let mut snapshot = first;
        loop {
            match self.store.submit_snapshot_boxed(&snapshot).await {
                Ok(()) => tracing::debug!(
                    workflow_id = %key,
                    step = %snapshot.current_step,
                    "checkpoint saved"
                ),
                Err(e) => tracing::warn!(workflow_id = %key, error = %e, "checkpoint submission failed"),
            }

            if self
                .slots
                .remove_if(&key, |_, slot| slot.queued.is_none())
                .is_some()
            {
                self.idle.notify_waiters();
                return;
            }
            let next = self
                .slots
                .get_mut(&key)
                .and_then(|mut slot| slot.queued.take());
            match next {
                Some(next) => snapshot = next,
                None => {
                    // Slot vanished between the two lookups; nothing is queued.
                    self.idle.notify_waiters();
                    return;
                }
            }
        }
    }

    pub async fn load_latest(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowSnapshot>, CheckpointError> {
        self.store.load_snapshot_boxed(workflow_id).await
    }

    /// Wait until no submission is in flight or queued.
    pub async fn flush(&self) {
        loop {
            let idle = self.idle.notified();
            if self.slots.is_empty() {
                return;
            }
            idle.await;
        }
    }

    pub fn is_idle(&self) -> bool {
        self.slots.is_empty()
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("in_flight", &self.slots.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Keeps every submitted snapshot in memory. Useful for embedding and tests.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    history: Arc<Mutex<Vec<WorkflowSnapshot>>>,
    delay: Option<std::time::Duration>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every submission take `delay`.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every snapshot submitted so far, oldest first.
    pub fn history(&self) -> Vec<WorkflowSnapshot> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    async fn submit_snapshot(&self, snapshot: &WorkflowSnapshot) -> Result<(), CheckpointError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowSnapshot>, CheckpointError> {
        Ok(self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|s| s.workflow_id == workflow_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;
    use std::time::Duration;
    use uuid::Uuid;

    fn snapshot(step: &str) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: "wf".into(),
            run_id: Uuid::now_v7(),
            current_step: step.into(),
            data: Map::new(),
            chat_history: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_during_flight_are_coalesced_to_the_latest() {
        let store = InMemorySnapshotStore::new().with_delay(Duration::from_millis(100));
        let manager = CheckpointManager::new(store.clone());

        manager.submit(snapshot("one"));
        tokio::task::yield_now().await;
        manager.submit(snapshot("two"));
        manager.submit(snapshot("three"));
        manager.flush().await;

        let steps: Vec<_> = store.history().into_iter().map(|s| s.current_step).collect();
        assert_eq!(steps, vec!["one", "three"]);
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn load_latest_returns_newest_snapshot() {
        let store = InMemorySnapshotStore::new();
        let manager = CheckpointManager::new(store);

        manager.submit(snapshot("one"));
        manager.flush().await;
        manager.submit(snapshot("two"));
        manager.flush().await;

        let latest = manager.load_latest("wf").await.unwrap().unwrap();
        assert_eq!(latest.current_step, "two");
        assert!(manager.load_latest("other").await.unwrap().is_none());
    }

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        async fn submit_snapshot(&self, _: &WorkflowSnapshot) -> Result<(), CheckpointError> {
            Err(CheckpointError::Store("disk full".into()))
        }

        async fn load_snapshot(&self, _: &str) -> Result<Option<WorkflowSnapshot>, CheckpointError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn failed_submissions_do_not_wedge_the_slot() {
        let manager = CheckpointManager::new(FailingStore);
        manager.submit(snapshot("one"));
        manager.flush().await;
        manager.submit(snapshot("two"));
        manager.flush().await;
        assert!(manager.is_idle());
    }
}

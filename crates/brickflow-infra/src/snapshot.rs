//! File-backed [`SnapshotStore`]: one JSON document per workflow.
//!
//! Each submission overwrites `<dir>/<workflow_id>.json`. The file is
//! written to a temporary sibling first and renamed into place so a reader
//! never sees a half-written snapshot.

use std::path::{Path, PathBuf};

use brickflow_core::workflow::{CheckpointError, SnapshotStore};
use brickflow_types::workflow::WorkflowSnapshot;

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, workflow_id: &str) -> Result<PathBuf, CheckpointError> {
        if workflow_id.is_empty()
            || workflow_id.contains(['/', '\\'])
            || workflow_id.starts_with('.')
        {
            return Err(CheckpointError::Store(format!(
                "workflow id '{workflow_id}' cannot be used as a file name"
            )));
        }
        Ok(self.dir.join(format!("{workflow_id}.json")))
    }
}

impl SnapshotStore for FileSnapshotStore {
    async fn submit_snapshot(&self, snapshot: &WorkflowSnapshot) -> Result<(), CheckpointError> {
        let path = self.path_for(&snapshot.workflow_id)?;
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| CheckpointError::Store(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))?;

        tracing::debug!(
            workflow_id = %snapshot.workflow_id,
            run_id = %snapshot.run_id,
            path = %path.display(),
            "snapshot written"
        );
        Ok(())
    }

    async fn load_snapshot(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowSnapshot>, CheckpointError> {
        let path = self.path_for(workflow_id)?;
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CheckpointError::Store(err.to_string())),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn snapshot(step: &str) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: "onboarding".into(),
            run_id: Uuid::now_v7(),
            current_step: step.into(),
            data: json!({"name": "Ada"}).as_object().cloned().unwrap(),
            chat_history: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn submit_then_load_returns_the_latest_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path().join("snapshots"));

        store.submit_snapshot(&snapshot("ask")).await.unwrap();
        let latest = snapshot("review");
        store.submit_snapshot(&latest).await.unwrap();

        assert_eq!(store.load_snapshot("onboarding").await.unwrap(), Some(latest));
        assert!(!tmp.path().join("snapshots/onboarding.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_snapshot_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path());
        assert_eq!(store.load_snapshot("nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_reported() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("broken.json"), "{ nope").await.unwrap();
        let store = FileSnapshotStore::new(tmp.path());

        assert!(matches!(
            store.load_snapshot("broken").await,
            Err(CheckpointError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(tmp.path());
        assert!(store.load_snapshot("../escape").await.is_err());
    }
}

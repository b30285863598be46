//! Directory-backed [`WorkflowSource`]: `<dir>/<id>.json`.

use std::path::{Path, PathBuf};

use brickflow_core::workflow::loader::parse_workflow_json;
use brickflow_core::workflow::{WorkflowError, WorkflowSource};
use brickflow_types::workflow::WorkflowConfig;

#[derive(Debug, Clone)]
pub struct FileWorkflowSource {
    dir: PathBuf,
}

impl FileWorkflowSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl WorkflowSource for FileWorkflowSource {
    async fn fetch(&self, workflow_id: &str) -> Result<Option<String>, WorkflowError> {
        if workflow_id.contains(['/', '\\']) || workflow_id.starts_with('.') {
            return Ok(None);
        }
        let path = self.dir.join(format!("{workflow_id}.json"));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WorkflowError::Source(format!("{}: {err}", path.display()))),
        }
    }

    async fn list(&self) -> Result<Vec<String>, WorkflowError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(WorkflowError::Source(err.to_string())),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkflowError::Source(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Load and validate a single workflow file.
pub async fn load_workflow_file(path: &Path) -> Result<WorkflowConfig, WorkflowError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| WorkflowError::Source(format!("{}: {e}", path.display())))?;
    parse_workflow_json(&content)
}

/// Every valid workflow file in a directory, sorted by path.
///
/// Files that fail to parse or validate are skipped with a warning.
pub async fn discover_workflows(dir: &Path) -> Result<Vec<(PathBuf, WorkflowConfig)>, WorkflowError> {
    let source = FileWorkflowSource::new(dir);
    let mut found = Vec::new();
    for id in source.list().await? {
        let path = dir.join(format!("{id}.json"));
        match load_workflow_file(&path).await {
            Ok(workflow) => found.push((path, workflow)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable workflow file"),
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn document(id: &str) -> String {
        json!({
            "id": id,
            "name": id,
            "initialStep": "only",
            "steps": { "only": { "id": "only", "bricks": [] } }
        })
        .to_string()
    }

    #[tokio::test]
    async fn fetch_reads_by_id() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("signup.json"), document("signup"))
            .await
            .unwrap();
        let source = FileWorkflowSource::new(tmp.path());

        assert!(source.fetch("signup").await.unwrap().is_some());
        assert!(source.fetch("missing").await.unwrap().is_none());
        assert!(source.fetch("../signup").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_json_stems_sorted() {
        let tmp = TempDir::new().unwrap();
        for name in ["b.json", "a.json", "notes.txt"] {
            tokio::fs::write(tmp.path().join(name), "{}").await.unwrap();
        }
        let source = FileWorkflowSource::new(tmp.path());

        assert_eq!(source.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn discover_skips_invalid_files() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("good.json"), document("good"))
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("bad.json"), r#"{"id": "bad"}"#)
            .await
            .unwrap();

        let found = discover_workflows(tmp.path()).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.id, "good");
    }

    #[tokio::test]
    async fn discover_nonexistent_dir_is_empty() {
        let found = discover_workflows(Path::new("/definitely/not/here")).await.unwrap();
        assert!(found.is_empty());
    }
}

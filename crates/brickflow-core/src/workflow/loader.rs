//! Workflow document parsing, structural validation and the catalog.
//!
//! Validation runs over the raw JSON document so that every violation can be
//! reported at once, including ones that would stop typed deserialization
//! (a `bricks` field that is not a list, a brick without a `type`).

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use brickflow_types::workflow::WorkflowConfig;
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::brick::{BrickRegistry, RegistryError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Not JSON, or JSON that does not fit the document shape.
    #[error("parse error: {0}")]
    Parse(String),

    /// Every structural violation found in the document.
    #[error("invalid workflow: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("workflow '{0}' not found")]
    NotFound(String),

    /// The workflow source failed to produce a document.
    #[error("workflow source error: {0}")]
    Source(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Collect every structural violation in a workflow document.
pub fn validate_document(doc: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(root) = doc.as_object() else {
        return vec!["workflow document must be a JSON object".to_string()];
    };

    for field in ["id", "name"] {
        if root.get(field).and_then(Value::as_str).is_none() {
            violations.push(format!("workflow is missing '{field}'"));
        }
    }

    let empty = Map::new();
    let steps = match root.get("steps") {
        Some(Value::Object(steps)) => steps,
        Some(_) => {
            violations.push("'steps' must be an object keyed by step id".to_string());
            &empty
        }
        None => {
            violations.push("workflow is missing 'steps'".to_string());
            &empty
        }
    };

    match root.get("initialStep").and_then(Value::as_str) {
        None => violations.push("workflow is missing 'initialStep'".to_string()),
        Some(initial) if !steps.contains_key(initial) => violations.push(format!(
            "initialStep '{initial}' does not exist in steps"
        )),
        Some(_) => {}
    }

    let mut brick_owners: HashMap<&str, &str> = HashMap::new();
    for (key, step) in steps {
        let Some(step) = step.as_object() else {
            violations.push(format!("step '{key}' must be an object"));
            continue;
        };
        match step.get("id").and_then(Value::as_str) {
            None => violations.push(format!("step '{key}' is missing 'id'")),
            Some(id) if id != key.as_str() => {
                violations.push(format!("step '{key}' declares a different id '{id}'"))
            }
            Some(_) => {}
        }

        let mut targets: Vec<(&str, &str)> = Vec::new();
        match step.get("nextStep") {
            None | Some(Value::Null) => {}
            Some(Value::String(target)) => targets.push(("nextStep", target.as_str())),
            Some(Value::Object(computed)) => {
                if computed.get("expression").and_then(Value::as_str).is_none() {
                    violations.push(format!(
                        "step '{key}': computed nextStep needs a string 'expression'"
                    ));
                }
            }
            Some(_) => violations.push(format!(
                "step '{key}': nextStep must be a step id or {{\"expression\": ...}}"
            )),
        }

        match step.get("conditions") {
            None | Some(Value::Null) => {}
            Some(Value::Array(conditions)) => {
                for (index, condition) in conditions.iter().enumerate() {
                    if condition.get("condition").and_then(Value::as_str).is_none() {
                        violations.push(format!(
                            "step '{key}': condition #{index} is missing 'condition'"
                        ));
                    }
                    match condition.get("nextStep").and_then(Value::as_str) {
                        Some(target) => targets.push(("condition nextStep", target)),
                        None => violations.push(format!(
                            "step '{key}': condition #{index} is missing 'nextStep'"
                        )),
                    }
                }
            }
            Some(_) => violations.push(format!("step '{key}': conditions must be a list")),
        }

        match step.get("bricks") {
            Some(Value::Array(bricks)) => {
                for (index, brick) in bricks.iter().enumerate() {
                    let id = brick.get("id").and_then(Value::as_str);
                    if id.is_none() {
                        violations.push(format!("step '{key}': brick #{index} is missing 'id'"));
                    }
                    if brick.get("type").and_then(Value::as_str).is_none() {
                        violations.push(format!(
                            "step '{key}': brick '{}' is missing 'type'",
                            id.unwrap_or("#")
                        ));
                    }
                    if let Some(id) = id {
                        if let Some(owner) = brick_owners.insert(id, key.as_str()) {
                            violations.push(format!(
                                "brick id '{id}' is used in step '{owner}' and step '{key}'"
                            ));
                        }
                    }
                    for field in ["nextStep", "cancelStep"] {
                        if let Some(target) = brick.get(field).and_then(Value::as_str) {
                            targets.push((field, target));
                        }
                    }
                    if let Some(buttons) = brick.get("buttons").and_then(Value::as_array) {
                        targets.extend(
                            buttons
                                .iter()
                                .filter_map(|b| b.get("nextStep").and_then(Value::as_str))
                                .map(|target| ("button nextStep", target)),
                        );
                    }
                }
            }
            Some(_) => violations.push(format!("step '{key}': bricks must be a list")),
            None => violations.push(format!("step '{key}' is missing 'bricks'")),
        }

        for (field, target) in targets {
            if !steps.contains_key(target) {
                violations.push(format!(
                    "step '{key}': {field} '{target}' does not exist in steps"
                ));
            }
        }
    }

    violations
}

/// Parse and validate a workflow document.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowConfig, WorkflowError> {
    let doc: Value = serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    parse_workflow_value(doc)
}

/// Validate an already-decoded document and convert it.
pub fn parse_workflow_value(doc: Value) -> Result<WorkflowConfig, WorkflowError> {
    let violations = validate_document(&doc);
    if !violations.is_empty() {
        return Err(WorkflowError::Invalid(violations));
    }
    let workflow: WorkflowConfig =
        serde_json::from_value(doc).map_err(|e| WorkflowError::Parse(e.to_string()))?;

    for conflict in writer_conflicts(&workflow) {
        tracing::warn!(
            workflow_id = %workflow.id,
            key = %conflict.key,
            bricks = ?conflict.brick_ids,
            "data key has more than one writer"
        );
    }
    Ok(workflow)
}

/// A data key written by more than one brick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConflict {
    pub key: String,
    pub brick_ids: Vec<String>,
}

/// Keys written by more than one brick, sorted by key.
pub fn writer_conflicts(workflow: &WorkflowConfig) -> Vec<WriterConflict> {
    let mut writers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (_, brick) in workflow.all_bricks() {
        for key in brick.written_keys() {
            writers.entry(key).or_default().push(brick.id.clone());
        }
    }
    writers
        .into_iter()
        .filter(|(_, bricks)| bricks.len() > 1)
        .map(|(key, mut brick_ids)| {
            brick_ids.sort();
            WriterConflict { key, brick_ids }
        })
        .collect()
}

/// Check every brick against the registry: its type must be registered and
/// its settings must pass the type's static check.
pub fn check_bricks(workflow: &WorkflowConfig, registry: &BrickRegistry) -> Vec<RegistryError> {
    workflow
        .all_bricks()
        .filter_map(|(_, brick)| registry.check_config(brick).err())
        .collect()
}

// ---------------------------------------------------------------------------
// Source port and catalog
// ---------------------------------------------------------------------------

/// Where workflow documents come from.
pub trait WorkflowSource: Send + Sync {
    /// Raw JSON for one workflow. `Ok(None)` when the id is unknown.
    fn fetch(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Option<String>, WorkflowError>> + Send;

    /// Ids of every workflow the source can provide.
    fn list(&self) -> impl Future<Output = Result<Vec<String>, WorkflowError>> + Send;
}

/// Loads, validates and caches workflows by id.
pub struct WorkflowCatalog<S: WorkflowSource> {
    source: S,
    registry: Arc<BrickRegistry>,
    cache: DashMap<String, Arc<WorkflowConfig>>,
}

impl<S: WorkflowSource> WorkflowCatalog<S> {
    pub fn new(source: S, registry: Arc<BrickRegistry>) -> Self {
        Self {
            source,
            registry,
            cache: DashMap::new(),
        }
    }

    /// Cached workflow, loading it through the source on first use.
    ///
    /// A workflow naming an unregistered brick type or carrying a brick
    /// config its type rejects is not cached and fails to load.
    pub async fn get(&self, workflow_id: &str) -> Result<Arc<WorkflowConfig>, WorkflowError> {
        if let Some(cached) = self.cache.get(workflow_id) {
            return Ok(cached.clone());
        }

        let json = self
            .source
            .fetch(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        let workflow = parse_workflow_json(&json)?;
        if workflow.id != workflow_id {
            return Err(WorkflowError::Invalid(vec![format!(
                "document for '{workflow_id}' declares id '{}'",
                workflow.id
            )]));
        }
        if let Some(error) = check_bricks(&workflow, &self.registry).into_iter().next() {
            return Err(error.into());
        }

        let workflow = Arc::new(workflow);
        self.cache.insert(workflow_id.to_string(), workflow.clone());
        tracing::debug!(workflow_id, steps = workflow.steps.len(), "workflow loaded");
        Ok(workflow)
    }

    pub async fn list(&self) -> Result<Vec<String>, WorkflowError> {
        self.source.list().await
    }

    /// Drop a cached workflow so the next `get` reloads it.
    pub fn invalidate(&self, workflow_id: &str) -> bool {
        self.cache.remove(workflow_id).is_some()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

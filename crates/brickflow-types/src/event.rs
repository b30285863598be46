//! Topic names and payload schemas for the brickflow event bus.
//!
//! Bricks and the orchestrator never call each other directly: they talk
//! through string topics of the form `<kind>:<brick_id>`. The helpers here
//! keep topic construction and parsing in one place, and the payload structs
//! give each topic a fixed JSON shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Emitted after the orchestrator enters a step.
pub const WORKFLOW_STEP_TOPIC: &str = "workflow:step";
/// Emitted once when a run reaches a step with no transition.
pub const WORKFLOW_FINISHED_TOPIC: &str = "workflow:finished";
/// Emitted when a `stop` error policy ends the run.
pub const WORKFLOW_FAILED_TOPIC: &str = "workflow:failed";
/// Scope of the request/response overlay channel.
pub const OVERLAY_SCOPE: &str = "overlay";

/// Per-brick topic kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrickTopic {
    Data,
    Complete,
    Error,
    Progress,
    Status,
    Trigger,
}

impl BrickTopic {
    pub fn prefix(self) -> &'static str {
        match self {
            BrickTopic::Data => "data",
            BrickTopic::Complete => "complete",
            BrickTopic::Error => "error",
            BrickTopic::Progress => "progress",
            BrickTopic::Status => "status",
            BrickTopic::Trigger => "trigger",
        }
    }

    /// `complete` + `name_input` -> `complete:name_input`.
    pub fn for_brick(self, brick_id: &str) -> String {
        format!("{}:{brick_id}", self.prefix())
    }

    /// Split a per-brick topic into its kind and brick id.
    pub fn parse(topic: &str) -> Option<(BrickTopic, &str)> {
        let (prefix, id) = topic.split_once(':')?;
        let kind = match prefix {
            "data" => BrickTopic::Data,
            "complete" => BrickTopic::Complete,
            "error" => BrickTopic::Error,
            "progress" => BrickTopic::Progress,
            "status" => BrickTopic::Status,
            "trigger" => BrickTopic::Trigger,
            _ => return None,
        };
        if id.is_empty() {
            return None;
        }
        Some((kind, id))
    }
}

/// Payload of `complete:<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Transition hint; takes precedence over step conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Echo recorded in the chat history as a user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    /// Top-level keys merged into the workflow data by the orchestrator.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub updates: Map<String, Value>,
}

impl CompletePayload {
    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn next_step(mut self, step: Option<String>) -> Self {
        self.next_step = step;
        self
    }
}

/// Payload of `progress:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    /// Fraction in `0.0..=1.0`.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    /// The item just produced, for batch generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
}

impl ProgressPayload {
    pub fn fraction(progress: f64) -> Self {
        Self {
            progress: progress.clamp(0.0, 1.0),
            message: None,
            completed: None,
            total: None,
            item: None,
        }
    }

    pub fn counted(completed: usize, total: usize) -> Self {
        let progress = if total == 0 {
            1.0
        } else {
            completed as f64 / total as f64
        };
        Self {
            completed: Some(completed),
            total: Some(total),
            ..Self::fraction(progress)
        }
    }
}

/// Payload of `status:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: crate::brick::BrickState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of `workflow:step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepChangedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    pub generation: u64,
}

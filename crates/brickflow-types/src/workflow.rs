//! Workflow documents, run snapshots and chat history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::brick::BrickConfig;

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A validated, immutable workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub initial_step: String,
    pub steps: BTreeMap<String, StepConfig>,
}

impl WorkflowConfig {
    pub fn step(&self, id: &str) -> Option<&StepConfig> {
        self.steps.get(id)
    }

    /// Steps sorted by their declared ordinal, then id.
    pub fn ordered_steps(&self) -> Vec<&StepConfig> {
        let mut steps: Vec<&StepConfig> = self.steps.values().collect();
        steps.sort_by(|a, b| a.step_number.cmp(&b.step_number).then(a.id.cmp(&b.id)));
        steps
    }

    /// Every brick in the workflow along with the step that declares it.
    pub fn all_bricks(&self) -> impl Iterator<Item = (&StepConfig, &BrickConfig)> {
        self.steps
            .values()
            .flat_map(|step| step.bricks.iter().map(move |brick| (step, brick)))
    }
}

/// One node of the step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    pub id: String,
    #[serde(default)]
    pub step_number: u32,
    pub bricks: Vec<BrickConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<NextStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StepCondition>,
    /// Interpolated and recorded in the chat history on entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_message: Option<String>,
    #[serde(default)]
    pub auto_save: bool,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

impl StepConfig {
    /// Statically known step ids this step can transition to.
    pub fn transition_targets(&self) -> Vec<&str> {
        let mut targets = Vec::new();
        if let Some(NextStep::Static(step)) = &self.next_step {
            targets.push(step.as_str());
        }
        targets.extend(self.conditions.iter().map(|c| c.next_step.as_str()));
        for brick in &self.bricks {
            targets.extend(brick.next_step_refs());
        }
        targets
    }
}

/// Static target or an expression evaluated over the workflow data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextStep {
    Static(String),
    Computed { expression: String },
}

/// `{ condition, nextStep }`: first true condition in declaration order wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCondition {
    pub condition: String,
    pub next_step: String,
}

/// What an unrecovered brick error does to the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stay on the step; the brick may be retried.
    #[default]
    Continue,
    /// Fail the run.
    Stop,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    Assistant,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brick_id: Option<String>,
}

impl ChatMessage {
    pub fn assistant(content: impl Into<String>, step_id: &str) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            step_id: Some(step_id.to_string()),
            brick_id: None,
        }
    }

    pub fn user(content: impl Into<String>, step_id: &str, brick_id: &str) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            step_id: Some(step_id.to_string()),
            brick_id: Some(brick_id.to_string()),
        }
    }
}

/// What is handed to the persistence collaborator on each checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub current_step: String,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> WorkflowConfig {
        serde_json::from_value(json!({
            "id": "onboarding",
            "name": "Onboarding",
            "initialStep": "ask",
            "steps": {
                "ask": {
                    "id": "ask",
                    "stepNumber": 1,
                    "bricks": [{ "id": "name", "type": "user_input", "saveConfig": { "key": "name" } }],
                    "conditions": [{ "condition": "name == 'admin'", "nextStep": "admin" }],
                    "nextStep": "done"
                },
                "admin": { "id": "admin", "stepNumber": 2, "bricks": [],
                           "nextStep": { "expression": "'done'" } },
                "done": { "id": "done", "stepNumber": 3, "bricks": [], "errorPolicy": "stop" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn next_step_accepts_static_and_computed_forms() {
        let config = sample();
        assert_eq!(
            config.step("ask").unwrap().next_step,
            Some(NextStep::Static("done".into()))
        );
        assert!(matches!(
            config.step("admin").unwrap().next_step,
            Some(NextStep::Computed { .. })
        ));
        assert_eq!(config.step("done").unwrap().error_policy, ErrorPolicy::Stop);
    }

    #[test]
    fn transition_targets_include_conditions() {
        let config = sample();
        assert_eq!(
            config.step("ask").unwrap().transition_targets(),
            vec!["done", "admin"]
        );
    }

    #[test]
    fn ordered_steps_follow_step_number() {
        let ids: Vec<_> = sample().ordered_steps().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["ask", "admin", "done"]);
    }
}

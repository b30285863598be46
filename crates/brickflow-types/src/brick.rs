//! Brick configuration, lifecycle state and execution results.
//!
//! A `BrickConfig` is the raw declarative entry from the workflow document:
//! an `id`, a `type` tag and the remaining type-specific settings. Built-in
//! brick types parse those settings into the typed structs defined here;
//! externally registered types are free to interpret them however they like.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrickError;
use crate::validation::ValidationRule;

// ---------------------------------------------------------------------------
// Raw configuration
// ---------------------------------------------------------------------------

/// Declarative configuration of a single brick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrickConfig {
    /// Unique within the workflow. The only handle other parties use.
    pub id: String,
    /// Registered brick type name (e.g. `backend_call`).
    #[serde(rename = "type")]
    pub brick_type: String,
    /// Type-specific settings.
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl BrickConfig {
    /// Build a config from an id, type and a JSON object of settings.
    ///
    /// Non-object `settings` values are ignored.
    pub fn new(id: impl Into<String>, brick_type: impl Into<String>, settings: Value) -> Self {
        let settings = match settings {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            brick_type: brick_type.into(),
            settings,
        }
    }

    /// Parse the settings as the typed configuration of a brick type.
    pub fn parse_settings<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.settings.clone()))
    }

    /// The built-in type this config names, if any.
    pub fn builtin_type(&self) -> Option<BuiltinBrickType> {
        self.brick_type.parse().ok()
    }

    /// Step ids this brick may request a transition to.
    pub fn next_step_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        for key in ["nextStep", "cancelStep"] {
            if let Some(step) = self.settings.get(key).and_then(Value::as_str) {
                refs.push(step);
            }
        }
        if let Some(buttons) = self.settings.get("buttons").and_then(Value::as_array) {
            refs.extend(
                buttons
                    .iter()
                    .filter_map(|b| b.get("nextStep").and_then(Value::as_str)),
            );
        }
        refs
    }

    /// Top-level workflow data keys this brick writes.
    pub fn written_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for binding in ["saveConfig", "saveResponse"] {
            if let Some(key) = self
                .settings
                .get(binding)
                .and_then(|b| b.get("key"))
                .and_then(Value::as_str)
            {
                keys.push(key.to_string());
            }
        }
        if let Some(key) = self.settings.get("saveKey").and_then(Value::as_str) {
            keys.push(key.to_string());
        }
        keys
    }
}

/// The brick types that ship with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinBrickType {
    Llm,
    UserInput,
    BackendCall,
    WaitingDisplay,
    JsonDisplay,
    MediaDisplay,
    Confirmation,
    BatchMediaDisplay,
    Background,
}

impl BuiltinBrickType {
    pub const ALL: [BuiltinBrickType; 9] = [
        BuiltinBrickType::Llm,
        BuiltinBrickType::UserInput,
        BuiltinBrickType::BackendCall,
        BuiltinBrickType::WaitingDisplay,
        BuiltinBrickType::JsonDisplay,
        BuiltinBrickType::MediaDisplay,
        BuiltinBrickType::Confirmation,
        BuiltinBrickType::BatchMediaDisplay,
        BuiltinBrickType::Background,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BuiltinBrickType::Llm => "llm",
            BuiltinBrickType::UserInput => "user_input",
            BuiltinBrickType::BackendCall => "backend_call",
            BuiltinBrickType::WaitingDisplay => "waiting_display",
            BuiltinBrickType::JsonDisplay => "json_display",
            BuiltinBrickType::MediaDisplay => "media_display",
            BuiltinBrickType::Confirmation => "confirmation",
            BuiltinBrickType::BatchMediaDisplay => "batch_media_display",
            BuiltinBrickType::Background => "background",
        }
    }
}

impl FromStr for BuiltinBrickType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuiltinBrickType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown built-in brick type '{s}'"))
    }
}

impl std::fmt::Display for BuiltinBrickType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Typed settings per built-in type
// ---------------------------------------------------------------------------

/// `llm`: a message with action buttons, answered by a button action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmBrickConfig {
    pub message: String,
    #[serde(default)]
    pub buttons: Vec<ButtonConfig>,
    /// Workflow data key that receives the chosen action's value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonConfig {
    pub action: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    /// Text echoed into the chat history as the user's message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
}

/// `user_input`: collects a value, validates it and stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputBrickConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRule>,
    pub save_config: SaveConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
}

/// How a collected value is transformed before it is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// Stored as-is.
    #[default]
    Text,
    /// Coerced to an array.
    List,
    /// Shallow-merged into the object already stored under the key.
    Object,
    /// Stored under `subKey` inside the dictionary at the key.
    Dict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveConfig {
    pub key: String,
    /// Entry name for `dict` inputs; may contain placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_key: Option<String>,
}

/// `backend_call`: one network call per trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCallBrickConfig {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Literal payload template, deep-interpolated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Field name -> template string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_fields: Option<BTreeMap<String, String>>,
    /// Legacy field name -> workflow data path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_mapping: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub auto_execute: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_response: Option<ResponseBinding>,
    /// Step requested after a successful call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    /// Share in-flight identical calls.
    #[serde(default = "default_true")]
    pub dedupe: bool,
    /// Render a status widget instead of running headless.
    #[serde(default)]
    pub show_status: bool,
}

/// Where a response (or a sub-path of it) is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBinding {
    pub key: String,
    /// Dot path extracted from the response before storing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// `waiting_display`: joins on another brick's completion or error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingDisplayBrickConfig {
    pub listen_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `json_display`: presents a value from the workflow data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonDisplayBrickConfig {
    pub data_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// `media_display`: presents a media reference from the workflow data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDisplayBrickConfig {
    pub data_source: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Image,
    Video,
    Audio,
}

/// `confirmation`: asks the user to confirm, optionally showing a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationBrickConfig {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
    #[serde(default = "default_confirm_label")]
    pub confirm_label: String,
    #[serde(default = "default_cancel_label")]
    pub cancel_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_step: Option<String>,
}

/// `batch_media_display`: sequential per-item generation over a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMediaDisplayBrickConfig {
    /// Path of the list of items in the workflow data.
    pub data_source: String,
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Per-item payload template; `{{item.*}}` and `{{index}}` are available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_response: Option<ResponseBinding>,
}

/// `background`: long-running work reporting fractional progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundBrickConfig {
    #[serde(default)]
    pub trigger: TriggerPolicy,
    /// Expression evaluated once at step entry for `on_condition`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub task: BackgroundTask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_response: Option<ResponseBinding>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Work is detached; `execute()` returns at once.
    Immediate,
    /// Work runs to completion inside `execute()`.
    #[default]
    OnStepEnter,
    /// Like `OnStepEnter`, but only when the condition holds at entry.
    OnCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BackgroundTask {
    /// Timed work split into progress ticks.
    Simulated {
        duration_ms: u64,
        /// Progress reports; derived from the engine's progress tick if unset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ticks: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// A single network call.
    Call {
        endpoint: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl Default for BackgroundTask {
    fn default() -> Self {
        BackgroundTask::Simulated {
            duration_ms: 0,
            ticks: None,
            result: None,
        }
    }
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_true() -> bool {
    true
}

fn default_confirm_label() -> String {
    "Confirm".to_string()
}

fn default_cancel_label() -> String {
    "Cancel".to_string()
}

// ---------------------------------------------------------------------------
// Runtime types
// ---------------------------------------------------------------------------

/// Lifecycle state of a brick instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrickState {
    Created,
    Validating,
    Invalid,
    Executing,
    Completed,
    Failed,
    Destroyed,
}

/// Terminal outcome of one `execute()` or `trigger()` call.
///
/// `success = true` with no data is the "waiting for data" signal: the brick
/// has nothing to report yet and will complete through an event later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrickExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BrickError>,
}

impl BrickExecutionResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Nothing to report yet.
    pub fn waiting() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    /// Deliberately idle until an explicit trigger arrives.
    pub fn pending_trigger() -> Self {
        Self::ok(serde_json::json!({ "waiting": true }))
    }

    pub fn failed(error: BrickError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_waiting(&self) -> bool {
        match (&self.data, self.success) {
            (_, false) => false,
            (None, true) | (Some(Value::Null), true) => true,
            (Some(data), true) => data.get("waiting").and_then(Value::as_bool) == Some(true),
        }
    }
}

/// Plain-data description of what a renderer should draw for a brick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderDescriptor {
    pub brick_id: String,
    pub component: String,
    pub props: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn brick_config_keeps_type_specific_settings() {
        let config: BrickConfig = serde_json::from_value(json!({
            "id": "name_input",
            "type": "user_input",
            "saveConfig": { "key": "name" },
            "nextStep": "step2"
        }))
        .unwrap();

        assert_eq!(config.builtin_type(), Some(BuiltinBrickType::UserInput));
        assert_eq!(config.written_keys(), vec!["name".to_string()]);
        assert_eq!(config.next_step_refs(), vec!["step2"]);

        let typed: UserInputBrickConfig = config.parse_settings().unwrap();
        assert_eq!(typed.save_config.key, "name");
        assert_eq!(typed.input_type, InputType::Text);
    }

    #[test]
    fn button_next_steps_are_reported() {
        let config = BrickConfig::new(
            "chat",
            "llm",
            json!({
                "message": "Pick one",
                "buttons": [
                    { "action": "a", "label": "A", "nextStep": "left" },
                    { "action": "b", "label": "B" }
                ]
            }),
        );
        assert_eq!(config.next_step_refs(), vec!["left"]);
    }

    #[test]
    fn backend_call_defaults() {
        let config = BrickConfig::new("call", "backend_call", json!({ "endpoint": "/api/x" }));
        let typed: BackendCallBrickConfig = config.parse_settings().unwrap();
        assert_eq!(typed.method, "POST");
        assert!(typed.auto_execute);
        assert!(typed.dedupe);
    }

    #[test]
    fn background_task_parses_tagged_variants() {
        let typed: BackgroundBrickConfig = serde_json::from_value(json!({
            "trigger": "on_condition",
            "condition": "ready == true",
            "task": { "kind": "simulated", "durationMs": 100, "ticks": 2 }
        }))
        .unwrap();
        assert_eq!(typed.trigger, TriggerPolicy::OnCondition);
        assert!(matches!(
            typed.task,
            BackgroundTask::Simulated { duration_ms: 100, ticks: Some(2), .. }
        ));
    }

    #[test]
    fn unknown_builtin_type_is_rejected() {
        assert!("carousel".parse::<BuiltinBrickType>().is_err());
        assert_eq!(
            "batch_media_display".parse::<BuiltinBrickType>().unwrap(),
            BuiltinBrickType::BatchMediaDisplay
        );
    }

    #[test]
    fn waiting_signals() {
        assert!(BrickExecutionResult::waiting().is_waiting());
        assert!(BrickExecutionResult::pending_trigger().is_waiting());
        assert!(!BrickExecutionResult::ok(json!({"url": "x"})).is_waiting());
        assert!(!BrickExecutionResult::failed(BrickError::execution("x")).is_waiting());
    }
}

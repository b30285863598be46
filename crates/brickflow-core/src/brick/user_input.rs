//! `user_input`: validates a collected value and stores it.

use anyhow::Context;
use brickflow_types::brick::{
    BrickConfig, BrickExecutionResult, BrickState, InputType, RenderDescriptor,
    UserInputBrickConfig,
};
use brickflow_types::error::BrickError;
use brickflow_types::event::CompletePayload;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};

use super::{Brick, BrickContext, BrickCore};
use crate::template::{interpolate, value_to_string};

pub struct UserInputBrick {
    core: BrickCore,
    config: UserInputBrickConfig,
}

impl UserInputBrick {
    pub fn new(config: BrickConfig, ctx: BrickContext) -> anyhow::Result<Self> {
        let typed: UserInputBrickConfig = config
            .parse_settings()
            .with_context(|| format!("invalid user_input config for brick '{}'", config.id))?;
        Ok(Self {
            core: BrickCore::new(&config.id, &config.brick_type, ctx),
            config: typed,
        })
    }

    fn submit(&self, payload: Value) -> BrickExecutionResult {
        if self.core.state() != BrickState::Executing {
            return self.core.not_awaiting();
        }
        let value = match payload {
            Value::Object(mut map) if map.contains_key("value") => {
                map.remove("value").unwrap_or(Value::Null)
            }
            other => other,
        };

        let rule = self.config.validation.clone().unwrap_or_default();
        let verdict = self.core.ctx().validator.validate(&value, &rule);
        for warning in &verdict.warnings {
            tracing::warn!(brick_id = %self.core.id(), %warning, "validation warning");
        }
        if !verdict.valid {
            let message = verdict.message().unwrap_or_else(|| "invalid input".into());
            return self.core.reject_input(
                BrickError::validation(message).with_details(json!({ "errors": verdict.errors })),
            );
        }

        let stored = match self.transform(&value) {
            Ok(stored) => stored,
            Err(message) => return self.core.reject_input(BrickError::validation(message)),
        };
        let key = &self.config.save_config.key;
        self.core.ctx().data.set_as(self.core.id(), key, stored.clone());

        self.core.complete(CompletePayload {
            data: Some(stored),
            next_step: self.config.next_step.clone(),
            user_message: Some(value_to_string(&value)),
            ..CompletePayload::default()
        })
    }

    /// Shape the submitted value for storage according to the input type.
    fn transform(&self, value: &Value) -> Result<Value, String> {
        let data = &self.core.ctx().data;
        let key = &self.config.save_config.key;
        match self.config.input_type {
            InputType::Text => Ok(value.clone()),
            InputType::List => Ok(match value {
                Value::Array(_) => value.clone(),
                Value::String(s) => Value::Array(
                    s.split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(|part| Value::String(part.to_string()))
                        .collect(),
                ),
                other => Value::Array(vec![other.clone()]),
            }),
            InputType::Object => {
                let Value::Object(incoming) = value else {
                    return Err(format!("{} expects an object", self.label()));
                };
                let mut merged = existing_object(data.get(key));
                merged.extend(incoming.clone());
                Ok(Value::Object(merged))
            }
            InputType::Dict => {
                let template = self
                    .config
                    .save_config
                    .sub_key
                    .as_deref()
                    .ok_or_else(|| "dict input needs saveConfig.subKey".to_string())?;
                let sub_key = interpolate(template, &data.snapshot());
                let mut dict = existing_object(data.get(key));
                dict.insert(sub_key, value.clone());
                Ok(Value::Object(dict))
            }
        }
    }

    fn label(&self) -> &str {
        self.config.label.as_deref().unwrap_or(&self.config.save_config.key)
    }
}

fn existing_object(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl Brick for UserInputBrick {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn brick_type(&self) -> &str {
        self.core.brick_type()
    }

    fn state(&self) -> BrickState {
        self.core.state()
    }

    fn validate(&self) -> Result<(), String> {
        if self.config.save_config.key.trim().is_empty() {
            return Err("user_input brick needs saveConfig.key".into());
        }
        if self.config.input_type == InputType::Dict && self.config.save_config.sub_key.is_none() {
            return Err("dict input needs saveConfig.subKey".into());
        }
        Ok(())
    }

    fn execute(&self) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move {
            if let Err(failed) = self.core.begin(self.validate()) {
                return failed;
            }
            BrickExecutionResult::waiting()
        })
    }

    fn trigger(&self, payload: Value) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move { self.submit(payload) })
    }

    fn reset(&self) {
        self.core.set_state(BrickState::Created);
    }

    fn destroy(&self) {
        self.core.set_state(BrickState::Destroyed);
    }

    fn render(&self) -> Option<RenderDescriptor> {
        Some(self.core.render(
            "user_input",
            json!({
                "label": self.config.label,
                "placeholder": self.config.placeholder,
                "inputType": self.config.input_type,
                "required": self.config.validation.as_ref().is_some_and(|r| r.required),
                "value": self.core.ctx().data.get(&self.config.save_config.key),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::BoxNetworkClient;
    use crate::test_support::RecordingClient;
    use brickflow_types::config::EngineConfig;

    fn brick(settings: Value) -> UserInputBrick {
        let ctx = BrickContext::new(
            BoxNetworkClient::new(RecordingClient::new()),
            EngineConfig::default(),
        );
        UserInputBrick::new(BrickConfig::new("input", "user_input", settings), ctx).unwrap()
    }

    async fn submit(brick: &UserInputBrick, value: Value) -> BrickExecutionResult {
        brick.execute().await;
        brick.trigger(json!({ "value": value })).await
    }

    #[tokio::test]
    async fn text_values_are_stored_as_is() {
        let b = brick(json!({"saveConfig": {"key": "name"}}));
        assert!(submit(&b, json!("Ada")).await.success);
        assert_eq!(b.core.ctx().data.get("name"), Some(json!("Ada")));
        assert_eq!(b.state(), BrickState::Completed);
    }

    #[tokio::test]
    async fn required_empty_value_is_rejected_and_can_be_resubmitted() {
        let b = brick(json!({
            "saveConfig": {"key": "name"},
            "validation": {"required": true, "label": "Name"}
        }));
        let result = submit(&b, json!("  ")).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().message, "Name is required");
        assert_eq!(b.state(), BrickState::Executing);

        assert!(b.trigger(json!({"value": "Ada"})).await.success);
    }

    #[tokio::test]
    async fn list_inputs_split_strings() {
        let b = brick(json!({"saveConfig": {"key": "tags"}, "inputType": "list"}));
        submit(&b, json!("rock, jazz,,pop")).await;
        assert_eq!(b.core.ctx().data.get("tags"), Some(json!(["rock", "jazz", "pop"])));
    }

    #[tokio::test]
    async fn object_inputs_merge_into_existing_value() {
        let b = brick(json!({"saveConfig": {"key": "profile"}, "inputType": "object"}));
        b.core.ctx().data.set("profile", json!({"name": "Ada", "age": 36}));
        submit(&b, json!({"age": 37, "city": "London"})).await;
        assert_eq!(
            b.core.ctx().data.get("profile"),
            Some(json!({"name": "Ada", "age": 37, "city": "London"}))
        );
    }

    #[tokio::test]
    async fn dict_inputs_use_an_interpolated_sub_key() {
        let b = brick(json!({
            "saveConfig": {"key": "answers", "subKey": "q_{{current}}"},
            "inputType": "dict"
        }));
        b.core.ctx().data.set("current", json!(2));
        b.core.ctx().data.set("answers", json!({"q_1": "yes"}));
        submit(&b, json!("no")).await;
        assert_eq!(
            b.core.ctx().data.get("answers"),
            Some(json!({"q_1": "yes", "q_2": "no"}))
        );
    }

    #[test]
    fn dict_without_sub_key_is_invalid() {
        let b = brick(json!({"saveConfig": {"key": "answers"}, "inputType": "dict"}));
        assert!(b.validate().is_err());
    }
}

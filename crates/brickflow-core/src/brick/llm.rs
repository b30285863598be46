//! `llm`: an assistant message with action buttons.
//!
//! `execute()` only publishes the message; the brick completes when a
//! `trigger:<id>` event names one of its button actions.

use anyhow::Context;
use brickflow_types::brick::{
    BrickConfig, BrickExecutionResult, BrickState, LlmBrickConfig, RenderDescriptor,
};
use brickflow_types::error::BrickError;
use brickflow_types::event::CompletePayload;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use super::{Brick, BrickContext, BrickCore};
use crate::template::interpolate;

pub struct LlmBrick {
    core: BrickCore,
    config: LlmBrickConfig,
}

impl LlmBrick {
    pub fn new(config: BrickConfig, ctx: BrickContext) -> anyhow::Result<Self> {
        let typed: LlmBrickConfig = config
            .parse_settings()
            .with_context(|| format!("invalid llm config for brick '{}'", config.id))?;
        Ok(Self {
            core: BrickCore::new(&config.id, &config.brick_type, ctx),
            config: typed,
        })
    }

    fn choose(&self, payload: Value) -> BrickExecutionResult {
        if self.core.state() != BrickState::Executing {
            return self.core.not_awaiting();
        }
        let Some(action) = payload.get("action").and_then(Value::as_str) else {
            return self
                .core
                .reject_input(BrickError::validation("trigger payload needs an 'action'"));
        };
        let Some(button) = self.config.buttons.iter().find(|b| b.action == action) else {
            return self
                .core
                .reject_input(BrickError::validation(format!("unknown action '{action}'")));
        };

        let value = button
            .value
            .clone()
            .unwrap_or_else(|| Value::String(button.action.clone()));
        if let Some(key) = &self.config.save_key {
            self.core.ctx().data.set_as(self.core.id(), key, value.clone());
        }

        self.core.complete(CompletePayload {
            data: Some(json!({ "action": button.action, "value": value })),
            next_step: button.next_step.clone(),
            action: Some(button.action.clone()),
            user_message: Some(
                button
                    .user_message
                    .clone()
                    .unwrap_or_else(|| button.label.clone()),
            ),
            ..CompletePayload::default()
        })
    }
}

impl Brick for LlmBrick {
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
        if self.config.message.trim().is_empty() {
            return Err("llm brick needs a message".into());
        }
        if let Some(button) = self.config.buttons.iter().find(|b| b.action.is_empty()) {
            return Err(format!("button '{}' has no action", button.label));
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
        Box::pin(async move { self.choose(payload) })
    }

    fn reset(&self) {
        self.core.set_state(BrickState::Created);
    }

    fn destroy(&self) {
        self.core.set_state(BrickState::Destroyed);
    }

    fn render(&self) -> Option<RenderDescriptor> {
        let data = self.core.ctx().data.snapshot();
        Some(self.core.render(
            "llm_message",
            json!({
                "message": interpolate(&self.config.message, &data),
                "buttons": self.config.buttons,
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
    use std::sync::{Arc, Mutex};

    fn brick() -> LlmBrick {
        let ctx = BrickContext::new(
            BoxNetworkClient::new(RecordingClient::new()),
            EngineConfig::default(),
        );
        ctx.data.set("name", json!("Ada"));
        let config = BrickConfig::new(
            "plan_choice",
            "llm",
            json!({
                "message": "Hi {{name}}, which plan?",
                "saveKey": "plan",
                "buttons": [
                    { "action": "pro", "label": "Pro", "nextStep": "checkout", "value": {"tier": "pro"} },
                    { "action": "free", "label": "Free", "userMessage": "Free is fine" }
                ]
            }),
        );
        LlmBrick::new(config, ctx).unwrap()
    }

    #[tokio::test]
    async fn waits_then_completes_with_the_chosen_action() {
        let brick = brick();
        let completed = Arc::new(Mutex::new(None));
        let c = completed.clone();
        brick.core.ctx().bus.on("complete:plan_choice", move |payload| {
            *c.lock().unwrap() = Some(payload.clone());
        });

        assert!(brick.execute().await.is_waiting());
        let result = brick.trigger(json!({"action": "pro"})).await;

        assert!(result.success);
        let payload = completed.lock().unwrap().clone().unwrap();
        assert_eq!(payload["action"], "pro");
        assert_eq!(payload["nextStep"], "checkout");
        assert_eq!(payload["userMessage"], "Pro");
        assert_eq!(brick.core.ctx().data.get("plan"), Some(json!({"tier": "pro"})));
    }

    #[tokio::test]
    async fn unknown_actions_are_rejected_without_failing() {
        let brick = brick();
        brick.execute().await;

        let result = brick.trigger(json!({"action": "enterprise"})).await;

        assert!(!result.success);
        assert_eq!(brick.state(), BrickState::Executing);
    }

    #[tokio::test]
    async fn render_interpolates_the_message() {
        let descriptor = brick().render().unwrap();
        assert_eq!(descriptor.component, "llm_message");
        assert_eq!(descriptor.props["message"], "Hi Ada, which plan?");
    }

    #[tokio::test]
    async fn triggers_before_execute_are_rejected() {
        let brick = brick();
        assert!(!brick.trigger(json!({"action": "free"})).await.success);
    }
}

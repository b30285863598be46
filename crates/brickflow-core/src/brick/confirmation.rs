//! `confirmation`: asks the user to confirm, optionally showing a value
//! read from the workflow data first.

use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use brickflow_types::brick::{
    BrickConfig, BrickExecutionResult, BrickState, ConfirmationBrickConfig, RenderDescriptor,
};
use brickflow_types::error::BrickError;
use brickflow_types::event::CompletePayload;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use super::{Brick, BrickContext, BrickCore};
use crate::template::interpolate;

pub struct ConfirmationBrick {
    core: BrickCore,
    config: ConfirmationBrickConfig,
    shown: Mutex<Option<Value>>,
}

impl ConfirmationBrick {
    pub fn new(config: BrickConfig, ctx: BrickContext) -> anyhow::Result<Self> {
        let typed: ConfirmationBrickConfig = config
            .parse_settings()
            .with_context(|| format!("invalid confirmation config for brick '{}'", config.id))?;
        Ok(Self {
            core: BrickCore::new(&config.id, &config.brick_type, ctx),
            config: typed,
            shown: Mutex::new(None),
        })
    }

    fn answer(&self, payload: Value) -> BrickExecutionResult {
        if self.core.state() != BrickState::Executing {
            return self.core.not_awaiting();
        }
        let Some(confirmed) = payload.get("confirmed").and_then(Value::as_bool) else {
            return self
                .core
                .reject_input(BrickError::validation("trigger payload needs 'confirmed'"));
        };
        let (next_step, label) = if confirmed {
            (self.config.next_step.clone(), &self.config.confirm_label)
        } else {
            (self.config.cancel_step.clone(), &self.config.cancel_label)
        };
        self.core.complete(CompletePayload {
            data: Some(json!({ "confirmed": confirmed })),
            next_step,
            action: Some(if confirmed { "confirm" } else { "cancel" }.to_string()),
            user_message: Some(label.clone()),
            ..CompletePayload::default()
        })
    }
}

impl Brick for ConfirmationBrick {
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
            return Err("confirmation brick needs a message".into());
        }
        Ok(())
    }

    fn execute(&self) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move {
            if let Err(failed) = self.core.begin(self.validate()) {
                return failed;
            }
            if let Some(path) = &self.config.data_source {
                let timeout = self.core.ctx().settings.data_wait_timeout();
                match self.core.ctx().data.wait_for(path, timeout).await {
                    Ok(value) => {
                        *self.shown.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                    }
                    Err(error) => return self.core.fail(error),
                }
            }
            BrickExecutionResult::waiting()
        })
    }

    fn trigger(&self, payload: Value) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move { self.answer(payload) })
    }

    fn reset(&self) {
        *self.shown.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.core.set_state(BrickState::Created);
    }

    fn destroy(&self) {
        self.core.set_state(BrickState::Destroyed);
    }

    fn render(&self) -> Option<RenderDescriptor> {
        let data = self.core.ctx().data.snapshot();
        Some(self.core.render(
            "confirmation",
            json!({
                "message": interpolate(&self.config.message, &data),
                "data": self.shown.lock().unwrap_or_else(PoisonError::into_inner).clone(),
                "confirmLabel": self.config.confirm_label,
                "cancelLabel": self.config.cancel_label,
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
    use brickflow_types::error::BrickErrorKind;

    fn brick(settings: Value) -> ConfirmationBrick {
        let ctx = BrickContext::new(
            BoxNetworkClient::new(RecordingClient::new()),
            EngineConfig::default(),
        );
        ctx.data.set("order", json!({"total": 12}));
        ConfirmationBrick::new(BrickConfig::new("confirm", "confirmation", settings), ctx).unwrap()
    }

    #[tokio::test]
    async fn confirm_and_cancel_pick_different_steps() {
        let settings = json!({
            "message": "Place order?",
            "dataSource": "order",
            "nextStep": "pay",
            "cancelStep": "edit"
        });

        let yes = brick(settings.clone());
        assert!(yes.execute().await.is_waiting());
        assert_eq!(yes.render().unwrap().props["data"]["total"], 12);
        let result = yes.trigger(json!({"confirmed": true})).await;
        assert_eq!(result.data, Some(json!({"confirmed": true})));

        let no = brick(settings);
        no.execute().await;
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let s = seen.clone();
        no.core.ctx().bus.on("complete:confirm", move |p| {
            *s.lock().unwrap() = p.get("nextStep").cloned();
        });
        no.trigger(json!({"confirmed": false})).await;
        assert_eq!(*seen.lock().unwrap(), Some(json!("edit")));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_data_source_fails() {
        let b = brick(json!({"message": "Sure?", "dataSource": "quote"}));
        let result = b.execute().await;
        assert_eq!(result.error.unwrap().kind, BrickErrorKind::DataUnavailable);
    }
}

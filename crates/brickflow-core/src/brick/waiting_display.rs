//! `waiting_display`: joins on another brick's outcome.
//!
//! Subscribes to `complete:<listenTo>` and `error:<listenTo>` as soon as it
//! is built, so an outcome published before `execute()` runs is not lost.
//! There is no timeout; the wait ends with the upstream outcome or when the
//! brick is destroyed.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use brickflow_types::brick::{
    BrickConfig, BrickExecutionResult, BrickState, RenderDescriptor, WaitingDisplayBrickConfig,
};
use brickflow_types::error::BrickError;
use brickflow_types::event::{BrickTopic, CompletePayload};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use super::{Brick, BrickContext, BrickCore};
use crate::event::SubscriptionId;

type Outcome = Result<Value, BrickError>;

#[derive(Default)]
struct Join {
    receiver: Option<oneshot::Receiver<Outcome>>,
    subscriptions: Vec<SubscriptionId>,
}

pub struct WaitingDisplayBrick {
    core: BrickCore,
    config: WaitingDisplayBrickConfig,
    join: Mutex<Join>,
}

impl WaitingDisplayBrick {
    pub fn new(config: BrickConfig, ctx: BrickContext) -> anyhow::Result<Self> {
        let typed: WaitingDisplayBrickConfig = config
            .parse_settings()
            .with_context(|| format!("invalid waiting_display config for brick '{}'", config.id))?;
        let brick = Self {
            core: BrickCore::new(&config.id, &config.brick_type, ctx),
            config: typed,
            join: Mutex::new(Join::default()),
        };
        brick.arm();
        Ok(brick)
    }

    /// (Re)subscribe to the upstream brick's outcome.
    fn arm(&self) {
        self.disarm();
        let bus = &self.core.ctx().bus;
        let (tx, rx) = oneshot::channel::<Outcome>();
        let sender = Arc::new(Mutex::new(Some(tx)));

        let on_complete = {
            let sender = sender.clone();
            move |payload: &Value| {
                let data = payload.get("data").cloned().unwrap_or(Value::Null);
                settle(&sender, Ok(data));
            }
        };
        let on_error = move |payload: &Value| {
            settle(&sender, Err(BrickError::from_payload(payload)));
        };

        let listen_to = &self.config.listen_to;
        let subscriptions = vec![
            bus.once(&BrickTopic::Complete.for_brick(listen_to), on_complete),
            bus.once(&BrickTopic::Error.for_brick(listen_to), on_error),
        ];
        let mut join = self.join.lock().unwrap_or_else(PoisonError::into_inner);
        join.receiver = Some(rx);
        join.subscriptions = subscriptions;
    }

    /// Drop subscriptions and the pending receiver.
    fn disarm(&self) {
        let previous = std::mem::take(&mut *self.join.lock().unwrap_or_else(PoisonError::into_inner));
        for id in previous.subscriptions {
            self.core.ctx().bus.off_by_id(id);
        }
    }
}

fn settle(sender: &Mutex<Option<oneshot::Sender<Outcome>>>, outcome: Outcome) {
    if let Some(tx) = sender.lock().unwrap_or_else(PoisonError::into_inner).take() {
        let _ = tx.send(outcome);
    }
}

impl Brick for WaitingDisplayBrick {
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
        if self.config.listen_to.trim().is_empty() {
            return Err("waiting_display brick needs listenTo".into());
        }
        if self.config.listen_to == self.core.id() {
            return Err("waiting_display brick cannot wait on itself".into());
        }
        Ok(())
    }

    fn execute(&self) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move {
            if let Err(failed) = self.core.begin(self.validate()) {
                return failed;
            }
            let receiver = self
                .join
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .receiver
                .take();
            let Some(receiver) = receiver else {
                return self.core.fail(
                    BrickError::execution("waiting_display was already joined; reset it first")
                        .with_retryable(false),
                );
            };
            match receiver.await {
                Ok(Ok(data)) => self.core.complete(CompletePayload::with_data(json!({
                    "source": self.config.listen_to,
                    "data": data,
                }))),
                Ok(Err(upstream)) => self.core.fail(
                    BrickError::execution(upstream.message.clone())
                        .with_retryable(upstream.retryable)
                        .with_details(json!({ "source": self.config.listen_to })),
                ),
                Err(_) => BrickExecutionResult::failed(
                    BrickError::execution("brick destroyed while waiting").with_retryable(false),
                ),
            }
        })
    }

    fn reset(&self) {
        self.arm();
        self.core.set_state(BrickState::Created);
    }

    fn destroy(&self) {
        self.disarm();
        self.core.set_state(BrickState::Destroyed);
    }

    fn render(&self) -> Option<RenderDescriptor> {
        Some(self.core.render(
            "waiting_display",
            json!({
                "message": self.config.message,
                "listenTo": self.config.listen_to,
                "done": self.core.state() == BrickState::Completed,
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

    fn brick() -> WaitingDisplayBrick {
        let ctx = BrickContext::new(
            BoxNetworkClient::new(RecordingClient::new()),
            EngineConfig::default(),
        );
        WaitingDisplayBrick::new(
            BrickConfig::new("wait", "waiting_display", json!({"listenTo": "X"})),
            ctx,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn upstream_error_message_is_propagated() {
        let b = brick();
        let bus = b.core.ctx().bus.clone();
        let (result, ()) = tokio::join!(b.execute(), async move {
            tokio::task::yield_now().await;
            bus.emit_json("error:X", &BrickError::execution("boom"));
        });

        assert!(!result.success);
        assert_eq!(result.error.unwrap().message, "boom");
    }

    #[tokio::test]
    async fn outcome_published_before_execute_is_kept() {
        let b = brick();
        b.core.ctx().bus.emit("complete:X", &json!({"data": {"url": "a.png"}}));

        let result = b.execute().await;

        assert!(result.success);
        assert_eq!(result.data.unwrap()["data"]["url"], "a.png");
    }

    #[tokio::test]
    async fn destroy_releases_subscriptions() {
        let b = brick();
        assert_eq!(b.core.ctx().bus.listener_count("complete:X"), 1);
        b.destroy();
        assert_eq!(b.core.ctx().bus.listener_count("complete:X"), 0);
        assert_eq!(b.core.ctx().bus.listener_count("error:X"), 0);
    }

    #[tokio::test]
    async fn reset_rearms_the_join() {
        let b = brick();
        b.core.ctx().bus.emit("complete:X", &json!({"data": 1}));
        assert!(b.execute().await.success);

        b.reset();
        b.core.ctx().bus.emit("complete:X", &json!({"data": 2}));
        assert_eq!(b.execute().await.data.unwrap()["data"], 2);
    }
}

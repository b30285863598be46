//! `background`: long-running work that reports fractional progress.
//!
//! - `immediate`: the work is detached and `execute()` returns at once; the
//!   step does not wait for it.
//! - `on_step_enter`: the work runs inside `execute()`.
//! - `on_condition`: like `on_step_enter`, but only if the condition holds
//!   when the step is entered; otherwise the brick completes as skipped.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use brickflow_types::brick::{
    BackgroundBrickConfig, BackgroundTask, BrickConfig, BrickExecutionResult, BrickState,
    RenderDescriptor, TriggerPolicy,
};
use brickflow_types::error::BrickError;
use brickflow_types::event::{CompletePayload, ProgressPayload};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{Brick, BrickContext, BrickCore};
use crate::expression::ConditionEvaluator;
use crate::network::NetworkRequest;
use crate::template::{interpolate, interpolate_value};

pub struct BackgroundBrick {
    core: Arc<BrickCore>,
    config: BackgroundBrickConfig,
    cancel: Mutex<CancellationToken>,
    progress: Arc<Mutex<f64>>,
}

impl BackgroundBrick {
    pub fn new(config: BrickConfig, ctx: BrickContext) -> anyhow::Result<Self> {
        let typed: BackgroundBrickConfig = config
            .parse_settings()
            .with_context(|| format!("invalid background config for brick '{}'", config.id))?;
        Ok(Self {
            core: Arc::new(BrickCore::new(&config.id, &config.brick_type, ctx)),
            config: typed,
            cancel: Mutex::new(CancellationToken::new()),
            progress: Arc::new(Mutex::new(0.0)),
        })
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn condition_holds(&self) -> Result<bool, BrickError> {
        let Some(condition) = &self.config.condition else {
            return Ok(true);
        };
        let data = self.core.ctx().data.snapshot();
        ConditionEvaluator::new()
            .evaluate_bool(condition, &data)
            .map_err(|e| BrickError::validation(e.to_string()))
    }

    fn work(&self) -> BackgroundWork {
        BackgroundWork {
            core: self.core.clone(),
            task: self.config.task.clone(),
            save_key: self.config.save_response.as_ref().map(|b| b.key.clone()),
            token: self.token(),
            progress: self.progress.clone(),
        }
    }
}

/// Owned pieces of the brick the work needs, so it can be detached.
struct BackgroundWork {
    core: Arc<BrickCore>,
    task: BackgroundTask,
    save_key: Option<String>,
    token: CancellationToken,
    progress: Arc<Mutex<f64>>,
}

impl BackgroundWork {
    fn report(&self, fraction: f64) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = fraction;
        self.core.emit_progress(ProgressPayload::fraction(fraction));
    }

    async fn run(self) -> BrickExecutionResult {
        let outcome = tokio::select! {
            _ = self.token.cancelled() => Err(
                BrickError::execution("background work cancelled").with_retryable(false)
            ),
            outcome = self.perform() => outcome,
        };
        match outcome {
            Ok(result) => {
                if let Some(key) = &self.save_key {
                    self.core
                        .ctx()
                        .data
                        .set_as(self.core.id(), key, result.clone());
                }
                self.core.complete(CompletePayload::with_data(result))
            }
            Err(error) if self.token.is_cancelled() => {
                tracing::debug!(brick_id = %self.core.id(), "background work cancelled");
                BrickExecutionResult::failed(error)
            }
            Err(error) => self.core.fail(error),
        }
    }

    async fn perform(&self) -> Result<Value, BrickError> {
        let ctx = self.core.ctx();
        self.report(0.0);
        match &self.task {
            BackgroundTask::Simulated {
                duration_ms,
                ticks,
                result,
            } => {
                let ticks = tick_count(*duration_ms, ctx.settings.progress_tick_ms, *ticks);
                let step = Duration::from_millis(*duration_ms) / ticks;
                for tick in 1..=ticks {
                    tokio::time::sleep(step).await;
                    self.report(f64::from(tick) / f64::from(ticks));
                }
                Ok(result.clone().unwrap_or_else(|| json!({ "completed": true })))
            }
            BackgroundTask::Call {
                endpoint,
                method,
                payload,
                timeout_ms,
            } => {
                let data = ctx.data.snapshot();
                let mut request = NetworkRequest::new(
                    method.to_uppercase(),
                    interpolate(endpoint, &data),
                    timeout_ms.unwrap_or(ctx.settings.default_timeout_ms),
                );
                if let Some(payload) = payload {
                    request = request.with_body(interpolate_value(payload, &data));
                }
                let response = ctx.dedup.call(&ctx.network, request).await?;
                self.report(1.0);
                Ok(response)
            }
        }
    }
}

/// Explicit tick count, else one tick per progress interval. At least one.
fn tick_count(duration_ms: u64, tick_ms: u64, ticks: Option<u32>) -> u32 {
    ticks
        .unwrap_or_else(|| u32::try_from(duration_ms / tick_ms.max(1)).unwrap_or(u32::MAX))
        .max(1)
}

impl Brick for BackgroundBrick {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn brick_type(&self) -> &str {
        self.core.brick_type()
    }

    fn state(&self) -> BrickState {
        self.core.state()
    }

    fn blocks_step(&self) -> bool {
        self.config.trigger != TriggerPolicy::Immediate
    }

    fn validate(&self) -> Result<(), String> {
        if self.config.trigger == TriggerPolicy::OnCondition && self.config.condition.is_none() {
            return Err("on_condition background brick needs a condition".into());
        }
        if let BackgroundTask::Call { endpoint, .. } = &self.config.task {
            if endpoint.trim().is_empty() {
                return Err("background call needs an endpoint".into());
            }
        }
        Ok(())
    }

    fn execute(&self) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move {
            if let Err(failed) = self.core.begin(self.validate()) {
                return failed;
            }
            match self.config.trigger {
                TriggerPolicy::Immediate => {
                    tokio::spawn(self.work().run());
                    BrickExecutionResult::waiting()
                }
                TriggerPolicy::OnStepEnter => self.work().run().await,
                TriggerPolicy::OnCondition => match self.condition_holds() {
                    Ok(true) => self.work().run().await,
                    Ok(false) => {
                        tracing::debug!(brick_id = %self.core.id(), "background condition false, skipping");
                        self.core
                            .complete(CompletePayload::with_data(json!({ "skipped": true })))
                    }
                    Err(error) => self.core.fail(error),
                },
            }
        })
    }

    fn reset(&self) {
        let previous = std::mem::replace(
            &mut *self.cancel.lock().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        previous.cancel();
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = 0.0;
        self.core.set_state(BrickState::Created);
    }

    fn destroy(&self) {
        self.token().cancel();
        self.core.set_state(BrickState::Destroyed);
    }

    fn render(&self) -> Option<RenderDescriptor> {
        Some(self.core.render(
            "progress",
            json!({
                "progress": *self.progress.lock().unwrap_or_else(PoisonError::into_inner),
                "state": self.core.state(),
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

    fn brick(recorder: &RecordingClient, settings: Value) -> BackgroundBrick {
        let ctx = BrickContext::new(BoxNetworkClient::new(recorder.clone()), EngineConfig::default());
        BackgroundBrick::new(BrickConfig::new("bg", "background", settings), ctx).unwrap()
    }

    fn record_progress(b: &BackgroundBrick) -> Arc<Mutex<Vec<f64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        b.core.ctx().bus.on("progress:bg", move |payload| {
            s.lock().unwrap().push(payload["progress"].as_f64().unwrap());
        });
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn on_step_enter_runs_inline_with_fractional_progress() {
        let b = brick(
            &RecordingClient::new(),
            json!({"task": {"kind": "simulated", "durationMs": 400, "ticks": 4, "result": {"ok": 1}}}),
        );
        let seen = record_progress(&b);

        let result = b.execute().await;

        assert_eq!(result.data, Some(json!({"ok": 1})));
        assert_eq!(*seen.lock().unwrap(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert!(b.blocks_step());
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_work_is_detached_and_cancelled_by_destroy() {
        let b = brick(
            &RecordingClient::new(),
            json!({"trigger": "immediate", "task": {"kind": "simulated", "durationMs": 10000}}),
        );
        let completed = Arc::new(Mutex::new(false));
        let c = completed.clone();
        b.core.ctx().bus.on("complete:bg", move |_| *c.lock().unwrap() = true);

        assert!(b.execute().await.is_waiting());
        assert!(!b.blocks_step());
        tokio::time::sleep(Duration::from_millis(300)).await;
        b.destroy();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(!*completed.lock().unwrap());
        assert_eq!(b.state(), BrickState::Destroyed);
    }

    #[tokio::test]
    async fn on_condition_is_evaluated_once_at_entry() {
        let recorder = RecordingClient::new().respond_with(json!({"score": 3}));
        let b = brick(
            &recorder,
            json!({
                "trigger": "on_condition",
                "condition": "plan == 'pro'",
                "task": {"kind": "call", "endpoint": "/api/analyze"},
                "saveResponse": {"key": "analysis"}
            }),
        );

        b.core.ctx().data.set("plan", json!("free"));
        let skipped = b.execute().await;
        assert_eq!(skipped.data, Some(json!({"skipped": true})));
        assert_eq!(recorder.call_count(), 0);

        b.reset();
        b.core.ctx().data.set("plan", json!("pro"));
        b.execute().await;
        assert_eq!(recorder.call_count(), 1);
        assert_eq!(b.core.ctx().data.get("analysis"), Some(json!({"score": 3})));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_calls_within_the_window_reach_the_network_once() {
        let recorder = RecordingClient::new().respond_with(json!({"score": 3}));
        let b = brick(
            &recorder,
            json!({"task": {"kind": "call", "endpoint": "/api/analyze", "payload": {"id": 1}}}),
        );

        b.execute().await;
        b.reset();
        let second = b.execute().await;

        assert_eq!(recorder.call_count(), 1);
        assert_eq!(second.data, Some(json!({"score": 3})));
    }

    #[test]
    fn tick_count_saturates_instead_of_truncating() {
        assert_eq!(tick_count(1_000, 250, None), 4);
        assert_eq!(tick_count(10, 250, None), 1);
        assert_eq!(tick_count(1_000, 0, None), 1_000);
        assert_eq!(tick_count(u64::MAX, 1, None), u32::MAX);
        assert_eq!(tick_count(1_000, 250, Some(0)), 1);
        assert_eq!(tick_count(1_000, 250, Some(7)), 7);
    }

    #[test]
    fn on_condition_requires_a_condition() {
        let b = brick(&RecordingClient::new(), json!({"trigger": "on_condition"}));
        assert!(b.validate().is_err());
    }
}

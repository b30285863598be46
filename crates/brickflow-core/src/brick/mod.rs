//! The brick contract and the built-in brick types.
//!
//! A brick is a unit of work with a uniform lifecycle. Bricks never call
//! each other or the orchestrator: they read and write the shared
//! [`WorkflowData`] and announce outcomes on the [`EventBus`].

pub mod background;
pub mod backend_call;
pub mod batch_media;
pub mod confirmation;
pub mod display;
pub mod llm;
pub mod registry;
pub mod user_input;
pub mod waiting_display;

use std::sync::{Arc, Mutex, PoisonError};

use brickflow_types::brick::{BrickExecutionResult, BrickState, RenderDescriptor};
use brickflow_types::config::EngineConfig;
use brickflow_types::error::BrickError;
use brickflow_types::event::{BrickTopic, CompletePayload, ProgressPayload, StatusPayload};
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::data::WorkflowData;
use crate::event::{EventBus, OverlayChannel};
use crate::network::{BoxNetworkClient, CallDeduplicator};
use crate::validation::Validator;

pub use registry::{BrickRegistry, RegistryError};

// ---------------------------------------------------------------------------
// Brick trait
// ---------------------------------------------------------------------------

/// A polymorphic unit of work.
///
/// Implementations use interior mutability; the orchestrator holds bricks
/// behind `Arc<dyn Brick>` and may call `trigger` while `execute` is pending.
pub trait Brick: Send + Sync {
    fn id(&self) -> &str;

    fn brick_type(&self) -> &str;

    fn state(&self) -> BrickState;

    /// Whether the step waits for this brick before advancing on its own.
    fn blocks_step(&self) -> bool {
        true
    }

    /// Side-effect free configuration check.
    fn validate(&self) -> Result<(), String>;

    /// The single state-changing entry point. Always resolves; failures are
    /// returned as `success = false` and announced on `error:<id>`.
    fn execute(&self) -> BoxFuture<'_, BrickExecutionResult>;

    /// Handle a `trigger:<id>` event (a user action or an explicit run).
    fn trigger(&self, payload: Value) -> BoxFuture<'_, BrickExecutionResult> {
        let _ = payload;
        let error = BrickError::validation(format!(
            "{} brick '{}' does not accept triggers",
            self.brick_type(),
            self.id()
        ));
        Box::pin(async move { BrickExecutionResult::failed(error) })
    }

    /// Restore construction-time state.
    fn reset(&self);

    /// Release timers and subscriptions. Terminal.
    fn destroy(&self);

    /// Plain-data description for a renderer; `None` for headless bricks.
    fn render(&self) -> Option<RenderDescriptor> {
        None
    }
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Everything a brick may touch, shared by all bricks of a run.
#[derive(Clone)]
pub struct BrickContext {
    pub data: WorkflowData,
    pub bus: EventBus,
    pub overlay: OverlayChannel,
    pub network: BoxNetworkClient,
    pub dedup: CallDeduplicator,
    pub validator: Arc<Validator>,
    pub settings: Arc<EngineConfig>,
}

impl BrickContext {
    pub fn new(network: BoxNetworkClient, settings: EngineConfig) -> Self {
        let bus = EventBus::new();
        Self {
            data: WorkflowData::new(),
            overlay: OverlayChannel::new(&bus),
            bus,
            network,
            dedup: CallDeduplicator::new(settings.dedup_window()),
            validator: Arc::new(Validator::new()),
            settings: Arc::new(settings),
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_data(mut self, data: WorkflowData) -> Self {
        self.data = data;
        self
    }
}

impl std::fmt::Debug for BrickContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrickContext")
            .field("bus", &self.bus)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// BrickCore
// ---------------------------------------------------------------------------

/// Identity, lifecycle state and event helpers shared by the built-ins.
pub struct BrickCore {
    id: String,
    brick_type: String,
    state: Mutex<BrickState>,
    ctx: BrickContext,
}

impl BrickCore {
    pub fn new(id: &str, brick_type: &str, ctx: BrickContext) -> Self {
        Self {
            id: id.to_string(),
            brick_type: brick_type.to_string(),
            state: Mutex::new(BrickState::Created),
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn brick_type(&self) -> &str {
        &self.brick_type
    }

    pub fn ctx(&self) -> &BrickContext {
        &self.ctx
    }

    pub fn state(&self) -> BrickState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`. `Destroyed` is terminal and is never left.
    pub fn set_state(&self, next: BrickState) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == BrickState::Destroyed {
                return;
            }
            std::mem::replace(&mut *state, next)
        };
        if previous == next {
            return;
        }
        tracing::debug!(brick_id = %self.id, brick_type = %self.brick_type, from = ?previous, to = ?next, "brick state changed");
        self.emit_status(next, None);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == BrickState::Destroyed
    }

    /// Validate and move to `Executing`.
    ///
    /// Returns the failure to hand back from `execute()` when the brick is
    /// destroyed or its configuration is invalid.
    pub fn begin(&self, validation: Result<(), String>) -> Result<(), BrickExecutionResult> {
        if self.is_destroyed() {
            return Err(BrickExecutionResult::failed(BrickError::execution(format!(
                "brick '{}' has been destroyed",
                self.id
            ))
            .with_retryable(false)));
        }
        self.set_state(BrickState::Validating);
        if let Err(reason) = validation {
            self.set_state(BrickState::Invalid);
            let error = BrickError::validation(reason);
            self.emit_error(&error);
            return Err(BrickExecutionResult::failed(error));
        }
        self.set_state(BrickState::Executing);
        Ok(())
    }

    /// Move to `Completed`, announce it and build the result.
    pub fn complete(&self, payload: CompletePayload) -> BrickExecutionResult {
        let data = payload.data.clone().unwrap_or(Value::Null);
        if self.is_destroyed() {
            return BrickExecutionResult::ok(data);
        }
        self.set_state(BrickState::Completed);
        self.ctx
            .bus
            .emit_json(&BrickTopic::Complete.for_brick(&self.id), &payload);
        BrickExecutionResult::ok(data)
    }

    /// Move to `Failed`, announce it and build the result.
    pub fn fail(&self, error: BrickError) -> BrickExecutionResult {
        if self.is_destroyed() {
            return BrickExecutionResult::failed(error);
        }
        tracing::warn!(brick_id = %self.id, kind = %error.kind, message = %error.message, "brick failed");
        self.set_state(BrickState::Failed);
        self.emit_error(&error);
        BrickExecutionResult::failed(error)
    }

    /// Announce a recoverable input error without leaving the current state.
    pub fn reject_input(&self, error: BrickError) -> BrickExecutionResult {
        tracing::debug!(brick_id = %self.id, message = %error.message, "brick input rejected");
        self.emit_error(&error);
        BrickExecutionResult::failed(error)
    }

    pub fn emit_error(&self, error: &BrickError) {
        self.ctx
            .bus
            .emit_json(&BrickTopic::Error.for_brick(&self.id), error);
    }

    pub fn emit_progress(&self, progress: ProgressPayload) {
        self.ctx
            .bus
            .emit_json(&BrickTopic::Progress.for_brick(&self.id), &progress);
    }

    pub fn emit_status(&self, state: BrickState, message: Option<String>) {
        self.ctx.bus.emit_json(
            &BrickTopic::Status.for_brick(&self.id),
            &StatusPayload { state, message },
        );
    }

    /// Rejection for triggers that arrive in the wrong state.
    pub fn not_awaiting(&self) -> BrickExecutionResult {
        self.reject_input(BrickError::validation(format!(
            "brick '{}' is not awaiting input (state {:?})",
            self.id,
            self.state()
        )))
    }

    pub fn render(&self, component: &str, props: Value) -> RenderDescriptor {
        RenderDescriptor {
            brick_id: self.id.clone(),
            component: component.to_string(),
            props,
        }
    }
}

/// Extract a dot path from a response, or the whole response without one.
pub(crate) fn extract_response(response: &Value, path: Option<&str>) -> Option<Value> {
    match path {
        None => Some(response.clone()),
        Some(path) => match response {
            Value::Object(map) => crate::data::lookup_path(map, path).cloned(),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingClient;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn core() -> BrickCore {
        let ctx = BrickContext::new(
            BoxNetworkClient::new(RecordingClient::new()),
            EngineConfig::default(),
        );
        BrickCore::new("b1", "test", ctx)
    }

    #[test]
    fn invalid_configuration_moves_to_invalid_and_emits_error() {
        let core = core();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        core.ctx().bus.on("error:b1", move |payload| {
            s.lock().unwrap().push(payload["message"].clone());
        });

        let result = core.begin(Err("missing endpoint".into())).unwrap_err();

        assert!(!result.success);
        assert_eq!(core.state(), BrickState::Invalid);
        assert_eq!(*seen.lock().unwrap(), vec![json!("missing endpoint")]);
    }

    #[test]
    fn status_events_follow_state_changes() {
        let core = core();
        let states = Arc::new(StdMutex::new(Vec::new()));
        let s = states.clone();
        core.ctx().bus.on("status:b1", move |payload| {
            s.lock().unwrap().push(payload["state"].as_str().unwrap().to_string());
        });

        core.begin(Ok(())).unwrap();
        core.complete(CompletePayload::default());

        assert_eq!(
            *states.lock().unwrap(),
            vec!["validating", "executing", "completed"]
        );
    }

    #[test]
    fn destroyed_bricks_refuse_to_run() {
        let core = core();
        core.set_state(BrickState::Destroyed);
        assert!(core.begin(Ok(())).is_err());
        core.set_state(BrickState::Executing);
        assert_eq!(core.state(), BrickState::Destroyed);
    }

    #[test]
    fn destroyed_bricks_stay_silent() {
        let core = core();
        let seen = Arc::new(StdMutex::new(0));
        let s = seen.clone();
        core.ctx().bus.on("complete:b1", move |_| *s.lock().unwrap() += 1);
        core.set_state(BrickState::Destroyed);

        let result = core.complete(CompletePayload::default());

        assert!(result.success);
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn response_extraction() {
        let response = json!({"data": {"url": "a.png"}});
        assert_eq!(
            extract_response(&response, Some("data.url")),
            Some(json!("a.png"))
        );
        assert_eq!(extract_response(&response, Some("nope")), None);
        assert_eq!(extract_response(&response, None), Some(response.clone()));
    }
}

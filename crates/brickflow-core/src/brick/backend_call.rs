//! `backend_call`: one network call per run, with the response stored in the
//! workflow data.
//!
//! With `autoExecute: false` the brick stays idle after `execute()` until a
//! `trigger:<id>` event arrives. Once a call has been made, `execute()`
//! returns the recorded result instead of calling again; only `trigger()`
//! or `reset()` lead to another call. Runs are serialized, so an `execute()`
//! that overlaps an in-flight call waits for it and returns its result.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use brickflow_types::brick::{
    BackendCallBrickConfig, BrickConfig, BrickExecutionResult, BrickState, RenderDescriptor,
};
use brickflow_types::error::BrickError;
use brickflow_types::event::CompletePayload;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};

use super::{Brick, BrickContext, BrickCore, extract_response};
use crate::network::{CallDeduplicator, NetworkRequest};
use crate::template::{interpolate, interpolate_value};

const METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

pub struct BackendCallBrick {
    core: BrickCore,
    config: BackendCallBrickConfig,
    has_executed: AtomicBool,
    last_result: Mutex<Option<BrickExecutionResult>>,
    /// Held for the duration of a call.
    in_flight: tokio::sync::Mutex<()>,
}

impl BackendCallBrick {
    pub fn new(config: BrickConfig, ctx: BrickContext) -> anyhow::Result<Self> {
        let typed: BackendCallBrickConfig = config
            .parse_settings()
            .with_context(|| format!("invalid backend_call config for brick '{}'", config.id))?;
        Ok(Self {
            core: BrickCore::new(&config.id, &config.brick_type, ctx),
            config: typed,
            has_executed: AtomicBool::new(false),
            last_result: Mutex::new(None),
            in_flight: tokio::sync::Mutex::new(()),
        })
    }

    pub fn has_executed(&self) -> bool {
        self.has_executed.load(Ordering::SeqCst)
    }

    /// Literal payload, then interpolated fields, then the legacy mapping.
    fn build_payload(&self, data: &Map<String, Value>) -> Option<Value> {
        if let Some(payload) = &self.config.payload {
            return Some(interpolate_value(payload, data));
        }
        if let Some(fields) = &self.config.payload_fields {
            let body: Map<String, Value> = fields
                .iter()
                .map(|(field, template)| {
                    (field.clone(), interpolate_value(&Value::String(template.clone()), data))
                })
                .collect();
            return Some(Value::Object(body));
        }
        if let Some(mapping) = &self.config.payload_mapping {
            let body: Map<String, Value> = mapping
                .iter()
                .map(|(field, path)| {
                    let value = crate::data::lookup_path(data, path)
                        .cloned()
                        .unwrap_or(Value::Null);
                    (field.clone(), value)
                })
                .collect();
            return Some(Value::Object(body));
        }
        None
    }

    fn build_request(&self) -> NetworkRequest {
        let ctx = self.core.ctx();
        let data = ctx.data.snapshot();
        let headers: BTreeMap<String, String> = self
            .config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), interpolate(v, &data)))
            .collect();
        let timeout_ms = self
            .config
            .timeout_ms
            .unwrap_or(ctx.settings.default_timeout_ms);
        let mut request = NetworkRequest::new(
            self.config.method.to_uppercase(),
            interpolate(&self.config.endpoint, &data),
            timeout_ms,
        )
        .with_headers(headers);
        if let Some(body) = self.build_payload(&data) {
            request = request.with_body(body);
        }
        request
    }

    async fn call(&self) -> BrickExecutionResult {
        self.has_executed.store(true, Ordering::SeqCst);
        self.core.set_state(BrickState::Executing);
        let ctx = self.core.ctx();
        let request = self.build_request();
        tracing::debug!(brick_id = %self.core.id(), method = %request.method, url = %request.url, "backend call");

        let response = if self.config.dedupe {
            ctx.dedup.call(&ctx.network, request).await
        } else {
            CallDeduplicator::call_direct(&ctx.network, request).await
        };

        let result = match response {
            Ok(response) => self.settle(&response),
            Err(e) => self.core.fail(e.into()),
        };
        *self.last_result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        result
    }

    fn settle(&self, response: &Value) -> BrickExecutionResult {
        let binding = self.config.save_response.as_ref();
        let path = binding.and_then(|b| b.path.as_deref());
        let Some(extracted) = extract_response(response, path) else {
            return self.core.fail(
                BrickError::execution(format!(
                    "response has no value at '{}'",
                    path.unwrap_or_default()
                ))
                .with_retryable(false)
                .with_details(response.clone()),
            );
        };
        if let Some(binding) = binding {
            self.core
                .ctx()
                .data
                .set_as(self.core.id(), &binding.key, extracted.clone());
        }
        self.core.complete(
            CompletePayload::with_data(extracted).next_step(self.config.next_step.clone()),
        )
    }
}

impl Brick for BackendCallBrick {
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
        if self.config.endpoint.trim().is_empty() {
            return Err("backend_call brick needs an endpoint".into());
        }
        let method = self.config.method.to_uppercase();
        if !METHODS.contains(&method.as_str()) {
            return Err(format!("unsupported HTTP method '{}'", self.config.method));
        }
        Ok(())
    }

    fn execute(&self) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move {
            let _turn = self.in_flight.lock().await;
            if self.has_executed() {
                if let Some(previous) = self
                    .last_result
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                {
                    tracing::debug!(brick_id = %self.core.id(), "backend call already executed");
                    return previous;
                }
            }
            if let Err(failed) = self.core.begin(self.validate()) {
                return failed;
            }
            if !self.config.auto_execute {
                return BrickExecutionResult::pending_trigger();
            }
            self.call().await
        })
    }

    fn trigger(&self, _payload: Value) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move {
            let _turn = self.in_flight.lock().await;
            match self.core.state() {
                BrickState::Destroyed | BrickState::Invalid => self.core.not_awaiting(),
                BrickState::Created => {
                    if let Err(failed) = self.core.begin(self.validate()) {
                        return failed;
                    }
                    self.call().await
                }
                _ => self.call().await,
            }
        })
    }

    fn reset(&self) {
        self.has_executed.store(false, Ordering::SeqCst);
        *self.last_result.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.core.set_state(BrickState::Created);
    }

    fn destroy(&self) {
        self.core.set_state(BrickState::Destroyed);
    }

    fn render(&self) -> Option<RenderDescriptor> {
        if !self.config.show_status && self.config.auto_execute {
            return None;
        }
        Some(self.core.render(
            "backend_status",
            json!({
                "state": self.core.state(),
                "awaitingTrigger": !self.config.auto_execute && !self.has_executed(),
            }),
        ))
    }
}

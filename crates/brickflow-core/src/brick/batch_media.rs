//! `batch_media_display`: generates one media item per entry of a list,
//! strictly one after another, reporting progress after each item.
//!
//! Generation stops at the first failed item. Items produced before the
//! failure are still saved.

use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use brickflow_types::brick::{
    BatchMediaDisplayBrickConfig, BrickConfig, BrickExecutionResult, BrickState,
    RenderDescriptor,
};
use brickflow_types::error::BrickError;
use brickflow_types::event::{CompletePayload, ProgressPayload};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use super::{Brick, BrickContext, BrickCore, extract_response};
use crate::network::NetworkRequest;
use crate::template::{interpolate, interpolate_value};

pub struct BatchMediaDisplayBrick {
    core: BrickCore,
    config: BatchMediaDisplayBrickConfig,
    produced: Mutex<Vec<Value>>,
}

impl BatchMediaDisplayBrick {
    pub fn new(config: BrickConfig, ctx: BrickContext) -> anyhow::Result<Self> {
        let typed: BatchMediaDisplayBrickConfig = config.parse_settings().with_context(|| {
            format!("invalid batch_media_display config for brick '{}'", config.id)
        })?;
        Ok(Self {
            core: BrickCore::new(&config.id, &config.brick_type, ctx),
            config: typed,
            produced: Mutex::new(Vec::new()),
        })
    }

    fn item_request(&self, item: &Value, index: usize) -> NetworkRequest {
        let ctx = self.core.ctx();
        let mut scope = ctx.data.snapshot();
        scope.insert("item".into(), item.clone());
        scope.insert("index".into(), json!(index));

        let body = match &self.config.item_payload {
            Some(template) => interpolate_value(template, &scope),
            None => item.clone(),
        };
        let timeout_ms = self
            .config
            .timeout_ms
            .unwrap_or(ctx.settings.default_timeout_ms);
        NetworkRequest::new(
            self.config.method.to_uppercase(),
            interpolate(&self.config.endpoint, &scope),
            timeout_ms,
        )
        .with_headers(self.config.headers.clone())
        .with_body(body)
    }

    fn save(&self, produced: &[Value]) {
        if let Some(binding) = &self.config.save_response {
            self.core
                .ctx()
                .data
                .set_as(self.core.id(), &binding.key, Value::Array(produced.to_vec()));
        }
        *self.produced.lock().unwrap_or_else(PoisonError::into_inner) = produced.to_vec();
    }

    async fn generate(&self, items: Vec<Value>) -> BrickExecutionResult {
        let ctx = self.core.ctx();
        let total = items.len();
        let path = self.config.save_response.as_ref().and_then(|b| b.path.as_deref());
        let mut produced = Vec::with_capacity(total);

        self.core.emit_progress(ProgressPayload::counted(0, total));
        for (index, item) in items.iter().enumerate() {
            let request = self.item_request(item, index);
            tracing::debug!(brick_id = %self.core.id(), index, total, "generating batch item");

            let outcome = ctx
                .dedup
                .call(&ctx.network, request)
                .await
                .map_err(BrickError::from)
                .and_then(|response| {
                    extract_response(&response, path).ok_or_else(|| {
                        BrickError::execution(format!(
                            "response has no value at '{}'",
                            path.unwrap_or_default()
                        ))
                    })
                });

            match outcome {
                Ok(media) => {
                    produced.push(media.clone());
                    self.core.emit_progress(ProgressPayload {
                        item: Some(media),
                        ..ProgressPayload::counted(index + 1, total)
                    });
                }
                Err(error) => {
                    self.save(&produced);
                    let completed = produced.len();
                    return self.core.fail(error.with_details(json!({
                        "completed": completed,
                        "total": total,
                        "failedIndex": index,
                    })));
                }
            }
        }

        self.save(&produced);
        self.core
            .complete(CompletePayload::with_data(Value::Array(produced)))
    }
}

impl Brick for BatchMediaDisplayBrick {
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
        if self.config.data_source.trim().is_empty() {
            return Err("batch_media_display brick needs a dataSource".into());
        }
        if self.config.endpoint.trim().is_empty() {
            return Err("batch_media_display brick needs an endpoint".into());
        }
        Ok(())
    }

    fn execute(&self) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move {
            if let Err(failed) = self.core.begin(self.validate()) {
                return failed;
            }
            let timeout = self.core.ctx().settings.data_wait_timeout();
            let items = match self.core.ctx().data.wait_for(&self.config.data_source, timeout).await {
                Ok(Value::Array(items)) => items,
                Ok(_) => {
                    return self.core.fail(BrickError::validation(format!(
                        "'{}' is not a list",
                        self.config.data_source
                    )));
                }
                Err(error) => return self.core.fail(error),
            };
            self.generate(items).await
        })
    }

    fn reset(&self) {
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.core.set_state(BrickState::Created);
    }

    fn destroy(&self) {
        self.core.set_state(BrickState::Destroyed);
    }

    fn render(&self) -> Option<RenderDescriptor> {
        Some(self.core.render(
            "media_gallery",
            json!({
                "mediaType": self.config.media_type,
                "items": *self.produced.lock().unwrap_or_else(PoisonError::into_inner),
            }),
        ))
    }
}

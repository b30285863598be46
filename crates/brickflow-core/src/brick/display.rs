//! `json_display` and `media_display`: present a value from the workflow
//! data, waiting a bounded time for it to appear.

use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use brickflow_types::brick::{
    BrickConfig, BrickExecutionResult, BrickState, JsonDisplayBrickConfig,
    MediaDisplayBrickConfig, RenderDescriptor,
};
use brickflow_types::event::CompletePayload;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use super::{Brick, BrickContext, BrickCore};

/// Wait for `path`, then complete with its value or fail with
/// `DataUnavailable`.
async fn show(core: &BrickCore, path: &str, shown: &Mutex<Option<Value>>) -> BrickExecutionResult {
    let timeout = core.ctx().settings.data_wait_timeout();
    match core.ctx().data.wait_for(path, timeout).await {
        Ok(value) => {
            *shown.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
            core.complete(CompletePayload::with_data(value))
        }
        Err(error) => core.fail(error),
    }
}

fn require_source(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        Err("display brick needs a dataSource".into())
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// json_display
// ---------------------------------------------------------------------------

pub struct JsonDisplayBrick {
    core: BrickCore,
    config: JsonDisplayBrickConfig,
    shown: Mutex<Option<Value>>,
}

impl JsonDisplayBrick {
    pub fn new(config: BrickConfig, ctx: BrickContext) -> anyhow::Result<Self> {
        let typed: JsonDisplayBrickConfig = config
            .parse_settings()
            .with_context(|| format!("invalid json_display config for brick '{}'", config.id))?;
        Ok(Self {
            core: BrickCore::new(&config.id, &config.brick_type, ctx),
            config: typed,
            shown: Mutex::new(None),
        })
    }
}

impl Brick for JsonDisplayBrick {
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
        require_source(&self.config.data_source)
    }

    fn execute(&self) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move {
            if let Err(failed) = self.core.begin(self.validate()) {
                return failed;
            }
            show(&self.core, &self.config.data_source, &self.shown).await
        })
    }

    fn reset(&self) {
        *self.shown.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.core.set_state(BrickState::Created);
    }

    fn destroy(&self) {
        self.core.set_state(BrickState::Destroyed);
    }

    fn render(&self) -> Option<RenderDescriptor> {
        let data = self.shown.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(self.core.render(
            "json_display",
            json!({ "title": self.config.title, "data": data }),
        ))
    }
}

// ---------------------------------------------------------------------------
// media_display
// ---------------------------------------------------------------------------

pub struct MediaDisplayBrick {
    core: BrickCore,
    config: MediaDisplayBrickConfig,
    shown: Mutex<Option<Value>>,
}

impl MediaDisplayBrick {
    pub fn new(config: BrickConfig, ctx: BrickContext) -> anyhow::Result<Self> {
        let typed: MediaDisplayBrickConfig = config
            .parse_settings()
            .with_context(|| format!("invalid media_display config for brick '{}'", config.id))?;
        Ok(Self {
            core: BrickCore::new(&config.id, &config.brick_type, ctx),
            config: typed,
            shown: Mutex::new(None),
        })
    }
}

impl Brick for MediaDisplayBrick {
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
        require_source(&self.config.data_source)
    }

    fn execute(&self) -> BoxFuture<'_, BrickExecutionResult> {
        Box::pin(async move {
            if let Err(failed) = self.core.begin(self.validate()) {
                return failed;
            }
            show(&self.core, &self.config.data_source, &self.shown).await
        })
    }

    fn reset(&self) {
        *self.shown.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.core.set_state(BrickState::Created);
    }

    fn destroy(&self) {
        self.core.set_state(BrickState::Destroyed);
    }

    fn render(&self) -> Option<RenderDescriptor> {
        let source = self.shown.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(self.core.render(
            "media_display",
            json!({
                "mediaType": self.config.media_type,
                "src": source,
                "caption": self.config.caption,
            }),
        ))
    }
}

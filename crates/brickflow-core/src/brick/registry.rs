//! Brick type name -> constructor.
//!
//! Built-in types are registered lazily, exactly once, the first time the
//! registry is consulted. Types registered by the host before that keep
//! precedence over the built-ins of the same name.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use brickflow_types::brick::{
    BackendCallBrickConfig, BackgroundBrickConfig, BatchMediaDisplayBrickConfig, BrickConfig,
    BuiltinBrickType, ConfirmationBrickConfig, JsonDisplayBrickConfig, LlmBrickConfig,
    MediaDisplayBrickConfig, UserInputBrickConfig, WaitingDisplayBrickConfig,
};
use brickflow_types::error::{BrickError, BrickErrorKind};
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;

use super::background::BackgroundBrick;
use super::backend_call::BackendCallBrick;
use super::batch_media::BatchMediaDisplayBrick;
use super::confirmation::ConfirmationBrick;
use super::display::{JsonDisplayBrick, MediaDisplayBrick};
use super::llm::LlmBrick;
use super::user_input::UserInputBrick;
use super::waiting_display::WaitingDisplayBrick;
use super::{Brick, BrickContext};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown brick type '{brick_type}' (brick '{brick_id}')")]
    UnknownBrickType { brick_type: String, brick_id: String },

    #[error("failed to construct {brick_type} brick '{brick_id}': {reason}")]
    ConstructionFailed {
        brick_type: String,
        brick_id: String,
        reason: String,
    },
}

impl From<RegistryError> for BrickError {
    fn from(err: RegistryError) -> Self {
        let kind = match &err {
            RegistryError::UnknownBrickType { .. } => BrickErrorKind::UnknownBrickType,
            RegistryError::ConstructionFailed { .. } => BrickErrorKind::ConstructionFailed,
        };
        BrickError::new(kind, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Builds a brick from its config and the shared context. May be async.
pub type BrickCreator = Arc<
    dyn Fn(BrickConfig, BrickContext) -> BoxFuture<'static, anyhow::Result<Arc<dyn Brick>>>
        + Send
        + Sync,
>;

/// Static check of a config before any brick is built.
pub type ConfigCheck = Arc<dyn Fn(&BrickConfig) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    creator: BrickCreator,
    check: Option<ConfigCheck>,
}

#[derive(Default)]
pub struct BrickRegistry {
    creators: DashMap<String, Registration>,
    builtins: OnceLock<()>,
}

impl BrickRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the creator for a type name.
    pub fn register<F, Fut>(&self, brick_type: &str, creator: F)
    where
        F: Fn(BrickConfig, BrickContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Brick>>> + Send + 'static,
    {
        self.insert(brick_type, boxed_creator(creator), None, true);
    }

    /// Register a creator together with a static config check.
    pub fn register_with_check<F, Fut, C>(&self, brick_type: &str, creator: F, check: C)
    where
        F: Fn(BrickConfig, BrickContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<dyn Brick>>> + Send + 'static,
        C: Fn(&BrickConfig) -> Result<(), String> + Send + Sync + 'static,
    {
        self.insert(brick_type, boxed_creator(creator), Some(Arc::new(check)), true);
    }

    fn insert(&self, brick_type: &str, creator: BrickCreator, check: Option<ConfigCheck>, replace: bool) {
        let registration = Registration { creator, check };
        if replace {
            self.creators.insert(brick_type.to_string(), registration);
        } else {
            self.creators
                .entry(brick_type.to_string())
                .or_insert(registration);
        }
    }

    pub fn has_type(&self, brick_type: &str) -> bool {
        self.ensure_builtins();
        self.creators.contains_key(brick_type)
    }

    /// Registered type names, sorted.
    pub fn supported_types(&self) -> Vec<String> {
        self.ensure_builtins();
        let mut types: Vec<String> = self.creators.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Check that a config names a registered type and passes its static
    /// check, without building anything.
    pub fn check_config(&self, config: &BrickConfig) -> Result<(), RegistryError> {
        let registration = self.lookup(config)?;
        match registration.check {
            Some(check) => check(config).map_err(|reason| RegistryError::ConstructionFailed {
                brick_type: config.brick_type.clone(),
                brick_id: config.id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Build a brick instance. Creator errors and panics become
    /// `ConstructionFailed`.
    pub async fn create(
        &self,
        config: BrickConfig,
        ctx: BrickContext,
    ) -> Result<Arc<dyn Brick>, RegistryError> {
        let registration = self.lookup(&config)?;
        let brick_type = config.brick_type.clone();
        let brick_id = config.id.clone();
        let failed = |reason: String| RegistryError::ConstructionFailed {
            brick_type: brick_type.clone(),
            brick_id: brick_id.clone(),
            reason,
        };

        let creator = registration.creator;
        let pending = std::panic::catch_unwind(AssertUnwindSafe(|| creator(config, ctx)))
            .map_err(|_| failed("creator panicked".into()))?;
        match AssertUnwindSafe(pending).catch_unwind().await {
            Ok(Ok(brick)) => {
                tracing::debug!(brick_id = %brick_id, brick_type = %brick_type, "brick created");
                Ok(brick)
            }
            Ok(Err(e)) => Err(failed(format!("{e:#}"))),
            Err(_) => Err(failed("creator panicked".into())),
        }
    }

    fn lookup(&self, config: &BrickConfig) -> Result<Registration, RegistryError> {
        self.ensure_builtins();
        self.creators
            .get(&config.brick_type)
            .map(|r| r.clone())
            .ok_or_else(|| RegistryError::UnknownBrickType {
                brick_type: config.brick_type.clone(),
                brick_id: config.id.clone(),
            })
    }

    fn ensure_builtins(&self) {
        self.builtins.get_or_init(|| {
            for builtin in BuiltinBrickType::ALL {
                let (creator, check) = builtin_registration(builtin);
                self.insert(builtin.as_str(), creator, Some(check), false);
            }
            tracing::debug!(count = BuiltinBrickType::ALL.len(), "registered built-in brick types");
        });
    }
}

impl std::fmt::Debug for BrickRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrickRegistry")
            .field("types", &self.creators.len())
            .finish()
    }
}

fn boxed_creator<F, Fut>(creator: F) -> BrickCreator
where
    F: Fn(BrickConfig, BrickContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Arc<dyn Brick>>> + Send + 'static,
{
    Arc::new(move |config, ctx| creator(config, ctx).boxed())
}

fn sync_creator<B, F>(build: F) -> BrickCreator
where
    B: Brick + 'static,
    F: Fn(BrickConfig, BrickContext) -> anyhow::Result<B> + Send + Sync + 'static,
{
    Arc::new(move |config, ctx| {
        let built = build(config, ctx).map(|brick| Arc::new(brick) as Arc<dyn Brick>);
        async move { built }.boxed()
    })
}

fn settings_check<T: DeserializeOwned + 'static>() -> ConfigCheck {
    Arc::new(|config: &BrickConfig| {
        config
            .parse_settings::<T>()
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
}

fn builtin_registration(builtin: BuiltinBrickType) -> (BrickCreator, ConfigCheck) {
    match builtin {
        BuiltinBrickType::Llm => (sync_creator(LlmBrick::new), settings_check::<LlmBrickConfig>()),
        BuiltinBrickType::UserInput => (
            sync_creator(UserInputBrick::new),
            settings_check::<UserInputBrickConfig>(),
        ),
        BuiltinBrickType::BackendCall => (
            sync_creator(BackendCallBrick::new),
            settings_check::<BackendCallBrickConfig>(),
        ),
        BuiltinBrickType::WaitingDisplay => (
            sync_creator(WaitingDisplayBrick::new),
            settings_check::<WaitingDisplayBrickConfig>(),
        ),
        BuiltinBrickType::JsonDisplay => (
            sync_creator(JsonDisplayBrick::new),
            settings_check::<JsonDisplayBrickConfig>(),
        ),
        BuiltinBrickType::MediaDisplay => (
            sync_creator(MediaDisplayBrick::new),
            settings_check::<MediaDisplayBrickConfig>(),
        ),
        BuiltinBrickType::Confirmation => (
            sync_creator(ConfirmationBrick::new),
            settings_check::<ConfirmationBrickConfig>(),
        ),
        BuiltinBrickType::BatchMediaDisplay => (
            sync_creator(BatchMediaDisplayBrick::new),
            settings_check::<BatchMediaDisplayBrickConfig>(),
        ),
        BuiltinBrickType::Background => (
            sync_creator(BackgroundBrick::new),
            settings_check::<BackgroundBrickConfig>(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brick::BrickCore;
    use crate::network::BoxNetworkClient;
    use crate::test_support::RecordingClient;
    use brickflow_types::brick::{BrickExecutionResult, BrickState};
    use brickflow_types::config::EngineConfig;
    use serde_json::json;

    fn ctx() -> BrickContext {
        BrickContext::new(
            BoxNetworkClient::new(RecordingClient::new()),
            EngineConfig::default(),
        )
    }

    struct EchoBrick {
        core: BrickCore,
    }

    impl Brick for EchoBrick {
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
            Ok(())
        }
        fn execute(&self) -> BoxFuture<'_, BrickExecutionResult> {
            Box::pin(async { BrickExecutionResult::ok(json!("echo")) })
        }
        fn reset(&self) {}
        fn destroy(&self) {}
    }

    #[test]
    fn builtins_are_registered_lazily() {
        let registry = BrickRegistry::new();
        assert!(registry.creators.is_empty());
        assert!(registry.has_type("backend_call"));
        assert_eq!(registry.supported_types().len(), BuiltinBrickType::ALL.len());
    }

    #[tokio::test]
    async fn unknown_types_are_reported() {
        let registry = BrickRegistry::new();
        let err = registry
            .create(BrickConfig::new("x", "carousel", json!({})), ctx())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::UnknownBrickType { ref brick_type, .. } if brick_type == "carousel"));
    }

    #[tokio::test]
    async fn async_custom_creators_are_supported() {
        let registry = BrickRegistry::new();
        registry.register("echo", |config: BrickConfig, ctx: BrickContext| async move {
            tokio::task::yield_now().await;
            Ok(Arc::new(EchoBrick {
                core: BrickCore::new(&config.id, &config.brick_type, ctx),
            }) as Arc<dyn Brick>)
        });

        let brick = registry
            .create(BrickConfig::new("e1", "echo", json!({})), ctx())
            .await
            .unwrap();

        assert_eq!(brick.id(), "e1");
        assert_eq!(brick.execute().await.data, Some(json!("echo")));
        assert!(registry.supported_types().contains(&"echo".to_string()));
    }

    #[tokio::test]
    async fn host_registrations_take_precedence_over_builtins() {
        let registry = BrickRegistry::new();
        registry.register("llm", |config: BrickConfig, ctx: BrickContext| async move {
            Ok(Arc::new(EchoBrick {
                core: BrickCore::new(&config.id, &config.brick_type, ctx),
            }) as Arc<dyn Brick>)
        });

        let brick = registry
            .create(BrickConfig::new("l", "llm", json!({})), ctx())
            .await
            .unwrap();
        assert_eq!(brick.execute().await.data, Some(json!("echo")));
    }

    #[tokio::test]
    async fn creator_failures_and_panics_become_construction_errors() {
        let registry = BrickRegistry::new();
        registry.register("broken", |_: BrickConfig, _: BrickContext| async move {
            Err::<Arc<dyn Brick>, _>(anyhow::anyhow!("model not loaded"))
        });
        registry.register("panicky", |config: BrickConfig, _: BrickContext| async move {
            if !config.id.is_empty() {
                panic!("creator bug");
            }
            Err::<Arc<dyn Brick>, _>(anyhow::anyhow!("no id"))
        });

        let broken = registry
            .create(BrickConfig::new("b", "broken", json!({})), ctx())
            .await
            .err()
            .unwrap();
        assert!(broken.to_string().contains("model not loaded"));

        let panicky = registry
            .create(BrickConfig::new("p", "panicky", json!({})), ctx())
            .await
            .err()
            .unwrap();
        assert!(matches!(panicky, RegistryError::ConstructionFailed { .. }));
    }

    #[test]
    fn check_config_parses_builtin_settings() {
        let registry = BrickRegistry::new();
        assert!(registry
            .check_config(&BrickConfig::new("c", "backend_call", json!({"endpoint": "/x"})))
            .is_ok());
        let err = registry
            .check_config(&BrickConfig::new("c", "backend_call", json!({})))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ConstructionFailed { .. }));
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Classification of a brick failure.
///
/// Carried inside [`BrickError`] so that consumers of `error:<id>` events can
/// decide how to present the failure (inline, retryable banner, developer
/// error) without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrickErrorKind {
    /// Bad or missing input to a brick; fixed by correcting input or config.
    Validation,
    /// The brick's work failed (network failure, downstream 4xx/5xx).
    Execution,
    /// An execution failure caused by an elapsed timeout.
    Timeout,
    /// A value the brick reads from the workflow data never appeared.
    DataUnavailable,
    /// No creator is registered for the brick type.
    UnknownBrickType,
    /// A registered creator failed to build the brick.
    ConstructionFailed,
}

impl BrickErrorKind {
    /// Whether a failure of this kind is retryable unless stated otherwise.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            BrickErrorKind::Execution | BrickErrorKind::Timeout | BrickErrorKind::DataUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BrickErrorKind::Validation => "validation",
            BrickErrorKind::Execution => "execution",
            BrickErrorKind::Timeout => "timeout",
            BrickErrorKind::DataUnavailable => "data_unavailable",
            BrickErrorKind::UnknownBrickType => "unknown_brick_type",
            BrickErrorKind::ConstructionFailed => "construction_failed",
        }
    }
}

impl std::fmt::Display for BrickErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable failure carried in a `BrickExecutionResult` and in the
/// payload of `error:<brick_id>` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind} error: {message}")]
pub struct BrickError {
    pub kind: BrickErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl BrickError {
    pub fn new(kind: BrickErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(BrickErrorKind::Validation, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(BrickErrorKind::Execution, message)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            BrickErrorKind::Timeout,
            format!("request timed out after {timeout_ms} ms"),
        )
    }

    pub fn data_unavailable(path: &str) -> Self {
        Self::new(
            BrickErrorKind::DataUnavailable,
            format!("no value available at '{path}'"),
        )
    }

    /// Override the kind's default retry affordance.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Best-effort conversion of an arbitrary event payload into an error.
    ///
    /// Accepts a serialized `BrickError`, an object with a `message` field,
    /// or a bare string. Anything else becomes a generic execution error.
    pub fn from_payload(payload: &Value) -> Self {
        if let Ok(err) = serde_json::from_value::<BrickError>(payload.clone()) {
            return err;
        }
        match payload {
            Value::String(s) => Self::execution(s.clone()),
            Value::Object(map) => {
                let message = map
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                Self::execution(message)
            }
            _ => Self::execution("unknown error"),
        }
    }
}

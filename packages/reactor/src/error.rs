//! Typed errors for the reactor.
//!
//! Every error carries a [`ErrorCategory`] so callers can separate bad input
//! (expected, logged at warn) from configuration or data problems (unexpected,
//! logged at error). Execution failures are serialised into action results
//! through [`ReactorError::to_result_payload`].

use std::fmt;

use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::expression::ExpressionError;
use crate::patch::PatchError;

/// Errors that can occur while committing, dispatching or scheduling.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The request input could not be found
    #[error("no such input contract: {0}")]
    NoInputContract(String),

    /// The requesting actor could not be found
    #[error("no such actor: {0}")]
    NoActor(Uuid),

    /// Input contract rejected by the action filter
    #[error("input contract does not match filter. action: {action}, contract: {input}")]
    InputMismatch {
        action: String,
        input: String,
        errors: Vec<String>,
    },

    /// Arguments rejected by the action argument schema
    #[error("arguments do not match for action {action}: {arguments}")]
    InvalidArguments { action: String, arguments: Value },

    /// No action contract with this slug
    #[error("no such action: {0}")]
    InvalidAction(String),

    /// Action contract exists but nothing handles it
    #[error("unknown action function: {0}")]
    UnknownHandler(String),

    /// Type contract without a usable schema
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// Referenced type contract does not exist
    #[error("no such type: {0}")]
    NoSuchType(String),

    /// A trigger target resolved to a missing contract
    #[error("no such input contract for trigger {trigger}: {target}")]
    TriggerTargetMissing { trigger: String, target: String },

    #[error("can't update without a version for: {0}")]
    InvalidVersion(String),

    #[error("contract not found: {0}")]
    NotFound(String),

    #[error("contract already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid contract: {0}")]
    InvalidContract(String),

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("could not create execute event for request: {0}")]
    NoExecuteEvent(Uuid),

    /// A derived action ran but reported an error
    #[error("action {action} failed: {data}")]
    ActionFailed { action: String, data: Value },

    #[error("invalid patch: {0}")]
    Patch(#[from] PatchError),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// Storage backend failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Queue backend failed
    #[error("queue error: {0}")]
    Queue(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used for logging level and result payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller supplied something invalid.
    User,
    /// A referenced contract does not exist.
    NotFound,
    /// Write collided with existing state.
    Conflict,
    /// Misconfiguration, data corruption or backend failure.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "user_error"),
            ErrorCategory::NotFound => write!(f, "not_found"),
            ErrorCategory::Conflict => write!(f, "conflict"),
            ErrorCategory::Internal => write!(f, "internal_error"),
        }
    }
}

impl ReactorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ReactorError::NoInputContract(_)
            | ReactorError::InputMismatch { .. }
            | ReactorError::InvalidArguments { .. }
            | ReactorError::InvalidAction(_)
            | ReactorError::NoSuchType(_)
            | ReactorError::Patch(_) => ErrorCategory::User,
            ReactorError::NotFound(_) => ErrorCategory::NotFound,
            ReactorError::AlreadyExists(_) => ErrorCategory::Conflict,
            ReactorError::NoActor(_)
            | ReactorError::UnknownHandler(_)
            | ReactorError::InvalidType(_)
            | ReactorError::TriggerTargetMissing { .. }
            | ReactorError::InvalidVersion(_)
            | ReactorError::InvalidContract(_)
            | ReactorError::InvalidInterval(_)
            | ReactorError::NoExecuteEvent(_)
            | ReactorError::ActionFailed { .. }
            | ReactorError::Expression(_)
            | ReactorError::Storage(_)
            | ReactorError::Queue(_)
            | ReactorError::Json(_) => ErrorCategory::Internal,
        }
    }

    /// Expected errors are the caller's fault and are logged at warn level.
    pub fn is_expected(&self) -> bool {
        self.category() != ErrorCategory::Internal
    }

    /// Stable name of the variant, used in serialised results.
    pub fn name(&self) -> &'static str {
        match self {
            ReactorError::NoInputContract(_) => "NoInputContract",
            ReactorError::NoActor(_) => "NoActor",
            ReactorError::InputMismatch { .. } => "InputMismatch",
            ReactorError::InvalidArguments { .. } => "InvalidArguments",
            ReactorError::InvalidAction(_) => "InvalidAction",
            ReactorError::UnknownHandler(_) => "UnknownHandler",
            ReactorError::InvalidType(_) => "InvalidType",
            ReactorError::NoSuchType(_) => "NoSuchType",
            ReactorError::TriggerTargetMissing { .. } => "TriggerTargetMissing",
            ReactorError::InvalidVersion(_) => "InvalidVersion",
            ReactorError::NotFound(_) => "NotFound",
            ReactorError::AlreadyExists(_) => "AlreadyExists",
            ReactorError::InvalidContract(_) => "InvalidContract",
            ReactorError::InvalidInterval(_) => "InvalidInterval",
            ReactorError::NoExecuteEvent(_) => "NoExecuteEvent",
            ReactorError::ActionFailed { .. } => "ActionFailed",
            ReactorError::Patch(_) => "InvalidPatch",
            ReactorError::Expression(_) => "Expression",
            ReactorError::Storage(_) => "Storage",
            ReactorError::Queue(_) => "Queue",
            ReactorError::Json(_) => "Json",
        }
    }

    /// Serialise for an [`ActionResult`](crate::contract::ActionResult).
    pub fn to_result_payload(&self) -> Value {
        json!({
            "name": self.name(),
            "message": self.to_string(),
            "category": self.category().to_string(),
            "expected": self.is_expected(),
        })
    }

    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ReactorError::Storage(Box::new(err))
    }

    pub fn queue(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ReactorError::Queue(Box::new(err))
    }
}

/// Result type alias for reactor operations.
pub type Result<T> = std::result::Result<T, ReactorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_are_expected() {
        let err = ReactorError::InvalidArguments {
            action: "action-create-card".into(),
            arguments: json!({ "foo": 1 }),
        };
        assert_eq!(err.category(), ErrorCategory::User);
        assert!(err.is_expected());
    }

    #[test]
    fn internal_errors_are_unexpected() {
        let err = ReactorError::UnknownHandler("action-missing".into());
        assert!(!err.is_expected());

        let err = ReactorError::TriggerTargetMissing {
            trigger: "triggered-action-foo".into(),
            target: "missing@1.0.0".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    #[test]
    fn result_payload_carries_classification() {
        let payload = ReactorError::InvalidAction("action-nope@1.0.0".into()).to_result_payload();
        assert_eq!(payload["name"], "InvalidAction");
        assert_eq!(payload["expected"], true);
        assert_eq!(payload["category"], "user_error");
        assert!(payload["message"]
            .as_str()
            .unwrap()
            .contains("action-nope@1.0.0"));
    }
}

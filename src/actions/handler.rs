//! Action handler interface and step results.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::kind::{ActionKind, StepAction};

/// Action handler errors.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Action timed out after {0} ms")]
    Timeout(u64),
    #[error("Action failed: {0}")]
    ExecutionFailed(String),
}

impl ActionError {
    /// Whether retrying the same action can never help.
    pub fn is_fatal(&self) -> bool {
        match self {
            ActionError::MissingParameter(_)
            | ActionError::InvalidParameter { .. }
            | ActionError::PermissionDenied(_) => true,
            ActionError::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

/// Result of an action execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    /// Set by the handler when retrying the same action cannot succeed.
    #[serde(default)]
    pub fatal: bool,
}

impl StepResult {
    /// Create a successful result.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Value::Null,
            fatal: false,
        }
    }

    /// Create a successful result carrying data.
    pub fn success_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            data,
            ..Self::success(message)
        }
    }

    /// Create a retryable failure result.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Value::Null,
            fatal: false,
        }
    }

    /// Create a failure that skips same-action retries.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::failure(message)
        }
    }
}

impl From<ActionError> for StepResult {
    fn from(error: ActionError) -> Self {
        if error.is_fatal() {
            StepResult::fatal(error.to_string())
        } else {
            StepResult::failure(error.to_string())
        }
    }
}

/// Performs the real-world effect of one action kind.
///
/// Handlers never return `Err`; every failure is a [`StepResult`] so the
/// engine can reason about it.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use task_pilot::actions::{ActionHandler, ActionKind, StepAction, StepResult};
///
/// struct Echo;
///
/// #[async_trait]
/// impl ActionHandler for Echo {
///     fn kind(&self) -> ActionKind {
///         ActionKind::Custom
///     }
///
///     async fn execute(&self, action: &StepAction) -> StepResult {
///         StepResult::success(action.describe())
///     }
/// }
/// ```
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// The kind this handler serves.
    fn kind(&self) -> ActionKind;

    /// Execute the action.
    async fn execute(&self, action: &StepAction) -> StepResult;

    /// Whether the action needs an approval before it runs.
    fn is_destructive(&self, action: &StepAction, workspace_root: &Path) -> bool {
        action.is_destructive_by_default(workspace_root)
    }

    /// Whether running the action twice is indistinguishable from once.
    fn is_idempotent(&self, action: &StepAction) -> bool {
        action.is_idempotent_by_default()
    }

    /// Whether a compensating action can be produced once `action` ran.
    fn is_reversible(&self, _action: &StepAction) -> bool {
        false
    }

    /// Compensating action that undoes a completed `action`, if any.
    fn compensation(&self, _action: &StepAction, _result: &StepResult) -> Option<StepAction> {
        None
    }
}

/// Fetch a required string parameter.
pub fn require_str<'a>(action: &'a StepAction, key: &str) -> Result<&'a str, ActionError> {
    action
        .param_str(key)
        .ok_or_else(|| ActionError::MissingParameter(key.to_string()))
}

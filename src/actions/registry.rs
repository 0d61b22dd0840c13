//! Registry mapping action kinds to handlers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use super::handler::{ActionHandler, StepResult};
use super::kind::{ActionKind, StepAction};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Handler for action kind '{0}' is already registered")]
    AlreadyRegistered(ActionKind),
}

/// Handlers indexed by action kind.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for its kind.
    pub fn register<H: ActionHandler + 'static>(&mut self, handler: H) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(handler))
    }

    /// Register a shared handler for its kind.
    pub fn register_arc(&mut self, handler: Arc<dyn ActionHandler>) -> Result<(), RegistryError> {
        let kind = handler.kind();
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Register a handler, replacing any existing one for the kind.
    pub fn replace<H: ActionHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.kind(), Arc::new(handler));
    }

    /// Get the handler for a kind.
    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Kinds with a registered handler, sorted.
    pub fn registered_kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Execute an action through its handler.
    ///
    /// A missing handler is a fatal step failure, not an error.
    pub async fn execute(&self, action: &StepAction) -> StepResult {
        match self.handlers.get(&action.kind) {
            Some(handler) => handler.execute(action).await,
            None => {
                tracing::warn!(kind = %action.kind, "No handler registered");
                StepResult::fatal(format!("No handler registered for action kind '{}'", action.kind))
            }
        }
    }

    /// Destructiveness as declared by the handler (built-in rules otherwise).
    pub fn is_destructive(&self, action: &StepAction, workspace_root: &Path) -> bool {
        match self.handlers.get(&action.kind) {
            Some(handler) => handler.is_destructive(action, workspace_root),
            None => action.is_destructive_by_default(workspace_root),
        }
    }

    /// Idempotency as declared by the handler (built-in rules otherwise).
    pub fn is_idempotent(&self, action: &StepAction) -> bool {
        match self.handlers.get(&action.kind) {
            Some(handler) => handler.is_idempotent(action),
            None => action.is_idempotent_by_default(),
        }
    }

    pub fn is_reversible(&self, action: &StepAction) -> bool {
        self.handlers
            .get(&action.kind)
            .map(|handler| handler.is_reversible(action))
            .unwrap_or(false)
    }

    /// Compensating action for a completed action.
    pub fn compensation(&self, action: &StepAction, result: &StepResult) -> Option<StepAction> {
        self.handlers
            .get(&action.kind)
            .and_then(|handler| handler.compensation(action, result))
    }
}

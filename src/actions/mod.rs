//! Actions module: action kinds, the handler interface and workspace handlers.

mod handler;
mod kind;
mod registry;
pub mod workspace;

pub use handler::{require_str, ActionError, ActionHandler, StepResult};
pub use kind::{is_within_workspace, resolve_in_workspace, ActionKind, StepAction};
pub use registry::{ActionRegistry, RegistryError};
pub use workspace::{workspace_registry, UserInputCallback};

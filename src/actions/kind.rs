//! Action kinds and the step action payload.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Closed set of action kinds a step can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReadResource,
    WriteResource,
    DeleteResource,
    Search,
    GenerateContent,
    RunCommand,
    RequestUserInput,
    Custom,
}

impl ActionKind {
    /// All kinds, in declaration order.
    pub const ALL: [ActionKind; 8] = [
        ActionKind::ReadResource,
        ActionKind::WriteResource,
        ActionKind::DeleteResource,
        ActionKind::Search,
        ActionKind::GenerateContent,
        ActionKind::RunCommand,
        ActionKind::RequestUserInput,
        ActionKind::Custom,
    ];

    /// Wire name (`read_resource`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ReadResource => "read_resource",
            ActionKind::WriteResource => "write_resource",
            ActionKind::DeleteResource => "delete_resource",
            ActionKind::Search => "search",
            ActionKind::GenerateContent => "generate_content",
            ActionKind::RunCommand => "run_command",
            ActionKind::RequestUserInput => "request_user_input",
            ActionKind::Custom => "custom",
        }
    }

    /// Lenient parse of a kind name as produced by a model.
    ///
    /// Accepts dashes or underscores, any case, and a few common aliases
    /// (`read_file`, `shell`, ...). Returns `None` for anything else.
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace(['-', ' '], "_");
        let kind = match normalized.as_str() {
            "read_resource" | "read_file" | "read" => ActionKind::ReadResource,
            "write_resource" | "write_file" | "write" | "create_file" | "edit_file" => {
                ActionKind::WriteResource
            }
            "delete_resource" | "delete_file" | "delete" | "remove_file" => {
                ActionKind::DeleteResource
            }
            "search" | "search_code" | "find" | "grep" => ActionKind::Search,
            "generate_content" | "generate_code" | "generate" => ActionKind::GenerateContent,
            "run_command" | "shell" | "exec" | "command" => ActionKind::RunCommand,
            "request_user_input" | "ask_user" | "user_input" => ActionKind::RequestUserInput,
            "custom" => ActionKind::Custom,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether this kind produces new content from a model.
    pub fn is_generative(&self) -> bool {
        matches!(self, ActionKind::GenerateContent)
    }

    /// Whether this kind addresses a single named resource.
    pub fn targets_resource(&self) -> bool {
        matches!(
            self,
            ActionKind::ReadResource | ActionKind::WriteResource | ActionKind::DeleteResource
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter keys that may name the resource an action targets.
const RESOURCE_KEYS: [&str; 4] = ["path", "file", "resource", "target"];

/// An action: a kind plus an opaque parameter payload.
///
/// The payload is interpreted by the handler registered for `kind`; the
/// engine itself only looks at the resource path (for approval gating and
/// confidence heuristics).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl StepAction {
    /// Create an action with no parameters.
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            params: Map::new(),
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Shorthand for a read of `path`.
    pub fn read(path: impl Into<String>) -> Self {
        Self::new(ActionKind::ReadResource).with_param("path", path.into())
    }

    /// Shorthand for a write of `content` to `path`.
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(ActionKind::WriteResource)
            .with_param("path", path.into())
            .with_param("content", content.into())
    }

    /// Shorthand for a delete of `path`.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(ActionKind::DeleteResource).with_param("path", path.into())
    }

    /// Shorthand for a search for `query`.
    pub fn search(query: impl Into<String>) -> Self {
        Self::new(ActionKind::Search).with_param("query", query.into())
    }

    /// Shorthand for a user input request.
    pub fn ask_user(prompt: impl Into<String>) -> Self {
        Self::new(ActionKind::RequestUserInput).with_param("prompt", prompt.into())
    }

    /// Get a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// The resource path this action names, if any.
    pub fn resource_path(&self) -> Option<&str> {
        RESOURCE_KEYS
            .iter()
            .find_map(|key| self.param_str(key))
            .filter(|s| !s.trim().is_empty())
    }

    /// File name component of the resource path.
    pub fn resource_file_name(&self) -> Option<String> {
        self.resource_path().and_then(|p| {
            Path::new(p)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
    }

    /// Built-in destructiveness classification.
    ///
    /// Deletes and shell commands always gate; writes gate only when they
    /// land outside the workspace root.
    pub fn is_destructive_by_default(&self, workspace_root: &Path) -> bool {
        match self.kind {
            ActionKind::DeleteResource | ActionKind::RunCommand => true,
            ActionKind::WriteResource => match self.resource_path() {
                Some(path) => !is_within_workspace(workspace_root, path),
                None => true,
            },
            _ => false,
        }
    }

    /// Built-in idempotency classification.
    pub fn is_idempotent_by_default(&self) -> bool {
        !matches!(self.kind, ActionKind::RunCommand | ActionKind::Custom)
    }

    /// One-line human description, used in prompts and logs.
    pub fn describe(&self) -> String {
        match self.resource_path() {
            Some(path) => format!("{} {}", self.kind, path),
            None => {
                let params = Value::Object(self.params.clone()).to_string();
                format!("{} {}", self.kind, params)
            }
        }
    }
}

/// Resolve `path` against the workspace root, lexically.
pub fn resolve_in_workspace(workspace_root: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace_root.join(candidate)
    };
    normalize(&joined)
}

/// Whether `path` resolves to a location inside the workspace root.
///
/// A relative root is taken against the current directory. Paths that climb
/// above the filesystem root count as outside.
pub fn is_within_workspace(workspace_root: &Path, path: &str) -> bool {
    let root = if workspace_root.is_absolute() {
        workspace_root.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(workspace_root),
            Err(_) => return false,
        }
    };
    let Some(root) = normalize_strict(&root) else {
        return false;
    };
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    match normalize_strict(&joined) {
        Some(resolved) => resolved.starts_with(&root),
        None => false,
    }
}

fn normalize_strict(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    return None;
                }
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_aliases() {
        assert_eq!(ActionKind::parse("read-resource"), Some(ActionKind::ReadResource));
        assert_eq!(ActionKind::parse("READ_FILE"), Some(ActionKind::ReadResource));
        assert_eq!(ActionKind::parse("shell"), Some(ActionKind::RunCommand));
        assert_eq!(ActionKind::parse("teleport"), None);
    }

    #[test]
    fn test_step_action_serde_shape() {
        let action = StepAction::read("src/main.rs");
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "read_resource");
        assert_eq!(json["params"]["path"], "src/main.rs");

        let back: StepAction = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_destructive_classification() {
        let root = Path::new("/work/project");
        assert!(StepAction::delete("a.txt").is_destructive_by_default(root));
        assert!(StepAction::new(ActionKind::RunCommand)
            .with_param("command", "ls")
            .is_destructive_by_default(root));
        assert!(!StepAction::write("notes/a.txt", "x").is_destructive_by_default(root));
        assert!(StepAction::write("../escape.txt", "x").is_destructive_by_default(root));
        assert!(StepAction::write("/etc/hosts", "x").is_destructive_by_default(root));
        assert!(!StepAction::read("/etc/hosts").is_destructive_by_default(root));
    }

    #[test]
    fn test_destructive_classification_relative_root() {
        let root = Path::new(".");
        assert!(StepAction::write("/etc/hosts", "x").is_destructive_by_default(root));
        assert!(StepAction::write("../escape.txt", "x").is_destructive_by_default(root));
        assert!(StepAction::write("notes/../../up.txt", "x").is_destructive_by_default(root));
        assert!(!StepAction::write("notes/a.txt", "x").is_destructive_by_default(root));
        assert!(!StepAction::write("./notes/../a.txt", "x").is_destructive_by_default(root));
        assert!(!StepAction::write("notes/a.txt", "x").is_destructive_by_default(Path::new("")));
    }

    #[test]
    fn test_parent_dir_above_filesystem_root_is_outside() {
        let root = Path::new("/work");
        assert!(!is_within_workspace(root, "/../../work/a.txt"));
        assert!(is_within_workspace(root, "/work/a/../b.txt"));
    }

    #[test]
    fn test_resource_file_name() {
        let action = StepAction::read("/totally/fake/missing.txt");
        assert_eq!(action.resource_file_name().as_deref(), Some("missing.txt"));
        assert!(StepAction::search("foo").resource_path().is_none());
    }
}

//! Reference handlers that act on a workspace directory.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use super::handler::{require_str, ActionError, ActionHandler, StepResult};
use super::kind::{resolve_in_workspace, ActionKind, StepAction};
use super::registry::ActionRegistry;
use crate::config::content_generation_prompt;
use crate::model::LanguageModel;

/// Directories never descended into when walking a workspace.
pub const SKIPPED_DIRS: [&str; 5] = [".git", "target", "node_modules", ".venv", "dist"];

/// Files larger than this are matched by name only.
const MAX_SEARCH_FILE_BYTES: u64 = 256 * 1024;

/// Callback type for user input requests. `None` means no answer.
pub type UserInputCallback = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Walk `root` breadth-first, returning file paths.
///
/// Stops after `max_files` files or below `max_depth` directory levels.
pub fn walk_files(root: &Path, max_depth: usize, max_files: usize) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![(root.to_path_buf(), 0usize)];

    while let Some((dir, depth)) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                let name = entry.file_name();
                let skip = SKIPPED_DIRS.iter().any(|d| name.to_string_lossy() == *d);
                if !skip && depth < max_depth {
                    pending.push((path, depth + 1));
                }
            } else if file_type.is_file() {
                files.push(path);
                if files.len() >= max_files {
                    return files;
                }
            }
        }
    }

    files
}

fn map_io_error(error: io::Error, path: &str) -> ActionError {
    match error.kind() {
        io::ErrorKind::NotFound => ActionError::NotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => ActionError::PermissionDenied(path.to_string()),
        _ => ActionError::Io(error),
    }
}

/// Reads a file.
pub struct FileReadHandler {
    root: PathBuf,
}

impl FileReadHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read(&self, action: &StepAction) -> Result<StepResult, ActionError> {
        let path = action
            .resource_path()
            .ok_or_else(|| ActionError::MissingParameter("path".to_string()))?;
        let resolved = resolve_in_workspace(&self.root, path);
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| map_io_error(e, path))?;

        Ok(StepResult::success_with(
            format!("Read {} bytes from {}", content.len(), path),
            json!({ "path": path, "content": content }),
        ))
    }
}

#[async_trait]
impl ActionHandler for FileReadHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::ReadResource
    }

    async fn execute(&self, action: &StepAction) -> StepResult {
        self.read(action).await.unwrap_or_else(StepResult::from)
    }
}

/// Writes a file, remembering what it replaced.
pub struct FileWriteHandler {
    root: PathBuf,
}

impl FileWriteHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn write(&self, action: &StepAction) -> Result<StepResult, ActionError> {
        let path = action
            .resource_path()
            .ok_or_else(|| ActionError::MissingParameter("path".to_string()))?;
        let content = require_str(action, "content")?;
        let resolved = resolve_in_workspace(&self.root, path);

        let previous = match tokio::fs::read_to_string(&resolved).await {
            Ok(existing) => Some(existing),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(map_io_error(e, path)),
        };

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io_error(e, path))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| map_io_error(e, path))?;

        Ok(StepResult::success_with(
            format!("Wrote {} bytes to {}", content.len(), path),
            json!({
                "path": path,
                "created": previous.is_none(),
                "previous_content": previous,
            }),
        ))
    }
}

#[async_trait]
impl ActionHandler for FileWriteHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::WriteResource
    }

    async fn execute(&self, action: &StepAction) -> StepResult {
        self.write(action).await.unwrap_or_else(StepResult::from)
    }

    fn is_reversible(&self, _action: &StepAction) -> bool {
        true
    }

    fn compensation(&self, action: &StepAction, result: &StepResult) -> Option<StepAction> {
        let path = action.resource_path()?;
        if result.data.get("created").and_then(|v| v.as_bool()) == Some(true) {
            return Some(StepAction::delete(path));
        }
        result
            .data
            .get("previous_content")
            .and_then(|v| v.as_str())
            .map(|previous| StepAction::write(path, previous))
    }
}

/// Deletes a file, capturing its text content for compensation.
pub struct FileDeleteHandler {
    root: PathBuf,
}

impl FileDeleteHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn delete(&self, action: &StepAction) -> Result<StepResult, ActionError> {
        let path = action
            .resource_path()
            .ok_or_else(|| ActionError::MissingParameter("path".to_string()))?;
        let resolved = resolve_in_workspace(&self.root, path);

        // Binary files are deleted without a restorable snapshot.
        let previous = tokio::fs::read_to_string(&resolved).await.ok();
        tokio::fs::remove_file(&resolved)
            .await
            .map_err(|e| map_io_error(e, path))?;

        Ok(StepResult::success_with(
            format!("Deleted {}", path),
            json!({ "path": path, "previous_content": previous }),
        ))
    }
}

#[async_trait]
impl ActionHandler for FileDeleteHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::DeleteResource
    }

    async fn execute(&self, action: &StepAction) -> StepResult {
        self.delete(action).await.unwrap_or_else(StepResult::from)
    }

    /// Only text content is captured.
    fn is_reversible(&self, _action: &StepAction) -> bool {
        true
    }

    fn compensation(&self, action: &StepAction, result: &StepResult) -> Option<StepAction> {
        let path = action.resource_path()?;
        result
            .data
            .get("previous_content")
            .and_then(|v| v.as_str())
            .map(|previous| StepAction::write(path, previous))
    }
}

/// Searches file names and contents under the workspace.
pub struct SearchHandler {
    root: PathBuf,
    max_depth: usize,
    max_results: usize,
}

impl SearchHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_depth: 12,
            max_results: 50,
        }
    }

    /// Set the result limit.
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    fn search_blocking(
        root: PathBuf,
        query: String,
        max_depth: usize,
        max_results: usize,
    ) -> Vec<serde_json::Value> {
        let needle = query.to_lowercase();
        let mut matches = Vec::new();

        for file in walk_files(&root, max_depth, 20_000) {
            let relative = file
                .strip_prefix(&root)
                .unwrap_or(&file)
                .to_string_lossy()
                .into_owned();

            if relative.to_lowercase().contains(&needle) {
                matches.push(json!({ "path": relative, "line": null }));
            } else if fs::metadata(&file)
                .map(|m| m.len() <= MAX_SEARCH_FILE_BYTES)
                .unwrap_or(false)
            {
                if let Ok(content) = fs::read_to_string(&file) {
                    if let Some((line_no, _)) = content
                        .lines()
                        .enumerate()
                        .find(|(_, line)| line.to_lowercase().contains(&needle))
                    {
                        matches.push(json!({ "path": relative, "line": line_no + 1 }));
                    }
                }
            }

            if matches.len() >= max_results {
                break;
            }
        }

        matches
    }
}

#[async_trait]
impl ActionHandler for SearchHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Search
    }

    async fn execute(&self, action: &StepAction) -> StepResult {
        let query = match require_str(action, "query") {
            Ok(query) if !query.trim().is_empty() => query.trim().to_string(),
            Ok(_) => {
                return ActionError::InvalidParameter {
                    name: "query".to_string(),
                    reason: "empty".to_string(),
                }
                .into()
            }
            Err(e) => return e.into(),
        };
        let root = match action.param_str("path") {
            Some(sub) => resolve_in_workspace(&self.root, sub),
            None => self.root.clone(),
        };

        let (max_depth, max_results) = (self.max_depth, self.max_results);
        let q = query.clone();
        let matches = match tokio::task::spawn_blocking(move || {
            Self::search_blocking(root, q, max_depth, max_results)
        })
        .await
        {
            Ok(matches) => matches,
            Err(e) => return StepResult::failure(format!("Search task failed: {}", e)),
        };

        if matches.is_empty() {
            StepResult::failure(format!("No matches for '{}'", query))
        } else {
            StepResult::success_with(
                format!("Found {} match(es) for '{}'", matches.len(), query),
                json!({ "query": query, "matches": matches }),
            )
        }
    }
}

/// Runs a shell command in the workspace root.
pub struct RunCommandHandler {
    root: PathBuf,
    timeout: Duration,
}

impl RunCommandHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, action: &StepAction) -> Result<StepResult, ActionError> {
        let command_line = require_str(action, "command")?;

        let mut command = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command_line);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command_line);
            c
        };
        command.current_dir(&self.root).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ActionError::Timeout(self.timeout.as_millis() as u64))??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let data = json!({
            "command": command_line,
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        });

        if output.status.success() {
            Ok(StepResult::success_with(
                format!("Command succeeded: {}", command_line),
                data,
            ))
        } else {
            let mut result = StepResult::failure(format!(
                "Command exited with {:?}: {}",
                output.status.code(),
                stderr.lines().last().unwrap_or("")
            ));
            result.data = data;
            Ok(result)
        }
    }
}

#[async_trait]
impl ActionHandler for RunCommandHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::RunCommand
    }

    async fn execute(&self, action: &StepAction) -> StepResult {
        self.run(action).await.unwrap_or_else(StepResult::from)
    }
}

/// Generates content through the language model.
pub struct GenerateContentHandler {
    model: Arc<dyn LanguageModel>,
}

impl GenerateContentHandler {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ActionHandler for GenerateContentHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::GenerateContent
    }

    async fn execute(&self, action: &StepAction) -> StepResult {
        let instructions = match action
            .param_str("prompt")
            .or_else(|| action.param_str("description"))
        {
            Some(text) => text,
            None => return ActionError::MissingParameter("prompt".to_string()).into(),
        };
        let prompt = content_generation_prompt(instructions, action.param_str("language"));

        match self.model.complete(&prompt).await {
            Ok(content) if !content.trim().is_empty() => StepResult::success_with(
                format!("Generated {} characters", content.len()),
                json!({ "content": content }),
            ),
            Ok(_) => StepResult::failure("Model returned empty content"),
            Err(e) => StepResult::failure(format!("Generation failed: {}", e)),
        }
    }
}

/// Asks the user through a callback.
pub struct UserInputHandler {
    callback: UserInputCallback,
}

impl UserInputHandler {
    pub fn new(callback: UserInputCallback) -> Self {
        Self { callback }
    }

    /// Handler reading answers from the console.
    pub fn console() -> Self {
        Self::new(Arc::new(console_input))
    }
}

#[async_trait]
impl ActionHandler for UserInputHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::RequestUserInput
    }

    async fn execute(&self, action: &StepAction) -> StepResult {
        let prompt = action
            .param_str("prompt")
            .or_else(|| action.param_str("question"))
            .unwrap_or("Input required")
            .to_string();
        let callback = self.callback.clone();

        match tokio::task::spawn_blocking(move || callback(&prompt)).await {
            Ok(Some(answer)) if !answer.trim().is_empty() => StepResult::success_with(
                "User provided input",
                json!({ "answer": answer.trim() }),
            ),
            Ok(_) => StepResult::failure("No input provided by user"),
            Err(e) => StepResult::failure(format!("Input task failed: {}", e)),
        }
    }
}

/// Default user input callback using console input.
fn console_input(prompt: &str) -> Option<String> {
    print!("{}\n> ", prompt);
    io::stdout().flush().ok()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    Some(line.trim().to_string())
}

/// Echoes custom actions back as successful results.
pub struct CustomEchoHandler;

#[async_trait]
impl ActionHandler for CustomEchoHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Custom
    }

    async fn execute(&self, action: &StepAction) -> StepResult {
        StepResult::success_with(
            format!("Custom action acknowledged: {}", action.describe()),
            serde_json::Value::Object(action.params.clone()),
        )
    }
}

/// Registry with every workspace handler registered.
pub fn workspace_registry(
    root: impl Into<PathBuf>,
    model: Arc<dyn LanguageModel>,
    user_input: Option<UserInputCallback>,
) -> ActionRegistry {
    let root = root.into();
    let mut registry = ActionRegistry::new();
    registry.replace(FileReadHandler::new(&root));
    registry.replace(FileWriteHandler::new(&root));
    registry.replace(FileDeleteHandler::new(&root));
    registry.replace(SearchHandler::new(&root));
    registry.replace(RunCommandHandler::new(&root));
    registry.replace(GenerateContentHandler::new(model));
    registry.replace(match user_input {
        Some(callback) => UserInputHandler::new(callback),
        None => UserInputHandler::console(),
    });
    registry.replace(CustomEchoHandler);
    registry
}

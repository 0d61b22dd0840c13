//! Persisted task records.
//!
//! One pretty-printed JSON file per task, named `<task-id>.json`. The
//! record carries a schema version so external stores can migrate.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::reasoning::ReasoningCycle;
use super::task::{Task, TaskSummary};

pub const RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("No record for task {0}")]
    NotFound(String),
    #[error("Invalid task id: {0}")]
    InvalidId(String),
}

/// A task with its full reasoning history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub schema_version: u32,
    pub task: Task,
    /// Every cycle of every step, in execution order.
    pub cycles: Vec<ReasoningCycle>,
    #[serde(default)]
    pub summary: Option<TaskSummary>,
    pub saved_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task: Task, cycles: Vec<ReasoningCycle>, summary: Option<TaskSummary>) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            task,
            cycles,
            summary,
            saved_at: Utc::now(),
        }
    }

    /// Cycles of one step.
    pub fn cycles_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a ReasoningCycle> {
        self.cycles.iter().filter(move |c| c.step_id == step_id)
    }
}

/// Directory-backed record store.
#[derive(Debug, Clone)]
pub struct TaskRecordStore {
    dir: PathBuf,
}

impl TaskRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> Result<PathBuf, RecordError> {
        let valid = !task_id.is_empty()
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(RecordError::InvalidId(task_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", task_id)))
    }

    /// Write a record, replacing any earlier one for the same task.
    pub fn save(&self, record: &TaskRecord) -> Result<PathBuf, RecordError> {
        let path = self.path_for(&record.task.id)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, serde_json::to_string_pretty(record)?)?;
        tracing::debug!(task_id = %record.task.id, "Saved task record to {}", path.display());
        Ok(path)
    }

    pub fn load(&self, task_id: &str) -> Result<TaskRecord, RecordError> {
        let path = self.path_for(task_id)?;
        if !path.exists() {
            return Err(RecordError::NotFound(task_id.to_string()));
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Ids of all stored records, sorted.
    pub fn list(&self) -> Result<Vec<String>, RecordError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                path.file_stem().map(|s| s.to_string_lossy().into_owned())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

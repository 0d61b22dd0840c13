//! Strategy memory: historical success rates keyed by action pattern.
//!
//! Keys are a SHA-256 digest of the action kind plus the shape of its
//! parameters (sorted keys and JSON value types), so `read README.md` and
//! `read Cargo.toml` share a record. Lookups are exact-key only.
//!
//! The store is shared between concurrently running tasks, hence the lock.
//! Nothing is ever deleted by normal operation.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use super::task::{StepStatus, Task, TaskStatus};
use crate::actions::StepAction;

/// Errors from loading or saving the store.
#[derive(Error, Debug)]
pub enum StrategyMemoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Outcome counters for one action pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub pattern_hash: String,
    /// Canonical shape the hash was computed from.
    #[serde(default)]
    pub pattern: String,
    pub success_count: u64,
    pub attempt_count: u64,
    pub last_used_at: DateTime<Utc>,
}

impl StrategyRecord {
    /// Success rate in `[0, 1]`; zero when never attempted.
    pub fn success_rate(&self) -> f64 {
        if self.attempt_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.attempt_count as f64
        }
    }
}

/// Aggregate counters across all records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub patterns: usize,
    pub attempts: u64,
    pub successes: u64,
}

#[derive(Serialize, Deserialize)]
struct MemoryFile {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    records: Vec<StrategyRecord>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Canonical shape string of an action: `kind:key=type,key=type`.
pub fn pattern_shape(action: &StepAction) -> String {
    let mut keys: Vec<_> = action
        .params
        .iter()
        .map(|(key, value)| format!("{}={}", key, value_type(value)))
        .collect();
    keys.sort();
    format!("{}:{}", action.kind, keys.join(","))
}

/// Hex SHA-256 of [`pattern_shape`].
pub fn pattern_hash(action: &StepAction) -> String {
    let digest = Sha256::digest(pattern_shape(action).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Thread-safe strategy store.
#[derive(Debug, Default)]
pub struct StrategyMemory {
    records: RwLock<HashMap<String, StrategyRecord>>,
}

impl StrategyMemory {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file. A missing file yields an empty store.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StrategyMemoryError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path)?;
        let file: MemoryFile = serde_json::from_str(&content)?;
        let records = file
            .records
            .into_iter()
            .map(|r| (r.pattern_hash.clone(), r))
            .collect();

        Ok(Self {
            records: RwLock::new(records),
        })
    }

    /// Save to a JSON file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StrategyMemoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = MemoryFile {
            version: default_version(),
            records: self.records(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, StrategyRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, StrategyRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Exact-pattern lookup.
    pub fn lookup(&self, action: &StepAction) -> Option<StrategyRecord> {
        self.lookup_hash(&pattern_hash(action))
    }

    pub fn lookup_hash(&self, hash: &str) -> Option<StrategyRecord> {
        self.read().get(hash).cloned()
    }

    /// Count one attempt of `action`'s pattern.
    pub fn record(&self, action: &StepAction, success: bool) {
        let hash = pattern_hash(action);
        let now = Utc::now();
        let mut records = self.write();
        let record = records.entry(hash.clone()).or_insert_with(|| StrategyRecord {
            pattern_hash: hash,
            pattern: pattern_shape(action),
            success_count: 0,
            attempt_count: 0,
            last_used_at: now,
        });
        record.attempt_count += 1;
        if success {
            record.success_count += 1;
        }
        record.last_used_at = now;
    }

    /// Fold a finished task into the store.
    ///
    /// Each step that was attempted counts once under its planned action,
    /// as a success if it ended completed (directly or via a fallback).
    /// Steps never reached stay uncounted. Cancelled and unfinished tasks
    /// are ignored.
    pub fn record_task(&self, task: &Task) -> usize {
        if !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            return 0;
        }

        let mut counted = 0;
        for step in task.steps() {
            if matches!(step.status, StepStatus::Pending | StepStatus::AwaitingApproval) {
                continue;
            }
            self.record(&step.planned_action, step.status == StepStatus::Completed);
            counted += 1;
        }
        debug!(task_id = %task.id, steps = counted, "Strategy memory updated");
        counted
    }

    /// All records, sorted by pattern.
    pub fn records(&self) -> Vec<StrategyRecord> {
        let mut records: Vec<_> = self.read().values().cloned().collect();
        records.sort_by(|a, b| a.pattern.cmp(&b.pattern).then(a.pattern_hash.cmp(&b.pattern_hash)));
        records
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stats(&self) -> MemoryStats {
        self.read().values().fold(
            MemoryStats::default(),
            |mut stats, record| {
                stats.patterns += 1;
                stats.attempts += record.attempt_count;
                stats.successes += record.success_count;
                stats
            },
        )
    }
}

//! Persisted settings for the task-pilot CLI.
//! Stored in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::{EngineConfig, PlannerConfig, ReasoningConfig, RetryPolicy, StuckConfig};
use crate::config::SYSTEM_PROMPT;
use crate::model::{ModelConfig, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};

/// Application settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Model API base URL
    pub base_url: String,
    /// Model API key
    pub api_key: String,
    /// Model name
    pub model_name: String,
    /// Maximum retries for model requests
    pub max_retries: u32,
    /// Retry delay in seconds for model requests
    pub retry_delay: u64,
    /// Retry budget of every planned step
    pub step_max_retries: u32,
    /// First backoff delay between step retries
    pub backoff_base_ms: u64,
    /// Backoff cap
    pub backoff_max_ms: u64,
    /// Budget for each model call inside a reasoning cycle
    pub phase_timeout_secs: u64,
    pub repeated_error_threshold: u32,
    pub step_timeout_ms: u64,
    pub no_progress_threshold: u32,
    /// Escalations allowed per task
    pub max_escalations: u32,
    /// Approve destructive steps without asking
    pub auto_approve: bool,
    /// Strategy memory file; empty means the default data dir location
    pub strategy_memory_path: String,
    /// Task record directory; empty means the default data dir location
    pub records_dir: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
            step_max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 10_000,
            phase_timeout_secs: 60,
            repeated_error_threshold: 3,
            step_timeout_ms: 30_000,
            no_progress_threshold: 3,
            max_escalations: 3,
            auto_approve: false,
            strategy_memory_path: String::new(),
            records_dir: String::new(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "task-pilot", "task-pilot")
}

impl AppSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the data directory path.
    pub fn data_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Load settings from the config file.
    pub fn load() -> Self {
        let loaded: Self = Self::settings_path()
            .and_then(|path| fs::read_to_string(&path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        loaded.backfilled()
    }

    /// Replace zero or empty values left by older config files.
    pub fn backfilled(mut self) -> Self {
        let defaults = Self::default();

        if self.base_url.is_empty() {
            self.base_url = defaults.base_url;
        }
        if self.model_name.is_empty() {
            self.model_name = defaults.model_name;
        }
        if self.step_max_retries == 0 {
            self.step_max_retries = defaults.step_max_retries;
        }
        if self.backoff_base_ms == 0 {
            self.backoff_base_ms = defaults.backoff_base_ms;
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            self.backoff_max_ms = defaults.backoff_max_ms.max(self.backoff_base_ms);
        }
        if self.phase_timeout_secs == 0 {
            self.phase_timeout_secs = defaults.phase_timeout_secs;
        }
        if self.repeated_error_threshold == 0 {
            self.repeated_error_threshold = defaults.repeated_error_threshold;
        }
        if self.step_timeout_ms == 0 {
            self.step_timeout_ms = defaults.step_timeout_ms;
        }
        if self.no_progress_threshold == 0 {
            self.no_progress_threshold = defaults.no_progress_threshold;
        }

        self
    }

    /// Apply `MODEL_*` and `TASK_PILOT_AUTO_APPROVE` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("MODEL_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(key) = env::var("MODEL_API_KEY") {
            self.api_key = key;
        }
        if let Ok(name) = env::var("MODEL_NAME") {
            self.model_name = name;
        }
        if let Some(retries) = env::var("MODEL_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.max_retries = retries;
        }
        if let Some(delay) = env::var("MODEL_RETRY_DELAY")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.retry_delay = delay;
        }
        if let Ok(value) = env::var("TASK_PILOT_AUTO_APPROVE") {
            self.auto_approve = value == "1" || value.eq_ignore_ascii_case("true");
        }
        self
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), String> {
        let dir = Self::config_dir().ok_or("Cannot determine config directory")?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("settings.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&path, content).map_err(|e| format!("Failed to write settings file: {}", e))?;

        Ok(())
    }

    /// Strategy memory file location.
    pub fn strategy_memory_file(&self) -> Option<PathBuf> {
        if !self.strategy_memory_path.is_empty() {
            return Some(PathBuf::from(&self.strategy_memory_path));
        }
        Self::data_dir().map(|dir| dir.join("strategy_memory.json"))
    }

    /// Task record directory.
    pub fn task_records_dir(&self) -> Option<PathBuf> {
        if !self.records_dir.is_empty() {
            return Some(PathBuf::from(&self.records_dir));
        }
        Self::data_dir().map(|dir| dir.join("tasks"))
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::default()
            .with_base_url(&self.base_url)
            .with_api_key(&self.api_key)
            .with_model_name(&self.model_name)
            .with_system_prompt(SYSTEM_PROMPT)
            .with_max_retries(self.max_retries)
            .with_retry_delay(self.retry_delay)
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig::default()
            .with_default_max_retries(self.step_max_retries)
            .with_model_timeout(Duration::from_secs(self.phase_timeout_secs))
    }

    pub fn engine_config(&self) -> EngineConfig {
        let stuck = StuckConfig {
            repeated_error_threshold: self.repeated_error_threshold,
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            no_progress_threshold: self.no_progress_threshold,
            max_escalations: self.max_escalations,
        };
        EngineConfig::default()
            .with_retry_policy(RetryPolicy::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            ))
            .with_stuck_config(stuck)
            .with_reasoning_config(
                ReasoningConfig::default()
                    .with_phase_timeout(Duration::from_secs(self.phase_timeout_secs)),
            )
            .with_auto_approve(self.auto_approve)
    }
}

//! Stuck detection and escalation.
//!
//! A [`StuckMonitor`] lives for one task run. It watches failed cycles and
//! step outcomes and reports three patterns, checked in this order:
//! repeated error, timeout, no progress. When one is found the engine may
//! spend one unit of the escalation budget asking an [`AdvisoryChannel`]
//! for help.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::reasoning::parse_action;
use super::task::StepStatus;
use crate::actions::{ActionKind, StepAction};
use crate::config::advisory_prompt;
use crate::model::{extract_json, LanguageModel, ModelError};

/// Advisory channel errors.
#[derive(Error, Debug)]
pub enum AdvisoryError {
    #[error("Advisor unavailable: {0}")]
    Unavailable(String),
    #[error("Advisor timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Thresholds and budget.
#[derive(Debug, Clone)]
pub struct StuckConfig {
    /// Occurrences of one error signature that count as repeated.
    pub repeated_error_threshold: u32,
    /// Wall-clock time after which a step counts as timed out.
    pub step_timeout: Duration,
    /// Consecutive failed or skipped steps that count as no progress.
    pub no_progress_threshold: u32,
    /// Escalations allowed per task.
    pub max_escalations: u32,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            repeated_error_threshold: 3,
            step_timeout: Duration::from_millis(30_000),
            no_progress_threshold: 3,
            max_escalations: 3,
        }
    }
}

impl StuckConfig {
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_max_escalations(mut self, max: u32) -> Self {
        self.max_escalations = max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckKind {
    RepeatedError,
    Timeout,
    NoProgress,
}

impl StuckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StuckKind::RepeatedError => "repeated_error",
            StuckKind::Timeout => "timeout",
            StuckKind::NoProgress => "no_progress",
        }
    }
}

impl fmt::Display for StuckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

/// A detected impasse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckPattern {
    pub kind: StuckKind,
    pub severity: Severity,
    pub description: String,
}

/// Packet sent to the advisory channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationContext {
    pub task_goal: String,
    pub pattern: StuckPattern,
    pub step_id: String,
    pub step_title: String,
    pub current_action: StepAction,
    pub recent_failures: Vec<String>,
    pub attempted_solutions: Vec<String>,
}

/// Advice for a stuck task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryResponse {
    pub diagnosis: String,
    pub suggested_approach: String,
    #[serde(default)]
    pub alternative_strategies: Vec<String>,
    pub should_continue: bool,
    /// Concrete action to try once more, if the advisor has one.
    #[serde(default)]
    pub alternative_action: Option<StepAction>,
}

impl AdvisoryResponse {
    /// Used when the advisor's reply cannot be understood.
    pub fn default_response() -> Self {
        Self {
            diagnosis: "No diagnosis available".to_string(),
            suggested_approach: "Skip the step and continue with the plan".to_string(),
            alternative_strategies: Vec::new(),
            should_continue: true,
            alternative_action: None,
        }
    }

    fn parse(value: &Value) -> Self {
        let fallback = Self::default_response();
        let Some(obj) = value.as_object() else {
            return fallback;
        };
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            diagnosis: text("diagnosis").unwrap_or(fallback.diagnosis),
            suggested_approach: text("suggested_approach").unwrap_or(fallback.suggested_approach),
            alternative_strategies: obj
                .get("alternative_strategies")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            should_continue: obj
                .get("should_continue")
                .and_then(Value::as_bool)
                .unwrap_or(fallback.should_continue),
            alternative_action: obj.get("alternative_action").and_then(parse_action),
        }
    }
}

/// External advisor consulted when a task is stuck.
#[async_trait]
pub trait AdvisoryChannel: Send + Sync {
    async fn advise(&self, context: &EscalationContext) -> Result<AdvisoryResponse, AdvisoryError>;
}

/// Advisor backed by a language model.
pub struct ModelAdvisor {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl ModelAdvisor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AdvisoryChannel for ModelAdvisor {
    async fn advise(&self, context: &EscalationContext) -> Result<AdvisoryResponse, AdvisoryError> {
        let prompt = advisory_prompt(
            &context.task_goal,
            &format!("{} ({})", context.pattern.kind, context.pattern.description),
            &format!("{}: {}", context.step_title, context.current_action.describe()),
            &context.recent_failures.join("\n"),
            &context.attempted_solutions.join("\n"),
        );

        let text = tokio::time::timeout(self.timeout, self.model.complete(&prompt))
            .await
            .map_err(|_| AdvisoryError::Timeout(self.timeout))??;

        Ok(match extract_json(&text) {
            Some(value) => AdvisoryResponse::parse(&value),
            None => {
                tracing::warn!("Advisor reply contained no JSON; using default advice");
                AdvisoryResponse::default_response()
            }
        })
    }
}

/// Result of asking for help.
#[derive(Debug, Clone)]
pub enum HelpOutcome {
    Advice(AdvisoryResponse),
    /// Budget spent: the monitor cannot seek further help.
    BudgetExhausted,
    /// No channel, or the channel failed.
    Unavailable(String),
}

#[derive(Debug, Clone)]
struct ErrorSignature {
    count: u32,
    last_seen: Instant,
}

/// Per-task stuck detector.
pub struct StuckMonitor {
    config: StuckConfig,
    advisor: Option<Arc<dyn AdvisoryChannel>>,
    errors: HashMap<(ActionKind, String), ErrorSignature>,
    last_error: Option<(ActionKind, String)>,
    step_started: HashMap<String, Instant>,
    consecutive_unproductive: u32,
    last_counted_step: Option<String>,
    escalations: u32,
}

impl StuckMonitor {
    pub fn new(config: StuckConfig, advisor: Option<Arc<dyn AdvisoryChannel>>) -> Self {
        Self {
            config,
            advisor,
            errors: HashMap::new(),
            last_error: None,
            step_started: HashMap::new(),
            consecutive_unproductive: 0,
            last_counted_step: None,
            escalations: 0,
        }
    }

    /// Forget everything from a previous task.
    pub fn reset(&mut self) {
        self.errors.clear();
        self.last_error = None;
        self.step_started.clear();
        self.consecutive_unproductive = 0;
        self.last_counted_step = None;
        self.escalations = 0;
    }

    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    pub fn remaining_escalations(&self) -> u32 {
        self.config.max_escalations.saturating_sub(self.escalations)
    }

    pub fn step_started(&mut self, step_id: &str) {
        self.step_started.insert(step_id.to_string(), Instant::now());
    }

    /// Count a failed attempt. Returns the signature's occurrence count.
    pub fn record_error(&mut self, kind: ActionKind, message: &str) -> u32 {
        let key = (kind, message.trim().to_string());
        let entry = self.errors.entry(key.clone()).or_insert(ErrorSignature {
            count: 0,
            last_seen: Instant::now(),
        });
        entry.count += 1;
        entry.last_seen = Instant::now();
        let count = entry.count;
        self.last_error = Some(key);
        count
    }

    /// Record how a step ended. A step reported twice (failed, then
    /// completed after escalation) only counts once.
    pub fn step_finished(&mut self, step_id: &str, status: StepStatus) {
        let already_counted = self.last_counted_step.as_deref() == Some(step_id);
        match status {
            StepStatus::Completed => self.consecutive_unproductive = 0,
            StepStatus::Failed | StepStatus::Skipped if !already_counted => {
                self.consecutive_unproductive += 1;
            }
            _ => {}
        }
        self.last_counted_step = Some(step_id.to_string());
    }

    /// Evaluate the rules for the current step, in order.
    pub fn check(&self, step_id: &str) -> Option<StuckPattern> {
        if let Some(key) = &self.last_error {
            if let Some(signature) = self.errors.get(key) {
                if signature.count >= self.config.repeated_error_threshold {
                    return Some(StuckPattern {
                        kind: StuckKind::RepeatedError,
                        severity: Severity::High,
                        description: format!(
                            "{} failed {} times with '{}' (last {} ms ago)",
                            key.0,
                            signature.count,
                            key.1,
                            signature.last_seen.elapsed().as_millis()
                        ),
                    });
                }
            }
        }

        if let Some(started) = self.step_started.get(step_id) {
            let elapsed = started.elapsed();
            if elapsed > self.config.step_timeout {
                return Some(StuckPattern {
                    kind: StuckKind::Timeout,
                    severity: Severity::Medium,
                    description: format!(
                        "{} has been running for {} ms",
                        step_id,
                        elapsed.as_millis()
                    ),
                });
            }
        }

        if self.consecutive_unproductive >= self.config.no_progress_threshold {
            return Some(StuckPattern {
                kind: StuckKind::NoProgress,
                severity: Severity::High,
                description: format!(
                    "{} consecutive steps ended without completing",
                    self.consecutive_unproductive
                ),
            });
        }

        None
    }

    /// Spend one escalation on `context`.
    pub async fn seek_help(&mut self, context: &EscalationContext) -> HelpOutcome {
        if self.escalations >= self.config.max_escalations {
            tracing::warn!(
                step_id = %context.step_id,
                "Escalation budget exhausted; cannot seek further help"
            );
            return HelpOutcome::BudgetExhausted;
        }
        let Some(advisor) = self.advisor.clone() else {
            return HelpOutcome::Unavailable("no advisory channel configured".to_string());
        };

        self.escalations += 1;
        tracing::info!(
            step_id = %context.step_id,
            pattern = %context.pattern.kind,
            escalation = self.escalations,
            "Escalating stuck step"
        );

        match advisor.advise(context).await {
            Ok(response) => HelpOutcome::Advice(response),
            Err(e) => {
                tracing::warn!("Escalation failed: {}", e);
                HelpOutcome::Unavailable(e.to_string())
            }
        }
    }
}

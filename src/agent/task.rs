//! Task and step data model.
//!
//! A [`Task`] is owned by the engine for its whole run. Its step order is
//! fixed once planning is done; afterwards only step state and the
//! append-only execution log change.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::confidence::{ConfidenceBreakdown, RiskLevel};
use crate::actions::StepAction;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    Running,
    PausedForApproval,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    AwaitingApproval,
}

/// A pre-planned alternative tried when the primary action fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPlan {
    /// Human-readable precondition.
    pub trigger: String,
    pub action: StepAction,
    /// 0–100.
    pub confidence: u8,
}

impl FallbackPlan {
    pub fn new(trigger: impl Into<String>, action: StepAction, confidence: u8) -> Self {
        Self {
            trigger: trigger.into(),
            action,
            confidence: confidence.min(100),
        }
    }
}

/// One planned unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub order: usize,
    pub title: String,
    pub description: String,
    /// The action currently assigned (may be a substituted alternative).
    pub action: StepAction,
    /// The action as planned.
    pub planned_action: StepAction,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub confidence: ConfidenceBreakdown,
    pub fallbacks: Vec<FallbackPlan>,
    /// Number of fallbacks already substituted, in order.
    #[serde(default)]
    pub fallbacks_used: usize,
    /// A failed critical step fails the whole task.
    #[serde(default)]
    pub critical: bool,
    pub last_error: Option<String>,
}

impl Step {
    /// Create a pending step.
    pub fn new(
        order: usize,
        title: impl Into<String>,
        description: impl Into<String>,
        action: StepAction,
        confidence: ConfidenceBreakdown,
    ) -> Self {
        Self {
            id: format!("step_{}", order + 1),
            order,
            title: title.into(),
            description: description.into(),
            planned_action: action.clone(),
            action,
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            confidence,
            fallbacks: Vec::new(),
            fallbacks_used: 0,
            critical: false,
            last_error: None,
        }
    }

    /// Set max retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Mark the step critical.
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Set the fallback list.
    pub fn with_fallbacks(mut self, fallbacks: Vec<FallbackPlan>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.confidence.risk_level
    }

    /// Mark step as in progress.
    pub fn start(&mut self) {
        self.status = StepStatus::InProgress;
    }

    /// Mark step as completed.
    pub fn complete(&mut self) {
        self.status = StepStatus::Completed;
        self.last_error = None;
    }

    /// Mark step as failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.status = StepStatus::Failed;
    }

    /// Skip this step.
    pub fn skip(&mut self) {
        self.status = StepStatus::Skipped;
    }

    /// Whether another retry fits in the budget.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether unused fallbacks remain.
    pub fn has_unused_fallback(&self) -> bool {
        self.fallbacks_used < self.fallbacks.len()
    }

    /// Take the next unused fallback.
    pub fn take_fallback(&mut self) -> Option<FallbackPlan> {
        let fallback = self.fallbacks.get(self.fallbacks_used).cloned()?;
        self.fallbacks_used += 1;
        Some(fallback)
    }

    /// Whether the step reached a state the engine will not revisit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
        )
    }
}

/// Approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResolution {
    Pending,
    Approved,
    Rejected,
}

/// A request to run a destructive step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub task_id: String,
    pub step_id: String,
    pub step_title: String,
    pub action: StepAction,
    pub risk_level: RiskLevel,
    pub files_affected: Vec<String>,
    /// Whether a compensating action exists.
    pub reversible: bool,
    pub resolution: ApprovalResolution,
}

impl ApprovalRequest {
    /// Resolve the request. Only the first resolution sticks.
    pub fn resolve(&mut self, resolution: ApprovalResolution) -> bool {
        if self.resolution != ApprovalResolution::Pending
            || resolution == ApprovalResolution::Pending
        {
            return false;
        }
        self.resolution = resolution;
        true
    }
}

/// An entry of the task's append-only execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub event: String,
}

/// A goal with its ordered plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_request: String,
    pub workspace_root: PathBuf,
    pub status: TaskStatus,
    steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    execution_log: Vec<ExecutionLogEntry>,
}

impl Task {
    /// Create a task in the planning state.
    pub fn new(user_request: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_request: user_request.into(),
            workspace_root: workspace_root.into(),
            status: TaskStatus::Planning,
            steps: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
            execution_log: Vec::new(),
        }
    }

    /// Attach the plan. Steps are renumbered in the given order.
    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps
            .into_iter()
            .enumerate()
            .map(|(order, mut step)| {
                step.order = order;
                step.id = format!("step_{}", order + 1);
                step
            })
            .collect();
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub(crate) fn step_mut(&mut self, index: usize) -> Option<&mut Step> {
        self.steps.get_mut(index)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn execution_log(&self) -> &[ExecutionLogEntry] {
        &self.execution_log
    }

    /// Append to the execution log.
    pub fn log(&mut self, step_id: Option<&str>, event: impl Into<String>) {
        self.execution_log.push(ExecutionLogEntry {
            at: Utc::now(),
            step_id: step_id.map(str::to_string),
            event: event.into(),
        });
    }

    /// Counts of step outcomes.
    pub fn progress(&self) -> TaskProgress {
        let mut progress = TaskProgress {
            total_count: self.steps.len(),
            ..TaskProgress::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Completed => progress.completed_count += 1,
                StepStatus::Skipped => progress.skipped_count += 1,
                StepStatus::Failed => progress.failed_count += 1,
                _ => {}
            }
        }
        progress
    }
}

/// Step outcome counts, reported after every step transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub completed_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
}

impl TaskProgress {
    /// Calculate completion percentage (completed or skipped).
    pub fn completion_percentage(&self) -> f32 {
        if self.total_count == 0 {
            100.0
        } else {
            ((self.completed_count + self.skipped_count) as f32 / self.total_count as f32) * 100.0
        }
    }
}

impl fmt::Display for TaskProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} skipped / {} total",
            self.completed_count, self.skipped_count, self.total_count
        )
    }
}

/// How a finished task should be read by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Every step completed.
    FullySucceeded,
    /// Completed with skipped steps.
    DegradedSuccess,
    Failed,
    Cancelled,
}

/// Final report of a task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub outcome: TaskOutcome,
    pub progress: TaskProgress,
    /// Steps whose compensating action ran, in rollback order.
    #[serde(default)]
    pub rolled_back_steps: Vec<String>,
    #[serde(default)]
    pub escalations: u32,
    pub duration_ms: u64,
}

impl TaskSummary {
    pub fn from_task(task: &Task, rolled_back_steps: Vec<String>, escalations: u32) -> Self {
        let progress = task.progress();
        let outcome = match task.status {
            TaskStatus::Completed if progress.completed_count == progress.total_count => {
                TaskOutcome::FullySucceeded
            }
            TaskStatus::Completed => TaskOutcome::DegradedSuccess,
            TaskStatus::Cancelled => TaskOutcome::Cancelled,
            _ => TaskOutcome::Failed,
        };
        let end = task.finished_at.unwrap_or_else(Utc::now);
        let duration_ms = (end - task.created_at).num_milliseconds().max(0) as u64;

        Self {
            task_id: task.id.clone(),
            status: task.status,
            outcome,
            progress,
            rolled_back_steps,
            escalations,
            duration_ms,
        }
    }
}

impl fmt::Display for TaskSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.outcome, self.progress)
    }
}

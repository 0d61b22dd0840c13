//! Execution engine: drives a planned task to a terminal state.
//!
//! Steps run strictly in order. Per step the engine gates destructive
//! actions behind an approval, runs reasoning cycles, and on failure picks
//! the next move: a structured alternative from reflection, the next
//! planned fallback, or a backoff retry of the planned action. A step
//! whose retries are exhausted may trigger one escalation round; after
//! that it is skipped, or, if critical, fails the task and rolls back
//! every completed step in reverse order.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use task_pilot::actions::workspace_registry;
//! use task_pilot::agent::{EngineBuilder, PlanRequest, Planner, StrategyMemory, WorkspaceSummary};
//! use task_pilot::model::ModelClient;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let model = Arc::new(ModelClient::with_defaults());
//! let memory = Arc::new(StrategyMemory::new());
//! let planner = Planner::new(model.clone(), memory.clone());
//! let plan = planner
//!     .plan(&PlanRequest::new("Read README.md", WorkspaceSummary::scan(".")))
//!     .await;
//!
//! let engine = EngineBuilder::new()
//!     .with_model(model.clone())
//!     .with_registry(Arc::new(workspace_registry(".", model, None)))
//!     .with_memory(memory)
//!     .auto_approve()
//!     .build()?;
//! let run = engine.run(plan.task).await?;
//! println!("{}", run.summary);
//! # Ok(())
//! # }
//! ```

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use super::confidence::ConfidenceScorer;
use super::reasoning::{
    CycleContext, ReasoningConfig, ReasoningCycle, ReasoningExecutor, Reflection,
};
use super::record::{TaskRecord, TaskRecordStore};
use super::strategy_memory::StrategyMemory;
use super::stuck::{
    AdvisoryChannel, EscalationContext, HelpOutcome, ModelAdvisor, StuckConfig, StuckMonitor,
};
use super::task::{
    ApprovalRequest, ApprovalResolution, Step, StepStatus, Task, TaskProgress, TaskStatus,
    TaskSummary,
};
use crate::actions::{ActionRegistry, StepAction, StepResult};
use crate::model::LanguageModel;

/// Failures recent enough to show an advisor.
const ESCALATION_FAILURE_WINDOW: usize = 5;

/// Engine errors. Execution problems never surface here; they end up in
/// the task's terminal state.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Task {task_id} cannot be executed from state {status:?}")]
    InvalidTaskState { task_id: String, status: TaskStatus },
    #[error("No approval handler registered and auto-approve is disabled")]
    MissingApprovalHandler,
    #[error("A language model is required")]
    MissingModel,
    #[error("An action registry is required")]
    MissingRegistry,
}

/// Exponential backoff between retries of the same action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry `retry` (1-based): `min(base * 2^(retry-1), max)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub stuck: StuckConfig,
    pub reasoning: ReasoningConfig,
    /// Approve destructive steps when no approval handler is registered.
    pub auto_approve_without_handler: bool,
}

impl EngineConfig {
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stuck_config(mut self, stuck: StuckConfig) -> Self {
        self.stuck = stuck;
        self
    }

    pub fn with_reasoning_config(mut self, reasoning: ReasoningConfig) -> Self {
        self.reasoning = reasoning;
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve_without_handler = auto_approve;
        self
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable cancellation flag for one or more task runs.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Decides approval requests for destructive steps.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Resolve the request. Returning `Pending` counts as a rejection.
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalResolution;
}

/// Approves everything.
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalResolution {
        ApprovalResolution::Approved
    }
}

/// Asks on the console.
///
/// The prompt reads stdin on a blocking thread that cancellation cannot
/// interrupt; callers that cancel mid-prompt should exit the process rather
/// than wait for runtime shutdown.
pub struct ConsoleApprover;

#[async_trait]
impl ApprovalHandler for ConsoleApprover {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalResolution {
        let request = request.clone();
        tokio::task::spawn_blocking(move || console_confirmation(&request))
            .await
            .unwrap_or(ApprovalResolution::Rejected)
    }
}

fn console_confirmation(request: &ApprovalRequest) -> ApprovalResolution {
    println!("Approval required for {} ({})", request.step_title, request.step_id);
    println!("  Action: {}", request.action.describe());
    println!("  Risk: {:?}", request.risk_level);
    if !request.files_affected.is_empty() {
        println!("  Files: {}", request.files_affected.join(", "));
    }
    println!(
        "  Reversible: {}",
        if request.reversible { "yes" } else { "no" }
    );
    print!("Proceed? (Y/N): ");
    if io::stdout().flush().is_err() {
        return ApprovalResolution::Rejected;
    }

    let mut input = String::new();
    if io::stdin().lock().read_line(&mut input).is_err() {
        return ApprovalResolution::Rejected;
    }
    if input.trim().eq_ignore_ascii_case("y") {
        ApprovalResolution::Approved
    } else {
        ApprovalResolution::Rejected
    }
}

/// Progress callbacks. All methods default to no-ops.
pub trait ExecutionObserver: Send + Sync {
    fn on_step_start(&self, _task_id: &str, _step: &Step) {}

    fn on_step_complete(&self, _task_id: &str, _step: &Step, _status: StepStatus) {}

    /// Called after every step transition.
    fn on_progress(&self, _task_id: &str, _progress: &TaskProgress) {}

    fn on_cycle(&self, _task_id: &str, _cycle: &ReasoningCycle) {}

    fn on_task_complete(&self, _summary: &TaskSummary) {}
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task: Task,
    /// All cycles in execution order.
    pub cycles: Vec<ReasoningCycle>,
    pub approvals: Vec<ApprovalRequest>,
    pub summary: TaskSummary,
}

impl TaskRun {
    pub fn into_record(self) -> TaskRecord {
        TaskRecord::new(self.task, self.cycles, Some(self.summary))
    }
}

/// Builder for [`ExecutionEngine`].
pub struct EngineBuilder {
    model: Option<Arc<dyn LanguageModel>>,
    registry: Option<Arc<ActionRegistry>>,
    memory: Option<Arc<StrategyMemory>>,
    approval: Option<Arc<dyn ApprovalHandler>>,
    advisor: Option<Arc<dyn AdvisoryChannel>>,
    advisor_disabled: bool,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    record_store: Option<TaskRecordStore>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            model: None,
            registry: None,
            memory: None,
            approval: None,
            advisor: None,
            advisor_disabled: false,
            observers: Vec::new(),
            record_store: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_registry(mut self, registry: Arc<ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_memory(mut self, memory: Arc<StrategyMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = Some(handler);
        self
    }

    /// Approve destructive steps when no handler is registered.
    pub fn auto_approve(mut self) -> Self {
        self.config.auto_approve_without_handler = true;
        self
    }

    /// Use a specific advisory channel instead of the model-backed one.
    pub fn with_advisor(mut self, advisor: Arc<dyn AdvisoryChannel>) -> Self {
        self.advisor = Some(advisor);
        self.advisor_disabled = false;
        self
    }

    /// Never escalate.
    pub fn without_advisor(mut self) -> Self {
        self.advisor = None;
        self.advisor_disabled = true;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Save a record of every finished run.
    pub fn with_record_store(mut self, store: TaskRecordStore) -> Self {
        self.record_store = Some(store);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn build(self) -> Result<ExecutionEngine, EngineError> {
        let model = self.model.ok_or(EngineError::MissingModel)?;
        let registry = self.registry.ok_or(EngineError::MissingRegistry)?;
        let approval: Arc<dyn ApprovalHandler> = match self.approval {
            Some(handler) => handler,
            None if self.config.auto_approve_without_handler => Arc::new(AutoApprove),
            None => return Err(EngineError::MissingApprovalHandler),
        };
        let advisor: Option<Arc<dyn AdvisoryChannel>> = match self.advisor {
            Some(advisor) => Some(advisor),
            None if self.advisor_disabled => None,
            None => Some(Arc::new(
                ModelAdvisor::new(model.clone()).with_timeout(self.config.reasoning.phase_timeout),
            )),
        };

        Ok(ExecutionEngine {
            executor: ReasoningExecutor::with_config(
                model,
                registry.clone(),
                self.config.reasoning.clone(),
            ),
            registry,
            memory: self.memory.unwrap_or_default(),
            approval,
            advisor,
            observers: self.observers,
            record_store: self.record_store,
            config: self.config,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A step that completed, kept for rollback.
struct CompletedStep {
    step_id: String,
    action: StepAction,
    result: StepResult,
}

/// State of one run. Never shared between runs.
struct RunState {
    monitor: StuckMonitor,
    cycles: Vec<ReasoningCycle>,
    approvals: Vec<ApprovalRequest>,
    completed: Vec<CompletedStep>,
    rolled_back: Vec<String>,
}

enum StepFlow {
    Advance,
    CriticalFailure,
    Cancelled,
}

enum Gate {
    Approved,
    Rejected,
    Cancelled,
}

enum NextMove {
    Substitute(StepAction, &'static str),
    Backoff,
    Exhausted,
}

/// Runs planned tasks. One engine can drive several tasks concurrently;
/// only the strategy memory is shared between them.
pub struct ExecutionEngine {
    executor: ReasoningExecutor,
    registry: Arc<ActionRegistry>,
    memory: Arc<StrategyMemory>,
    approval: Arc<dyn ApprovalHandler>,
    advisor: Option<Arc<dyn AdvisoryChannel>>,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    record_store: Option<TaskRecordStore>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<StrategyMemory> {
        &self.memory
    }

    /// Run a task with no external cancellation.
    pub async fn run(&self, task: Task) -> Result<TaskRun, EngineError> {
        self.run_with_cancel(task, CancelHandle::new()).await
    }

    /// Run a task until it reaches a terminal state or `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        mut task: Task,
        cancel: CancelHandle,
    ) -> Result<TaskRun, EngineError> {
        if task.status != TaskStatus::Planning {
            return Err(EngineError::InvalidTaskState {
                task_id: task.id.clone(),
                status: task.status,
            });
        }

        let mut state = RunState {
            monitor: StuckMonitor::new(self.config.stuck.clone(), self.advisor.clone()),
            cycles: Vec::new(),
            approvals: Vec::new(),
            completed: Vec::new(),
            rolled_back: Vec::new(),
        };
        state.monitor.reset();

        task.status = TaskStatus::Running;
        task.log(None, "Execution started");
        tracing::info!(
            task_id = %task.id,
            steps = task.steps().len(),
            "Executing task: {}",
            task.user_request
        );

        for index in 0..task.steps().len() {
            if cancel.is_cancelled() {
                task.status = TaskStatus::Cancelled;
                break;
            }

            match self.run_step(&mut task, index, &mut state, &cancel).await {
                StepFlow::Advance => {}
                StepFlow::Cancelled => {
                    task.status = TaskStatus::Cancelled;
                    break;
                }
                StepFlow::CriticalFailure => {
                    task.status = TaskStatus::Failed;
                    task.log(None, "Critical step failed; rolling back");
                    self.rollback(&mut task, &mut state).await;
                    break;
                }
            }
        }

        if task.status == TaskStatus::Running {
            task.status = TaskStatus::Completed;
        }
        if task.status == TaskStatus::Cancelled {
            task.log(None, "Execution cancelled");
        }
        task.finished_at = Some(Utc::now());

        if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            self.memory.record_task(&task);
        }

        let summary = TaskSummary::from_task(
            &task,
            state.rolled_back.clone(),
            state.monitor.escalations(),
        );
        task.log(None, format!("Finished: {}", summary));
        tracing::info!(task_id = %task.id, status = ?task.status, "Task finished: {}", summary.progress);
        for observer in &self.observers {
            observer.on_task_complete(&summary);
        }

        let run = TaskRun {
            task,
            cycles: state.cycles,
            approvals: state.approvals,
            summary,
        };

        if let Some(store) = &self.record_store {
            if let Err(e) = store.save(&run.clone().into_record()) {
                tracing::warn!(task_id = %run.task.id, "Failed to save task record: {}", e);
            }
        }

        Ok(run)
    }

    async fn run_step(
        &self,
        task: &mut Task,
        index: usize,
        state: &mut RunState,
        cancel: &CancelHandle,
    ) -> StepFlow {
        let Some(step) = task.step_mut(index) else {
            return StepFlow::Advance;
        };
        step.start();
        let step_id = step.id.clone();
        let title = step.title.clone();

        state.monitor.step_started(&step_id);
        task.log(Some(&step_id), format!("Step started: {}", title));
        self.notify_start(task, index);

        let first_cycle = state.cycles.len();
        let mut approved: Vec<StepAction> = Vec::new();
        let mut escalated = false;

        loop {
            let action = task.steps()[index].action.clone();

            if self.registry.is_destructive(&action, &task.workspace_root)
                && !approved.contains(&action)
            {
                let attempted = state.cycles.len() > first_cycle;
                match self.gate(task, index, &action, state, cancel).await {
                    Gate::Approved => approved.push(action.clone()),
                    Gate::Rejected | Gate::Cancelled => {
                        if let Some(step) = task.step_mut(index) {
                            if attempted {
                                step.fail("Cancelled");
                            } else {
                                step.status = StepStatus::Pending;
                            }
                        }
                        return StepFlow::Cancelled;
                    }
                }
            }

            let cycle_number = (state.cycles.len() - first_cycle) as u32 + 1;
            let outcome = self
                .executor
                .run(CycleContext {
                    goal: &task.user_request,
                    step: &task.steps()[index],
                    cycle_number,
                    previous: &state.cycles[first_cycle..],
                    cancel,
                    escalated,
                })
                .await;

            let result = outcome.cycle.result.clone();
            let reflection = outcome.cycle.reflection.clone();
            task.log(
                Some(&step_id),
                format!(
                    "Cycle {}: {} -> {}",
                    cycle_number,
                    action.describe(),
                    result.message
                ),
            );
            for observer in &self.observers {
                observer.on_cycle(&task.id, &outcome.cycle);
            }
            state.cycles.push(outcome.cycle);

            if outcome.action_executed && result.success {
                if let Some(step) = task.step_mut(index) {
                    step.complete();
                }
                state.completed.push(CompletedStep {
                    step_id: step_id.clone(),
                    action,
                    result,
                });
                state.monitor.step_finished(&step_id, StepStatus::Completed);
                task.log(Some(&step_id), "Step completed");
                tracing::info!(task_id = %task.id, step_id = %step_id, "Step completed");
                self.notify_transition(task, index, StepStatus::Completed);
                return if outcome.cancelled {
                    StepFlow::Cancelled
                } else {
                    StepFlow::Advance
                };
            }

            if outcome.cancelled {
                if let Some(step) = task.step_mut(index) {
                    if outcome.action_executed || cycle_number > 1 {
                        step.fail("Cancelled");
                    } else {
                        step.status = StepStatus::Pending;
                    }
                }
                return StepFlow::Cancelled;
            }

            state.monitor.record_error(action.kind, &result.message);
            tracing::warn!(
                task_id = %task.id,
                step_id = %step_id,
                cycle = cycle_number,
                kind = %action.kind,
                "Attempt failed: {}",
                result.message
            );

            // An escalated attempt is the last one.
            if !escalated {
                let next = match task.step_mut(index) {
                    Some(step) => {
                        step.retry_count = (step.retry_count + 1).min(step.max_retries);
                        step.last_error = Some(result.message.clone());
                        if step.can_retry() {
                            self.next_move(step, &reflection, &result)
                        } else {
                            NextMove::Exhausted
                        }
                    }
                    None => NextMove::Exhausted,
                };

                match next {
                    NextMove::Substitute(alternative, source) => {
                        task.log(
                            Some(&step_id),
                            format!("Retrying with {} action: {}", source, alternative.describe()),
                        );
                        self.assign_action(task, index, alternative);
                        continue;
                    }
                    NextMove::Backoff => {
                        let retry = task.steps()[index].retry_count;
                        let delay = self.config.retry.delay(retry);
                        task.log(
                            Some(&step_id),
                            format!("Retrying planned action in {} ms", delay.as_millis()),
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                if let Some(step) = task.step_mut(index) {
                                    step.fail("Cancelled");
                                }
                                return StepFlow::Cancelled;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        let planned = task.steps()[index].planned_action.clone();
                        self.assign_action(task, index, planned);
                        continue;
                    }
                    NextMove::Exhausted => {}
                }
            }

            if let Some(step) = task.step_mut(index) {
                step.fail(result.message.clone());
            }
            state.monitor.step_finished(&step_id, StepStatus::Failed);
            self.notify_transition(task, index, StepStatus::Failed);

            if !escalated {
                match self.escalate(task, index, first_cycle, state, cancel).await {
                    Some(Some(alternative)) => {
                        self.assign_action(task, index, alternative);
                        if let Some(step) = task.step_mut(index) {
                            step.start();
                        }
                        escalated = true;
                        continue;
                    }
                    Some(None) => {}
                    None => return StepFlow::Cancelled,
                }
            }

            let critical = task.steps()[index].critical;
            if critical {
                task.log(Some(&step_id), "Critical step failed");
                tracing::error!(task_id = %task.id, step_id = %step_id, "Critical step failed");
                return StepFlow::CriticalFailure;
            }

            if let Some(step) = task.step_mut(index) {
                step.skip();
            }
            state.monitor.step_finished(&step_id, StepStatus::Skipped);
            task.log(Some(&step_id), "Step skipped");
            tracing::info!(task_id = %task.id, step_id = %step_id, "Step skipped");
            self.notify_transition(task, index, StepStatus::Skipped);
            return StepFlow::Advance;
        }
    }

    /// Choose what runs after a failed attempt with budget left.
    fn next_move(&self, step: &mut Step, reflection: &Reflection, result: &StepResult) -> NextMove {
        let wants_change = reflection.should_retry
            && (!reflection.suggested_changes.is_empty()
                || reflection.alternative_action.is_some());

        if result.fatal || wants_change {
            if let Some(alternative) = reflection.alternative_action.clone() {
                return NextMove::Substitute(alternative, "reflection");
            }
            if let Some(fallback) = step.take_fallback() {
                return NextMove::Substitute(fallback.action, "fallback");
            }
        }

        // Same-action retries only for handlers that report idempotency.
        if !result.fatal && self.registry.is_idempotent(&step.planned_action) {
            return NextMove::Backoff;
        }

        match step.take_fallback() {
            Some(fallback) => NextMove::Substitute(fallback.action, "fallback"),
            None => NextMove::Exhausted,
        }
    }

    /// Replace the step's current action and rescore it.
    fn assign_action(&self, task: &mut Task, index: usize, action: StepAction) {
        if let Some(step) = task.step_mut(index) {
            if step.action != action {
                step.confidence = ConfidenceScorer::score(&action, &self.memory);
                step.action = action;
            }
        }
    }

    async fn gate(
        &self,
        task: &mut Task,
        index: usize,
        action: &StepAction,
        state: &mut RunState,
        cancel: &CancelHandle,
    ) -> Gate {
        let mut request = {
            let step = &task.steps()[index];
            ApprovalRequest {
                id: Uuid::new_v4().to_string(),
                task_id: task.id.clone(),
                step_id: step.id.clone(),
                step_title: step.title.clone(),
                action: action.clone(),
                risk_level: step.risk_level(),
                files_affected: action
                    .resource_path()
                    .map(|p| vec![p.to_string()])
                    .unwrap_or_default(),
                reversible: self.registry.is_reversible(action),
                resolution: ApprovalResolution::Pending,
            }
        };

        task.status = TaskStatus::PausedForApproval;
        if let Some(step) = task.step_mut(index) {
            step.status = StepStatus::AwaitingApproval;
        }
        task.log(
            Some(&request.step_id),
            format!("Awaiting approval for {}", action.describe()),
        );
        tracing::info!(
            task_id = %task.id,
            step_id = %request.step_id,
            "Awaiting approval for {}",
            action.describe()
        );
        self.notify_progress(task);

        let resolution = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            resolution = self.approval.request_approval(&request) => Some(resolution),
        };

        let gate = match resolution {
            None => Gate::Cancelled,
            Some(ApprovalResolution::Approved) => {
                request.resolve(ApprovalResolution::Approved);
                Gate::Approved
            }
            Some(_) => {
                request.resolve(ApprovalResolution::Rejected);
                Gate::Rejected
            }
        };

        match gate {
            Gate::Approved => {
                task.status = TaskStatus::Running;
                if let Some(step) = task.step_mut(index) {
                    step.status = StepStatus::InProgress;
                }
                task.log(Some(&request.step_id), "Approved");
            }
            Gate::Rejected => {
                task.log(Some(&request.step_id), "Approval rejected; cancelling task");
                tracing::warn!(task_id = %task.id, step_id = %request.step_id, "Approval rejected");
            }
            Gate::Cancelled => {}
        }
        state.approvals.push(request);
        gate
    }

    /// One escalation round for an exhausted step.
    ///
    /// `None` means cancelled, `Some(Some(action))` one more attempt with
    /// `action`, `Some(None)` give up.
    async fn escalate(
        &self,
        task: &mut Task,
        index: usize,
        first_cycle: usize,
        state: &mut RunState,
        cancel: &CancelHandle,
    ) -> Option<Option<StepAction>> {
        let step = &task.steps()[index];
        let Some(pattern) = state.monitor.check(&step.id) else {
            return Some(None);
        };
        let step_cycles = &state.cycles[first_cycle..];

        let mut attempted: Vec<String> = Vec::new();
        for cycle in step_cycles {
            let described = cycle.action.describe();
            if !attempted.contains(&described) {
                attempted.push(described);
            }
        }
        let context = EscalationContext {
            task_goal: task.user_request.clone(),
            pattern: pattern.clone(),
            step_id: step.id.clone(),
            step_title: step.title.clone(),
            current_action: step.action.clone(),
            recent_failures: step_cycles
                .iter()
                .rev()
                .take(ESCALATION_FAILURE_WINDOW)
                .map(|c| format!("{}: {}", c.action.describe(), c.result.message))
                .collect(),
            attempted_solutions: attempted,
        };
        let step_id = context.step_id.clone();
        task.log(
            Some(&step_id),
            format!("Stuck: {} ({})", pattern.kind, pattern.description),
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            outcome = state.monitor.seek_help(&context) => outcome,
        };

        match outcome {
            HelpOutcome::Advice(advice) => {
                task.log(
                    Some(&step_id),
                    format!(
                        "Advisor: {} Suggested: {}",
                        advice.diagnosis, advice.suggested_approach
                    ),
                );
                if advice.should_continue {
                    if let Some(alternative) = advice.alternative_action {
                        return Some(Some(alternative));
                    }
                }
            }
            HelpOutcome::BudgetExhausted => {
                task.log(Some(&step_id), "Cannot seek further help");
            }
            HelpOutcome::Unavailable(reason) => {
                task.log(Some(&step_id), format!("Escalation unavailable: {}", reason));
            }
        }
        Some(None)
    }

    /// Compensate completed steps, newest first. Failures are logged and
    /// do not stop the walk.
    async fn rollback(&self, task: &mut Task, state: &mut RunState) {
        for done in state.completed.iter().rev() {
            let Some(compensation) = self.registry.compensation(&done.action, &done.result) else {
                task.log(Some(&done.step_id), "No compensation available");
                continue;
            };

            let result = self.registry.execute(&compensation).await;
            state.rolled_back.push(done.step_id.clone());
            if result.success {
                task.log(
                    Some(&done.step_id),
                    format!("Rolled back with {}", compensation.describe()),
                );
                tracing::info!(task_id = %task.id, step_id = %done.step_id, "Rolled back");
            } else {
                task.log(
                    Some(&done.step_id),
                    format!("Rollback failed: {}", result.message),
                );
                tracing::error!(
                    task_id = %task.id,
                    step_id = %done.step_id,
                    "Rollback failed: {}",
                    result.message
                );
            }
        }
    }

    fn notify_start(&self, task: &Task, index: usize) {
        let step = &task.steps()[index];
        for observer in &self.observers {
            observer.on_step_start(&task.id, step);
        }
        self.notify_progress(task);
    }

    fn notify_transition(&self, task: &Task, index: usize, status: StepStatus) {
        let step = &task.steps()[index];
        for observer in &self.observers {
            observer.on_step_complete(&task.id, step, status);
        }
        self.notify_progress(task);
    }

    fn notify_progress(&self, task: &Task) {
        if self.observers.is_empty() {
            return;
        }
        let progress = task.progress();
        for observer in &self.observers {
            observer.on_progress(&task.id, &progress);
        }
    }
}

mod common;

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;

use common::{custom, fast_engine, step, task, RecordingHandler, ScriptedModel};
use task_pilot::actions::{workspace_registry, ActionKind, ActionRegistry, StepAction, StepResult};
use task_pilot::agent::{
    AdvisoryChannel, AdvisoryError, AdvisoryResponse, ApprovalHandler, ApprovalRequest,
    ApprovalResolution, CancelHandle, EngineBuilder, EngineConfig, EngineError,
    EscalationContext, ExecutionObserver, FallbackPlan, PlanRequest, Planner, RetryPolicy,
    StepStatus, StrategyMemory, StuckConfig, StuckKind, TaskOutcome, TaskProgress, TaskRecordStore,
    TaskStatus, TaskSummary, WorkspaceSummary,
};
use task_pilot::config::markers;

struct Rejecting(Mutex<Vec<ApprovalRequest>>);

#[async_trait]
impl ApprovalHandler for Rejecting {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalResolution {
        self.0.lock().unwrap().push(request.clone());
        ApprovalResolution::Rejected
    }
}

struct FixedAdvisor {
    alternative: Option<StepAction>,
    seen: Mutex<Vec<EscalationContext>>,
}

#[async_trait]
impl AdvisoryChannel for FixedAdvisor {
    async fn advise(&self, context: &EscalationContext) -> Result<AdvisoryResponse, AdvisoryError> {
        self.seen.lock().unwrap().push(context.clone());
        Ok(AdvisoryResponse {
            diagnosis: "search index is down".to_string(),
            suggested_approach: "look it up by hand".to_string(),
            alternative_strategies: Vec::new(),
            should_continue: true,
            alternative_action: self.alternative.clone(),
        })
    }
}

/// Cancels the run from inside its own action.
struct CancelOnExecute(CancelHandle);

#[async_trait]
impl task_pilot::actions::ActionHandler for CancelOnExecute {
    fn kind(&self) -> ActionKind {
        ActionKind::Custom
    }

    async fn execute(&self, _action: &StepAction) -> StepResult {
        self.0.cancel();
        StepResult::success("done, but stop after this")
    }
}

#[derive(Default)]
struct ProgressLog {
    progress: Mutex<Vec<TaskProgress>>,
    finished: Mutex<Vec<TaskSummary>>,
}

impl ExecutionObserver for ProgressLog {
    fn on_progress(&self, _task_id: &str, progress: &TaskProgress) {
        self.progress.lock().unwrap().push(*progress);
    }

    fn on_task_complete(&self, summary: &TaskSummary) {
        self.finished.lock().unwrap().push(summary.clone());
    }
}

#[tokio::test]
async fn test_missing_file_tries_fallback_then_backoff_then_skips() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new().with_plan(
        r#"{"steps": [{"title": "Read notes", "action": {"type": "read_resource", "params": {"path": "/totally/fake/missing.txt"}}}]}"#,
    ));
    let memory = Arc::new(StrategyMemory::new());

    let plan = Planner::new(model.clone(), memory.clone())
        .plan(&PlanRequest::new(
            "Read the notes",
            WorkspaceSummary::scan(dir.path()),
        ))
        .await;
    assert!(!plan.degraded);
    let planned = &plan.task.steps()[0];
    assert_eq!(planned.fallbacks.len(), 1);
    assert_eq!(planned.fallbacks[0].action, StepAction::search("missing.txt"));

    let engine = fast_engine(model.clone())
        .with_registry(Arc::new(workspace_registry(dir.path(), model.clone(), None)))
        .with_memory(memory.clone())
        .auto_approve()
        .build()
        .unwrap();
    let run = engine.run(plan.task).await.unwrap();

    assert_eq!(run.task.status, TaskStatus::Completed);
    let step = &run.task.steps()[0];
    assert_eq!(step.status, StepStatus::Skipped);
    assert_eq!(step.retry_count, 3);
    let kinds: Vec<_> = run.cycles.iter().map(|c| c.action.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ActionKind::ReadResource,
            ActionKind::Search,
            ActionKind::ReadResource
        ]
    );
    assert_eq!(run.summary.outcome, TaskOutcome::DegradedSuccess);
    assert_eq!(run.summary.escalations, 0);
    assert_eq!(
        run.summary.progress.to_string(),
        "0 completed, 1 skipped / 1 total"
    );

    let record = memory
        .lookup(&StepAction::read("/totally/fake/missing.txt"))
        .unwrap();
    assert_eq!((record.success_count, record.attempt_count), (0, 1));
}

#[tokio::test]
async fn test_retries_never_exceed_budget() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let handler = RecordingHandler::failing(ActionKind::Search, "index unavailable");
    let executed = handler.log();
    let mut registry = ActionRegistry::new();
    registry.replace(handler);

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .without_advisor()
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Find usages",
            dir.path(),
            vec![step("Search", StepAction::search("usages")).with_max_retries(3)],
        ))
        .await
        .unwrap();

    let step = &run.task.steps()[0];
    assert_eq!(step.status, StepStatus::Skipped);
    assert_eq!(step.retry_count, 3);
    assert_eq!(executed.lock().unwrap().len(), 3);
    assert_eq!(step.last_error.as_deref(), Some("index unavailable"));
}

#[tokio::test]
async fn test_zero_retry_budget_runs_once() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let handler = RecordingHandler::failing(ActionKind::Custom, "no luck");
    let executed = handler.log();
    let mut registry = ActionRegistry::new();
    registry.replace(handler);

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .without_advisor()
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Try once",
            dir.path(),
            vec![step("Try", custom("once")).with_max_retries(0)],
        ))
        .await
        .unwrap();

    let step = &run.task.steps()[0];
    assert_eq!(executed.lock().unwrap().len(), 1);
    assert_eq!(step.status, StepStatus::Skipped);
    assert_eq!(step.retry_count, 0);
    assert!(step.retry_count <= step.max_retries);
}

#[tokio::test]
async fn test_non_idempotent_action_is_not_repeated() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let handler = RecordingHandler::failing(ActionKind::Custom, "deploy failed").non_idempotent();
    let executed = handler.log();
    let mut registry = ActionRegistry::new();
    registry.replace(handler);

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .without_advisor()
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task("Deploy", dir.path(), vec![step("Deploy", custom("deploy"))]))
        .await
        .unwrap();

    assert_eq!(executed.lock().unwrap().len(), 1);
    assert_eq!(run.task.steps()[0].retry_count, 1);
    assert_eq!(run.task.steps()[0].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_non_idempotent_action_moves_to_fallback() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let handler = RecordingHandler::succeeding(ActionKind::Custom)
        .non_idempotent()
        .then(StepResult::failure("primary broke"));
    let executed = handler.log();
    let mut registry = ActionRegistry::new();
    registry.replace(handler);

    let planned = step("Notify", custom("primary"))
        .with_fallbacks(vec![FallbackPlan::new("primary broke", custom("backup"), 60)]);
    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task("Notify", dir.path(), vec![planned]))
        .await
        .unwrap();

    assert_eq!(
        *executed.lock().unwrap(),
        vec![custom("primary"), custom("backup")]
    );
    let step = &run.task.steps()[0];
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.action, custom("backup"));
    assert_eq!(step.planned_action, custom("primary"));
    assert_eq!(run.summary.outcome, TaskOutcome::FullySucceeded);
}

#[tokio::test]
async fn test_fatal_result_is_not_retried() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());

    let engine = fast_engine(model)
        .with_registry(Arc::new(ActionRegistry::new()))
        .without_advisor()
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Read",
            dir.path(),
            vec![step("Read", StepAction::read("notes.txt"))],
        ))
        .await
        .unwrap();

    assert_eq!(run.cycles.len(), 1);
    assert!(run.cycles[0].result.fatal);
    assert_eq!(run.task.steps()[0].retry_count, 1);
}

#[tokio::test]
async fn test_reflection_alternative_replaces_action() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("backup.txt"), "kept safe").unwrap();
    let model = Arc::new(ScriptedModel::new().with_reflection(
        r#"{"what_failed": ["primary.txt is gone"], "should_retry": true,
            "suggested_changes": ["read the backup copy"],
            "alternative_action": {"type": "read_resource", "params": {"path": "backup.txt"}}}"#,
    ));
    let memory = Arc::new(StrategyMemory::new());

    let engine = fast_engine(model.clone())
        .with_registry(Arc::new(workspace_registry(dir.path(), model.clone(), None)))
        .with_memory(memory.clone())
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Read the data",
            dir.path(),
            vec![step("Read data", StepAction::read("primary.txt"))],
        ))
        .await
        .unwrap();

    let actions: Vec<_> = run.cycles.iter().map(|c| c.action.clone()).collect();
    assert_eq!(
        actions,
        vec![StepAction::read("primary.txt"), StepAction::read("backup.txt")]
    );
    assert_eq!(run.task.steps()[0].status, StepStatus::Completed);
    assert!(!run.cycles[0].reflection.defaulted);

    // Memory credits the plan, not the substitute.
    let record = memory.lookup(&StepAction::read("primary.txt")).unwrap();
    assert_eq!(record.success_count, 1);
}

#[tokio::test]
async fn test_critical_failure_rolls_back_in_reverse() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("b.txt"), "original").unwrap();
    let model = Arc::new(ScriptedModel::new());

    let mut registry = workspace_registry(dir.path(), model.clone(), None);
    registry.replace(RecordingHandler::failing(ActionKind::Custom, "migration failed").non_idempotent());

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .without_advisor()
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Migrate",
            dir.path(),
            vec![
                step("Inspect", StepAction::read("b.txt")),
                step("Create a", StepAction::write("a.txt", "new a")),
                step("Change b", StepAction::write("b.txt", "changed")),
                step("Migrate", custom("migrate")).with_critical(true),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(run.task.status, TaskStatus::Failed);
    assert_eq!(run.summary.outcome, TaskOutcome::Failed);
    assert_eq!(run.summary.rolled_back_steps, vec!["step_3", "step_2"]);
    assert_eq!(run.task.steps()[3].status, StepStatus::Failed);
    assert!(!dir.path().join("a.txt").exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("b.txt")).unwrap(),
        "original"
    );
}

#[tokio::test]
async fn test_rejected_approval_cancels_task() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("doomed.txt"), "still here").unwrap();
    let model = Arc::new(ScriptedModel::new());
    let memory = Arc::new(StrategyMemory::new());
    let approver = Arc::new(Rejecting(Mutex::new(Vec::new())));

    let mut registry = workspace_registry(dir.path(), model.clone(), None);
    registry.replace(RecordingHandler::succeeding(ActionKind::Custom));

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .with_memory(memory.clone())
        .with_approval_handler(approver.clone())
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Clean up",
            dir.path(),
            vec![
                step("Prepare", custom("prepare")),
                step("Delete", StepAction::delete("doomed.txt")),
                step("Report", custom("report")),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(run.task.status, TaskStatus::Cancelled);
    assert_eq!(run.summary.outcome, TaskOutcome::Cancelled);
    let statuses: Vec<_> = run.task.steps().iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Completed, StepStatus::Pending, StepStatus::Pending]
    );
    assert!(dir.path().join("doomed.txt").exists());

    let requests = approver.0.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].step_id, "step_2");
    assert_eq!(requests[0].files_affected, vec!["doomed.txt"]);
    assert!(requests[0].reversible);
    assert_eq!(run.approvals[0].resolution, ApprovalResolution::Rejected);

    // Cancelled runs teach nothing.
    assert!(memory.is_empty());
}

#[tokio::test]
async fn test_approved_delete_runs() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("old.log"), "noise").unwrap();
    let model = Arc::new(ScriptedModel::new());

    let engine = fast_engine(model.clone())
        .with_registry(Arc::new(workspace_registry(dir.path(), model, None)))
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Remove the log",
            dir.path(),
            vec![step("Delete", StepAction::delete("old.log"))],
        ))
        .await
        .unwrap();

    assert_eq!(run.task.status, TaskStatus::Completed);
    assert_eq!(run.approvals.len(), 1);
    assert_eq!(run.approvals[0].resolution, ApprovalResolution::Approved);
    assert!(!dir.path().join("old.log").exists());
}

#[tokio::test]
async fn test_repeated_error_escalates_and_advisor_action_completes_step() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let advisor = Arc::new(FixedAdvisor {
        alternative: Some(custom("manual lookup")),
        seen: Mutex::new(Vec::new()),
    });

    let mut registry = ActionRegistry::new();
    registry.replace(RecordingHandler::failing(ActionKind::Search, "index unavailable"));
    registry.replace(RecordingHandler::succeeding(ActionKind::Custom));

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .with_advisor(advisor.clone())
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Find usages",
            dir.path(),
            vec![step("Search", StepAction::search("usages"))],
        ))
        .await
        .unwrap();

    let step = &run.task.steps()[0];
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.retry_count, 3);
    assert_eq!(run.summary.escalations, 1);
    assert_eq!(run.cycles.len(), 4);
    assert!(run.cycles.last().unwrap().escalated);

    let seen = advisor.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].pattern.kind, StuckKind::RepeatedError);
    assert_eq!(seen[0].attempted_solutions.len(), 1);
    assert_eq!(seen[0].recent_failures.len(), 3);
}

#[tokio::test]
async fn test_model_advisor_can_stop_the_step() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new().with_advisory(
        r#"{"diagnosis": "service is down", "suggested_approach": "skip it", "should_continue": false}"#,
    ));

    let mut registry = ActionRegistry::new();
    registry.replace(RecordingHandler::failing(ActionKind::Search, "index unavailable"));

    let engine = fast_engine(model.clone())
        .with_registry(Arc::new(registry))
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Find usages",
            dir.path(),
            vec![step("Search", StepAction::search("usages"))],
        ))
        .await
        .unwrap();

    assert_eq!(run.task.steps()[0].status, StepStatus::Skipped);
    assert_eq!(run.summary.escalations, 1);
    assert_eq!(model.calls(markers::ADVISORY), 1);
}

#[tokio::test]
async fn test_escalation_budget_is_enforced() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let advisor = Arc::new(FixedAdvisor {
        alternative: None,
        seen: Mutex::new(Vec::new()),
    });

    let mut registry = ActionRegistry::new();
    registry.replace(RecordingHandler::failing(ActionKind::Search, "index unavailable"));

    let config = EngineConfig::default()
        .with_retry_policy(RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
        ))
        .with_stuck_config(StuckConfig::default().with_max_escalations(1));
    let engine = EngineBuilder::new()
        .with_model(model)
        .with_registry(Arc::new(registry))
        .with_advisor(advisor.clone())
        .with_config(config)
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Find usages",
            dir.path(),
            vec![
                step("First search", StepAction::search("usages")),
                step("Second search", StepAction::search("callers")),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(run.summary.escalations, 1);
    assert_eq!(advisor.seen.lock().unwrap().len(), 1);
    assert!(run
        .task
        .execution_log()
        .iter()
        .any(|e| e.event == "Cannot seek further help"));
}

#[tokio::test]
async fn test_cancel_after_action_leaves_rest_pending() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let memory = Arc::new(StrategyMemory::new());
    let cancel = CancelHandle::new();

    let mut registry = ActionRegistry::new();
    registry.replace(CancelOnExecute(cancel.clone()));

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .with_memory(memory.clone())
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run_with_cancel(
            task(
                "Two things",
                dir.path(),
                vec![step("First", custom("first")), step("Second", custom("second"))],
            ),
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(run.task.status, TaskStatus::Cancelled);
    assert_eq!(run.task.steps()[0].status, StepStatus::Completed);
    assert_eq!(run.task.steps()[1].status, StepStatus::Pending);
    assert!(memory.is_empty());
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut registry = ActionRegistry::new();
    registry.replace(RecordingHandler::failing(ActionKind::Search, "index unavailable"));

    let engine = EngineBuilder::new()
        .with_model(model)
        .with_registry(Arc::new(registry))
        .with_retry_policy(RetryPolicy::new(
            Duration::from_secs(30),
            Duration::from_secs(30),
        ))
        .auto_approve()
        .build()
        .unwrap();

    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let run = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run_with_cancel(
            task(
                "Find usages",
                dir.path(),
                vec![step("Search", StepAction::search("usages"))],
            ),
            cancel,
        ),
    )
    .await
    .expect("cancel should end the backoff")
    .unwrap();

    assert_eq!(run.task.status, TaskStatus::Cancelled);
    let step = &run.task.steps()[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.last_error.as_deref(), Some("Cancelled"));
}

#[tokio::test]
async fn test_concurrent_runs_share_memory() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let memory = Arc::new(StrategyMemory::new());
    let mut registry = ActionRegistry::new();
    registry.replace(RecordingHandler::succeeding(ActionKind::Custom));

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .with_memory(memory.clone())
        .auto_approve()
        .build()
        .unwrap();

    let (first, second) = tokio::join!(
        engine.run(task("One", dir.path(), vec![step("Ping", custom("ping"))])),
        engine.run(task("Two", dir.path(), vec![step("Ping", custom("pong"))]))
    );
    assert_eq!(first.unwrap().task.status, TaskStatus::Completed);
    assert_eq!(second.unwrap().task.status, TaskStatus::Completed);

    // Same shape, one pattern.
    let record = memory.lookup(&custom("anything")).unwrap();
    assert_eq!((record.success_count, record.attempt_count), (2, 2));
}

#[tokio::test]
async fn test_record_store_and_observer() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let observer = Arc::new(ProgressLog::default());
    let store = TaskRecordStore::new(dir.path().join("tasks"));
    let mut registry = ActionRegistry::new();
    registry.replace(RecordingHandler::succeeding(ActionKind::Custom));

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .with_observer(observer.clone())
        .with_record_store(store.clone())
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task(
            "Two pings",
            dir.path(),
            vec![step("Ping", custom("a")), step("Ping again", custom("b"))],
        ))
        .await
        .unwrap();

    let record = store.load(&run.task.id).unwrap();
    assert_eq!(record.cycles.len(), 2);
    assert_eq!(record.cycles_for("step_2").count(), 1);
    assert_eq!(
        record.summary.unwrap().outcome,
        TaskOutcome::FullySucceeded
    );

    let progress = observer.progress.lock().unwrap();
    assert_eq!(progress.last().unwrap().completed_count, 2);
    assert_eq!(observer.finished.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_finished_task_cannot_run_again() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut registry = ActionRegistry::new();
    registry.replace(RecordingHandler::succeeding(ActionKind::Custom));

    let engine = fast_engine(model)
        .with_registry(Arc::new(registry))
        .auto_approve()
        .build()
        .unwrap();
    let run = engine
        .run(task("Once", dir.path(), vec![step("Ping", custom("a"))]))
        .await
        .unwrap();

    let again = engine.run(run.task).await;
    assert!(matches!(
        again,
        Err(EngineError::InvalidTaskState {
            status: TaskStatus::Completed,
            ..
        })
    ));
}

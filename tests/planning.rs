mod common;

use std::fs;
use std::sync::Arc;

use tempfile::tempdir;

use common::ScriptedModel;
use task_pilot::actions::{ActionKind, StepAction};
use task_pilot::agent::{
    PlanRequest, Planner, RiskLevel, StrategyMemory, WorkspaceSummary, MANUAL_TASK_TITLE,
};

const TWO_STEP_PLAN: &str = r#"Here is the plan:
```json
{"steps": [
  {"title": "Read manifest", "description": "Find the version", "action": {"type": "read_resource", "params": {"path": "Cargo.toml"}}},
  {"title": "Write notes", "action": "generate_content", "params": {"prompt": "release notes"}, "critical": true},
  {"title": "Teleport", "action": {"type": "teleport", "params": {}}}
]}
```"#;

#[tokio::test]
async fn test_plan_scores_steps_and_drops_unknown_kinds() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
    let model = Arc::new(ScriptedModel::new().with_plan(TWO_STEP_PLAN));
    let planner = Planner::new(model, Arc::new(StrategyMemory::new()));

    let plan = planner
        .plan(&PlanRequest::new(
            "Draft release notes",
            WorkspaceSummary::scan(dir.path()),
        ))
        .await;

    assert!(!plan.degraded);
    let steps = plan.task.steps();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].id, "step_1");
    assert_eq!(steps[1].id, "step_2");

    // 50 baseline + 20 well-known file
    assert_eq!(steps[0].confidence.score, 70);
    assert_eq!(steps[0].risk_level(), RiskLevel::Low);
    assert!(steps[0].fallbacks.is_empty());

    // 50 baseline - 15 generative
    assert_eq!(steps[1].action.kind, ActionKind::GenerateContent);
    assert_eq!(steps[1].confidence.score, 35);
    assert_eq!(steps[1].risk_level(), RiskLevel::High);
    assert!(steps[1].critical);
    assert_eq!(
        steps[1].fallbacks.last().unwrap().action.kind,
        ActionKind::RequestUserInput
    );

    assert_eq!(plan.insights.high_risk_steps, 1);
    assert_eq!(plan.insights.fallback_count, 1);
    assert!((plan.insights.overall_confidence - 52.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_unusable_plan_degrades_to_manual_step() {
    let dir = tempdir().unwrap();
    for reply in [None, Some("no idea"), Some(r#"{"steps": [{"action": {"type": "fly"}}]}"#)] {
        let model = match reply {
            Some(text) => ScriptedModel::new().with_plan(text),
            None => ScriptedModel::new(),
        };
        let planner = Planner::new(Arc::new(model), Arc::new(StrategyMemory::new()));
        let plan = planner
            .plan(&PlanRequest::new(
                "Tidy the docs",
                WorkspaceSummary::empty(dir.path()),
            ))
            .await;

        assert!(plan.degraded);
        let steps = plan.task.steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].title, MANUAL_TASK_TITLE);
        assert_eq!(steps[0].action, StepAction::ask_user("Tidy the docs"));
    }
}

#[tokio::test]
async fn test_replanning_is_deterministic() {
    let dir = tempdir().unwrap();
    let model = Arc::new(ScriptedModel::new().with_plan(TWO_STEP_PLAN));
    let planner = Planner::new(model, Arc::new(StrategyMemory::new()));
    let request = PlanRequest::new("Draft release notes", WorkspaceSummary::scan(dir.path()));

    let first = planner.plan(&request).await;
    let second = planner.plan(&request).await;

    assert_ne!(first.task.id, second.task.id);
    assert_eq!(first.insights, second.insights);
    for (a, b) in first.task.steps().iter().zip(second.task.steps()) {
        assert_eq!(a.action, b.action);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.fallbacks, b.fallbacks);
    }
}

#[tokio::test]
async fn test_memory_raises_confidence() {
    let dir = tempdir().unwrap();
    let memory = Arc::new(StrategyMemory::new());
    let known = StepAction::read("src/main.rs");
    for i in 0..10 {
        memory.record(&known, i != 0);
    }

    let model = Arc::new(ScriptedModel::new().with_plan(
        r#"[{"title": "Read entry point", "type": "read_resource", "params": {"path": "src/lib.rs"}}]"#,
    ));
    let plan = Planner::new(model, memory)
        .plan(&PlanRequest::new(
            "Explain the entry point",
            WorkspaceSummary::empty(dir.path()),
        ))
        .await;

    let step = &plan.task.steps()[0];
    // 50 baseline + round(40 * 0.9)
    assert_eq!(step.confidence.score, 86);
    assert!(step.confidence.memory_backed);
    assert_eq!(plan.insights.memory_backed_steps, 1);
}

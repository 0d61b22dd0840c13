//! Shared fixtures for the engine scenarios.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use task_pilot::actions::{ActionHandler, ActionKind, StepAction, StepResult};
use task_pilot::agent::{ConfidenceScorer, EngineBuilder, RetryPolicy, Step, StrategyMemory, Task};
use task_pilot::config::markers;
use task_pilot::model::{LanguageModel, ModelError};

/// Language model that answers by phase marker.
///
/// Planning and advisory replies are scripted; every reasoning phase gets
/// prose, so the executor falls back to its phase defaults.
#[derive(Default)]
pub struct ScriptedModel {
    plan: Option<String>,
    advisory: Option<String>,
    reflections: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_advisory(mut self, advisory: impl Into<String>) -> Self {
        self.advisory = Some(advisory.into());
        self
    }

    /// Queue a reflection reply. Once the queue is empty reflections get prose.
    pub fn with_reflection(self, reflection: impl Into<String>) -> Self {
        self.reflections
            .lock()
            .unwrap()
            .push_back(reflection.into());
        self
    }

    /// Number of prompts sent for a phase.
    pub fn calls(&self, marker: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(marker))
            .count()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());

        if prompt.contains(markers::PLAN) {
            return self
                .plan
                .clone()
                .ok_or_else(|| ModelError::Unavailable("no plan scripted".to_string()));
        }
        if prompt.contains(markers::ADVISORY) {
            return self
                .advisory
                .clone()
                .ok_or_else(|| ModelError::Unavailable("no advisor scripted".to_string()));
        }
        if prompt.contains(markers::REFLECTION) {
            if let Some(reply) = self.reflections.lock().unwrap().pop_front() {
                return Ok(reply);
            }
        }
        Ok("I would rather not commit to a format here.".to_string())
    }
}

/// Handler that replays scripted results and records what it ran.
pub struct RecordingHandler {
    kind: ActionKind,
    results: Mutex<VecDeque<StepResult>>,
    otherwise: StepResult,
    idempotent: bool,
    destructive: bool,
    executed: Arc<Mutex<Vec<StepAction>>>,
}

impl RecordingHandler {
    pub fn new(kind: ActionKind, otherwise: StepResult) -> Self {
        Self {
            kind,
            results: Mutex::new(VecDeque::new()),
            otherwise,
            idempotent: true,
            destructive: false,
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding(kind: ActionKind) -> Self {
        Self::new(kind, StepResult::success(format!("{} done", kind)))
    }

    pub fn failing(kind: ActionKind, message: &str) -> Self {
        Self::new(kind, StepResult::failure(message))
    }

    pub fn then(self, result: StepResult) -> Self {
        self.results.lock().unwrap().push_back(result);
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    /// Shared log of executed actions.
    pub fn log(&self) -> Arc<Mutex<Vec<StepAction>>> {
        self.executed.clone()
    }
}

#[async_trait]
impl ActionHandler for RecordingHandler {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    async fn execute(&self, action: &StepAction) -> StepResult {
        self.executed.lock().unwrap().push(action.clone());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone())
    }

    fn is_idempotent(&self, _action: &StepAction) -> bool {
        self.idempotent
    }

    fn is_destructive(&self, action: &StepAction, workspace_root: &Path) -> bool {
        self.destructive || action.is_destructive_by_default(workspace_root)
    }
}

/// Builder with millisecond backoff.
pub fn fast_engine(model: Arc<dyn LanguageModel>) -> EngineBuilder {
    EngineBuilder::new()
        .with_model(model)
        .with_retry_policy(RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
        ))
}

/// A step scored against an empty memory.
pub fn step(title: &str, action: StepAction) -> Step {
    let confidence = ConfidenceScorer::score(&action, &StrategyMemory::new());
    Step::new(0, title, "", action, confidence)
}

pub fn task(request: &str, root: &Path, steps: Vec<Step>) -> Task {
    Task::new(request, root).with_steps(steps)
}

pub fn custom(note: &str) -> StepAction {
    StepAction::new(ActionKind::Custom).with_param("note", note)
}

//! Reasoning cycle: Thought → Action → Observation → Reflection.
//!
//! One [`ReasoningExecutor::run`] call is one attempt at one step. The
//! executor never touches task or step state; it returns the immutable
//! cycle record and the handler's result for the engine to act on.
//!
//! Every model phase tolerates failure. A timeout, an error or an
//! unparseable reply substitutes a default:
//!
//! | Phase | Default |
//! |---|---|
//! | Thought | "execute as planned", expected outcome = action succeeds |
//! | Observation | "outcome matches" / "outcome diverges" from the handler result |
//! | Reflection | on failure retry with the next planned fallback; on success no retry |

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::engine::CancelHandle;
use super::task::Step;
use crate::actions::{ActionKind, ActionRegistry, StepAction, StepResult};
use crate::config::{observation_prompt, reflection_prompt, thought_prompt};
use crate::model::{extract_json, LanguageModel};

/// Suggested change used when reflection has nothing better.
pub const DEFAULT_SUGGESTED_CHANGE: &str = "Switch to the next planned fallback";

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ReasoningConfig {
    /// Budget for each model phase.
    pub phase_timeout: Duration,
    /// Characters of handler data shown to the observation phase.
    pub max_observed_data: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            phase_timeout: Duration::from_secs(60),
            max_observed_data: 2_000,
        }
    }
}

impl ReasoningConfig {
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    pub reasoning: String,
    pub chosen_approach: String,
    pub alternatives: Vec<String>,
    pub risk_notes: Vec<String>,
    pub expected_outcome: String,
    /// Substituted because the model gave nothing usable.
    #[serde(default)]
    pub defaulted: bool,
}

impl Thought {
    fn default_for(action: &StepAction) -> Self {
        Self {
            reasoning: "No reasoning available; executing the step as planned.".to_string(),
            chosen_approach: "execute as planned".to_string(),
            alternatives: Vec::new(),
            risk_notes: Vec::new(),
            expected_outcome: format!("{} succeeds", action.describe()),
            defaulted: true,
        }
    }

    fn parse(obj: &Map<String, Value>, action: &StepAction) -> Self {
        let fallback = Self::default_for(action);
        Self {
            reasoning: text_field(obj, "reasoning").unwrap_or(fallback.reasoning),
            chosen_approach: text_field(obj, "chosen_approach").unwrap_or(fallback.chosen_approach),
            alternatives: list_field(obj, "alternatives"),
            risk_notes: list_field(obj, "risk_notes"),
            expected_outcome: text_field(obj, "expected_outcome")
                .unwrap_or(fallback.expected_outcome),
            defaulted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub actual_outcome: String,
    /// Always the handler's verdict, never the model's.
    pub success: bool,
    pub differences: Vec<String>,
    pub unexpected_events: Vec<String>,
    #[serde(default)]
    pub defaulted: bool,
}

impl Observation {
    fn default_for(expected: &str, result: &StepResult) -> Self {
        let (actual_outcome, differences) = if result.success {
            (format!("outcome matches: {}", result.message), Vec::new())
        } else {
            (
                format!("outcome diverges: {}", result.message),
                vec![format!("expected '{}', got '{}'", expected, result.message)],
            )
        };
        Self {
            actual_outcome,
            success: result.success,
            differences,
            unexpected_events: Vec::new(),
            defaulted: true,
        }
    }

    fn parse(obj: &Map<String, Value>, expected: &str, result: &StepResult) -> Self {
        let fallback = Self::default_for(expected, result);
        Self {
            actual_outcome: text_field(obj, "actual_outcome").unwrap_or(fallback.actual_outcome),
            success: result.success,
            differences: list_field(obj, "differences"),
            unexpected_events: list_field(obj, "unexpected_events"),
            defaulted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub what_worked: Vec<String>,
    pub what_failed: Vec<String>,
    pub root_cause: Option<String>,
    pub should_retry: bool,
    pub suggested_changes: Vec<String>,
    pub knowledge_gained: Vec<String>,
    /// Structured replacement action; the only way a reflection can change
    /// what runs next.
    #[serde(default)]
    pub alternative_action: Option<StepAction>,
    #[serde(default)]
    pub defaulted: bool,
}

impl Reflection {
    fn default_for(result: &StepResult) -> Self {
        if result.success {
            Self {
                what_worked: vec![result.message.clone()],
                what_failed: Vec::new(),
                root_cause: None,
                should_retry: false,
                suggested_changes: Vec::new(),
                knowledge_gained: Vec::new(),
                alternative_action: None,
                defaulted: true,
            }
        } else {
            Self {
                what_worked: Vec::new(),
                what_failed: vec![result.message.clone()],
                root_cause: Some(result.message.clone()),
                should_retry: true,
                suggested_changes: vec![DEFAULT_SUGGESTED_CHANGE.to_string()],
                knowledge_gained: Vec::new(),
                alternative_action: None,
                defaulted: true,
            }
        }
    }

    fn parse(obj: &Map<String, Value>, result: &StepResult, current: &StepAction) -> Self {
        let fallback = Self::default_for(result);
        let alternative_action = obj
            .get("alternative_action")
            .and_then(parse_action)
            .filter(|alt| alt != current);

        Self {
            what_worked: list_field(obj, "what_worked"),
            what_failed: list_field(obj, "what_failed"),
            root_cause: text_field(obj, "root_cause")
                .filter(|c| !c.eq_ignore_ascii_case("null"))
                .or(fallback.root_cause),
            should_retry: obj
                .get("should_retry")
                .and_then(Value::as_bool)
                .unwrap_or(fallback.should_retry),
            suggested_changes: list_field(obj, "suggested_changes"),
            knowledge_gained: list_field(obj, "knowledge_gained"),
            alternative_action,
            defaulted: false,
        }
    }
}

/// Parse `{"type": ..., "params": {...}}` leniently.
pub fn parse_action(value: &Value) -> Option<StepAction> {
    let obj = value.as_object()?;
    let kind = ActionKind::parse(obj.get("type").and_then(Value::as_str)?)?;
    let params = obj
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Some(StepAction { kind, params })
}

fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn list_field(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    match obj.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// One attempt at one step. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningCycle {
    pub step_id: String,
    /// 1 for the first attempt, 2 for the first retry, ...
    pub cycle_number: u32,
    pub action: StepAction,
    pub thought: Thought,
    pub result: StepResult,
    pub observation: Observation,
    pub reflection: Reflection,
    pub action_duration_ms: u64,
    pub duration_ms: u64,
    /// Run as an extra attempt granted by an escalation.
    #[serde(default)]
    pub escalated: bool,
}

/// What the engine gets back from a cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub cycle: ReasoningCycle,
    /// Cancellation was observed. If it happened before the action, the
    /// action did not run.
    pub cancelled: bool,
    /// Whether the handler was invoked.
    pub action_executed: bool,
}

impl CycleOutcome {
    pub fn result(&self) -> &StepResult {
        &self.cycle.result
    }
}

/// Inputs for one cycle.
pub struct CycleContext<'a> {
    pub goal: &'a str,
    pub step: &'a Step,
    pub cycle_number: u32,
    /// Earlier cycles of the same step.
    pub previous: &'a [ReasoningCycle],
    pub cancel: &'a CancelHandle,
    pub escalated: bool,
}

enum PhaseReply {
    Text(String),
    Unavailable,
    Cancelled,
}

/// Runs reasoning cycles against a model and an action registry.
pub struct ReasoningExecutor {
    model: Arc<dyn LanguageModel>,
    registry: Arc<ActionRegistry>,
    config: ReasoningConfig,
}

impl ReasoningExecutor {
    pub fn new(model: Arc<dyn LanguageModel>, registry: Arc<ActionRegistry>) -> Self {
        Self::with_config(model, registry, ReasoningConfig::default())
    }

    pub fn with_config(
        model: Arc<dyn LanguageModel>,
        registry: Arc<ActionRegistry>,
        config: ReasoningConfig,
    ) -> Self {
        Self {
            model,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Run the four phases for the step's current action.
    pub async fn run(&self, ctx: CycleContext<'_>) -> CycleOutcome {
        let started = Instant::now();
        let step = ctx.step;
        let action = step.action.clone();

        tracing::debug!(
            step_id = %step.id,
            cycle = ctx.cycle_number,
            kind = %action.kind,
            "Reasoning cycle started"
        );

        // Thought
        let prompt = thought_prompt(
            ctx.goal,
            &format!("{}: {}", step.title, step.description),
            &action.describe(),
            &format!("{} ({:?} risk)", step.confidence.score, step.confidence.risk_level),
            &describe_previous(ctx.previous),
        );
        let thought = match self.ask(&prompt, ctx.cancel).await {
            PhaseReply::Text(text) => match extract_json(&text) {
                Some(Value::Object(obj)) => Thought::parse(&obj, &action),
                _ => Thought::default_for(&action),
            },
            PhaseReply::Unavailable => Thought::default_for(&action),
            PhaseReply::Cancelled => {
                let thought = Thought::default_for(&action);
                return self.cancelled_before_action(&ctx, action, thought, started);
            }
        };

        if ctx.cancel.is_cancelled() {
            return self.cancelled_before_action(&ctx, action, thought, started);
        }

        // Action
        let action_started = Instant::now();
        let result = self.registry.execute(&action).await;
        let action_duration_ms = action_started.elapsed().as_millis() as u64;
        tracing::debug!(
            step_id = %step.id,
            cycle = ctx.cycle_number,
            success = result.success,
            "Action finished: {}",
            result.message
        );

        // Observation
        let prompt = observation_prompt(
            &thought.expected_outcome,
            &action.describe(),
            result.success,
            &self.describe_result(&result),
        );
        let mut cancelled = false;
        let observation = match self.ask(&prompt, ctx.cancel).await {
            PhaseReply::Text(text) => match extract_json(&text) {
                Some(Value::Object(obj)) => {
                    Observation::parse(&obj, &thought.expected_outcome, &result)
                }
                _ => Observation::default_for(&thought.expected_outcome, &result),
            },
            PhaseReply::Unavailable => Observation::default_for(&thought.expected_outcome, &result),
            PhaseReply::Cancelled => {
                cancelled = true;
                Observation::default_for(&thought.expected_outcome, &result)
            }
        };

        // Reflection
        let reflection = if cancelled {
            Reflection::default_for(&result)
        } else {
            let attempts_left = step.max_retries.saturating_sub(ctx.cycle_number);
            let prompt = reflection_prompt(
                &serde_json::to_string(&thought).unwrap_or_default(),
                &serde_json::to_string(&observation).unwrap_or_default(),
                attempts_left,
            );
            match self.ask(&prompt, ctx.cancel).await {
                PhaseReply::Text(text) => match extract_json(&text) {
                    Some(Value::Object(obj)) => Reflection::parse(&obj, &result, &action),
                    _ => Reflection::default_for(&result),
                },
                PhaseReply::Unavailable => Reflection::default_for(&result),
                PhaseReply::Cancelled => {
                    cancelled = true;
                    Reflection::default_for(&result)
                }
            }
        };

        let cycle = ReasoningCycle {
            step_id: step.id.clone(),
            cycle_number: ctx.cycle_number,
            action,
            thought,
            result,
            observation,
            reflection,
            action_duration_ms,
            duration_ms: started.elapsed().as_millis() as u64,
            escalated: ctx.escalated,
        };

        CycleOutcome {
            cycle,
            cancelled,
            action_executed: true,
        }
    }

    fn cancelled_before_action(
        &self,
        ctx: &CycleContext<'_>,
        action: StepAction,
        thought: Thought,
        started: Instant,
    ) -> CycleOutcome {
        let result = StepResult::failure("Cancelled before execution");
        let observation = Observation::default_for(&thought.expected_outcome, &result);
        let mut reflection = Reflection::default_for(&result);
        reflection.should_retry = false;
        reflection.suggested_changes.clear();

        CycleOutcome {
            cycle: ReasoningCycle {
                step_id: ctx.step.id.clone(),
                cycle_number: ctx.cycle_number,
                action,
                thought,
                result,
                observation,
                reflection,
                action_duration_ms: 0,
                duration_ms: started.elapsed().as_millis() as u64,
                escalated: ctx.escalated,
            },
            cancelled: true,
            action_executed: false,
        }
    }

    async fn ask(&self, prompt: &str, cancel: &CancelHandle) -> PhaseReply {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => PhaseReply::Cancelled,
            reply = tokio::time::timeout(self.config.phase_timeout, self.model.complete(prompt)) => {
                match reply {
                    Ok(Ok(text)) => PhaseReply::Text(text),
                    Ok(Err(e)) => {
                        tracing::warn!("Reasoning phase model call failed: {}", e);
                        PhaseReply::Unavailable
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Reasoning phase timed out after {:?}",
                            self.config.phase_timeout
                        );
                        PhaseReply::Unavailable
                    }
                }
            }
        }
    }

    fn describe_result(&self, result: &StepResult) -> String {
        if result.data.is_null() {
            return result.message.clone();
        }
        let mut data = result.data.to_string();
        if data.len() > self.config.max_observed_data {
            let mut cut = self.config.max_observed_data;
            while !data.is_char_boundary(cut) {
                cut -= 1;
            }
            data.truncate(cut);
            data.push_str("...");
        }
        format!("{}\nData: {}", result.message, data)
    }
}

fn describe_previous(previous: &[ReasoningCycle]) -> String {
    if previous.is_empty() {
        return "none".to_string();
    }
    previous
        .iter()
        .map(|cycle| {
            let mut line = format!(
                "Cycle {}: {} -> {}",
                cycle.cycle_number,
                cycle.action.describe(),
                cycle.result.message
            );
            if let Some(cause) = &cycle.reflection.root_cause {
                line.push_str(&format!(" (root cause: {})", cause));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

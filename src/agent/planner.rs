//! Planner: turns a user request into an ordered, scored plan.
//!
//! Plan synthesis is delegated to the language model with a JSON contract
//! (see [`crate::config::planning_prompt`]). Anything the model gets wrong
//! degrades to a single "Manual Task" step; planning never fails.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::confidence::{is_well_known_file, ConfidenceScorer, RiskLevel};
use super::strategy_memory::StrategyMemory;
use super::task::{FallbackPlan, Step, Task};
use crate::actions::workspace::walk_files;
use crate::actions::{ActionKind, StepAction};
use crate::config::planning_prompt;
use crate::model::{extract_json, LanguageModel};

/// Title of the degraded single-step plan.
pub const MANUAL_TASK_TITLE: &str = "Manual Task";

pub const SEARCH_FALLBACK_CONFIDENCE: u8 = 60;
pub const CREATE_DEFAULT_FALLBACK_CONFIDENCE: u8 = 70;
pub const USER_INPUT_FALLBACK_CONFIDENCE: u8 = 90;
pub const MAX_FALLBACKS: usize = 3;

/// Configuration for the planner.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Retry budget given to every planned step.
    pub default_max_retries: u32,
    /// Time allowed for the planning model call.
    pub model_timeout: Duration,
    /// Upper bound on steps accepted from the model.
    pub max_steps: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            model_timeout: Duration::from_secs(60),
            max_steps: 50,
        }
    }
}

impl PlannerConfig {
    /// Set the per-step retry budget.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Set the planning call timeout.
    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }
}

/// Snapshot of the workspace handed to the planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSummary {
    pub root: PathBuf,
    /// Relative paths, sorted.
    pub files: Vec<String>,
    /// File extension → count.
    pub language_stats: BTreeMap<String, usize>,
}

impl WorkspaceSummary {
    /// Summary with no files.
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Bounded scan of `root`.
    pub fn scan(root: impl AsRef<Path>) -> Self {
        Self::scan_with_limits(root, 8, 2_000)
    }

    pub fn scan_with_limits(root: impl AsRef<Path>, max_depth: usize, max_files: usize) -> Self {
        let root = root.as_ref();
        let mut files: Vec<String> = walk_files(root, max_depth, max_files)
            .into_iter()
            .map(|path| {
                path.strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        files.sort();

        let mut language_stats = BTreeMap::new();
        for file in &files {
            let ext = Path::new(file)
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "(none)".to_string());
            *language_stats.entry(ext).or_insert(0) += 1;
        }

        Self {
            root: root.to_path_buf(),
            files,
            language_stats,
        }
    }

    /// Text block for prompts.
    pub fn describe(&self, max_files: usize) -> String {
        let mut out = format!("Root: {}\nFiles: {}\n", self.root.display(), self.files.len());
        if !self.language_stats.is_empty() {
            let stats: Vec<_> = self
                .language_stats
                .iter()
                .map(|(ext, count)| format!("{}={}", ext, count))
                .collect();
            out.push_str(&format!("Extensions: {}\n", stats.join(", ")));
        }
        for file in self.files.iter().take(max_files) {
            out.push_str("- ");
            out.push_str(file);
            out.push('\n');
        }
        if self.files.len() > max_files {
            out.push_str(&format!("... and {} more\n", self.files.len() - max_files));
        }
        out
    }
}

/// Planner input.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub user_request: String,
    pub workspace: WorkspaceSummary,
    /// Short descriptions of prior similar tasks.
    pub history: Vec<String>,
}

impl PlanRequest {
    pub fn new(user_request: impl Into<String>, workspace: WorkspaceSummary) -> Self {
        Self {
            user_request: user_request.into(),
            workspace,
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<String>) -> Self {
        self.history = history;
        self
    }
}

/// Summary shown to the caller before execution starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningInsights {
    /// Mean step score.
    pub overall_confidence: f64,
    /// Percentage, counting fallbacks as independent second chances.
    pub predicted_success_rate: f64,
    pub memory_backed_steps: usize,
    pub fallback_count: usize,
    pub high_risk_steps: usize,
}

impl PlanningInsights {
    pub fn from_steps(steps: &[Step]) -> Self {
        if steps.is_empty() {
            return Self {
                overall_confidence: 0.0,
                predicted_success_rate: 0.0,
                memory_backed_steps: 0,
                fallback_count: 0,
                high_risk_steps: 0,
            };
        }

        let total: f64 = steps.iter().map(|s| s.confidence.score as f64).sum();
        let predicted = steps.iter().fold(1.0, |acc, step| {
            let primary_miss = 1.0 - step.confidence.score as f64 / 100.0;
            let all_miss = step
                .fallbacks
                .iter()
                .fold(primary_miss, |miss, f| miss * (1.0 - f.confidence as f64 / 100.0));
            acc * (1.0 - all_miss)
        });

        Self {
            overall_confidence: total / steps.len() as f64,
            predicted_success_rate: predicted * 100.0,
            memory_backed_steps: steps.iter().filter(|s| s.confidence.memory_backed).count(),
            fallback_count: steps.iter().map(|s| s.fallbacks.len()).sum(),
            high_risk_steps: steps
                .iter()
                .filter(|s| s.risk_level() == RiskLevel::High)
                .count(),
        }
    }
}

impl fmt::Display for PlanningInsights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "confidence {:.0}%, predicted success {:.0}%, {} memory-backed, {} fallbacks, {} high-risk",
            self.overall_confidence,
            self.predicted_success_rate,
            self.memory_backed_steps,
            self.fallback_count,
            self.high_risk_steps
        )
    }
}

/// A planned task plus its insights.
#[derive(Debug, Clone)]
pub struct Plan {
    pub task: Task,
    pub insights: PlanningInsights,
    /// Whether the model output was unusable and the manual step was used.
    pub degraded: bool,
}

/// Step as produced by the model, before scoring.
#[derive(Debug, Clone, PartialEq)]
struct DraftStep {
    title: String,
    description: String,
    action: StepAction,
    critical: bool,
}

/// Plans tasks with a language model and the strategy memory.
pub struct Planner {
    model: Arc<dyn LanguageModel>,
    memory: Arc<StrategyMemory>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(model: Arc<dyn LanguageModel>, memory: Arc<StrategyMemory>) -> Self {
        Self::with_config(model, memory, PlannerConfig::default())
    }

    pub fn with_config(
        model: Arc<dyn LanguageModel>,
        memory: Arc<StrategyMemory>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            model,
            memory,
            config,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Produce a plan. Never fails: unusable model output yields the
    /// manual step.
    pub async fn plan(&self, request: &PlanRequest) -> Plan {
        let history = if request.history.is_empty() {
            "none".to_string()
        } else {
            request.history.join("\n")
        };
        let prompt = planning_prompt(
            &request.user_request,
            &request.workspace.describe(100),
            &history,
        );

        let response =
            match tokio::time::timeout(self.config.model_timeout, self.model.complete(&prompt))
                .await
            {
                Ok(Ok(text)) => Some(text),
                Ok(Err(e)) => {
                    tracing::warn!("Planning model call failed: {}", e);
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        "Planning model call timed out after {:?}",
                        self.config.model_timeout
                    );
                    None
                }
            };

        let drafts = response
            .as_deref()
            .map(|text| self.parse_steps(text))
            .unwrap_or_default();

        let degraded = drafts.is_empty();
        let drafts = if degraded {
            tracing::warn!("Falling back to a single manual step");
            vec![manual_draft(&request.user_request)]
        } else {
            drafts
        };

        let steps: Vec<Step> = drafts
            .into_iter()
            .enumerate()
            .map(|(order, draft)| self.build_step(order, draft))
            .collect();
        let insights = PlanningInsights::from_steps(&steps);
        let task =
            Task::new(&request.user_request, request.workspace.root.clone()).with_steps(steps);

        tracing::info!(
            task_id = %task.id,
            steps = task.steps().len(),
            degraded,
            "Plan ready: {}",
            insights
        );

        Plan {
            task,
            insights,
            degraded,
        }
    }

    /// Parse the model's plan. Steps with an unknown action kind are
    /// dropped; an empty result means the response was unusable.
    fn parse_steps(&self, response: &str) -> Vec<DraftStep> {
        let bare_array = match serde_json::from_str::<Value>(response.trim()) {
            Ok(items @ Value::Array(_)) => Some(items),
            _ => None,
        };
        let Some(value) = bare_array.or_else(|| extract_json(response)) else {
            tracing::warn!("Planning response contained no JSON");
            return Vec::new();
        };

        let items = match &value {
            Value::Array(items) => items.as_slice(),
            Value::Object(obj) => match obj.get("steps") {
                Some(Value::Array(items)) => items.as_slice(),
                _ => return Vec::new(),
            },
            _ => return Vec::new(),
        };

        items
            .iter()
            .take(self.config.max_steps)
            .enumerate()
            .filter_map(|(i, item)| {
                let draft = parse_draft(item, i);
                if draft.is_none() {
                    tracing::warn!("Dropping unparseable plan step {}: {}", i + 1, item);
                }
                draft
            })
            .collect()
    }

    fn build_step(&self, order: usize, draft: DraftStep) -> Step {
        let confidence = ConfidenceScorer::score(&draft.action, &self.memory);
        let fallbacks = synthesize_fallbacks(&draft.title, &draft.action, confidence.risk_level);

        Step::new(order, draft.title, draft.description, draft.action, confidence)
            .with_max_retries(self.config.default_max_retries)
            .with_critical(draft.critical)
            .with_fallbacks(fallbacks)
    }
}

fn parse_draft(item: &Value, index: usize) -> Option<DraftStep> {
    let obj = item.as_object()?;

    // {"action": {"type", "params"}} or {"action": "kind", "params": {...}}
    let (kind, params) = match obj.get("action") {
        Some(Value::Object(action)) => (
            action.get("type").and_then(Value::as_str)?,
            action.get("params").and_then(Value::as_object),
        ),
        Some(Value::String(kind)) => (kind.as_str(), obj.get("params").and_then(Value::as_object)),
        _ => (
            obj.get("type").and_then(Value::as_str)?,
            obj.get("params").and_then(Value::as_object),
        ),
    };
    let kind = ActionKind::parse(kind)?;

    let title = obj
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Step {}", index + 1));

    Some(DraftStep {
        title,
        description: obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        action: StepAction {
            kind,
            params: params.cloned().unwrap_or_else(Map::new),
        },
        critical: obj.get("critical").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn manual_draft(user_request: &str) -> DraftStep {
    DraftStep {
        title: MANUAL_TASK_TITLE.to_string(),
        description: "Automatic planning was not possible; ask the user to carry out the request."
            .to_string(),
        action: StepAction::ask_user(user_request),
        critical: false,
    }
}

/// Fallbacks for medium and high risk steps, in trial order.
///
/// 1. A read of a named resource gets a search for its file name.
/// 2. A well-known config file gets a "create default" write.
/// 3. High risk always ends with a user input request.
pub fn synthesize_fallbacks(title: &str, action: &StepAction, risk: RiskLevel) -> Vec<FallbackPlan> {
    if risk == RiskLevel::Low {
        return Vec::new();
    }

    let mut fallbacks = Vec::new();
    let file_name = action.resource_file_name();

    if action.kind == ActionKind::ReadResource {
        if let Some(name) = &file_name {
            fallbacks.push(FallbackPlan::new(
                format!("{} could not be read at the given path", name),
                StepAction::search(name.clone()),
                SEARCH_FALLBACK_CONFIDENCE,
            ));
        }
    }

    if matches!(
        action.kind,
        ActionKind::ReadResource | ActionKind::WriteResource
    ) {
        if let (Some(name), Some(path)) = (&file_name, action.resource_path()) {
            if is_well_known_file(name) {
                fallbacks.push(FallbackPlan::new(
                    format!("{} is missing", name),
                    StepAction::write(path, default_content(name)),
                    CREATE_DEFAULT_FALLBACK_CONFIDENCE,
                ));
            }
        }
    }

    if risk == RiskLevel::High {
        fallbacks.push(FallbackPlan::new(
            "All automatic attempts failed",
            StepAction::ask_user(format!(
                "Step '{}' could not be completed automatically ({}). How should I proceed?",
                title,
                action.describe()
            )),
            USER_INPUT_FALLBACK_CONFIDENCE,
        ));
    }

    fallbacks.truncate(MAX_FALLBACKS);
    fallbacks
}

/// Minimal content for a recreated well-known file.
fn default_content(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "package.json" | "tsconfig.json" => "{}\n".to_string(),
        "readme.md" => "# Project\n".to_string(),
        ".gitignore" => "target/\nnode_modules/\n".to_string(),
        "cargo.toml" => "[package]\nname = \"project\"\nversion = \"0.1.0\"\nedition = \"2021\"\n"
            .to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelError;
    use async_trait::async_trait;

    struct FixedModel(Result<String, ()>);

    #[async_trait]
    impl LanguageModel for FixedModel {
        async fn complete(&self, _prompt: &str) -> Result<String, ModelError> {
            self.0
                .clone()
                .map_err(|_| ModelError::Unavailable("offline".to_string()))
        }
    }

    fn planner(response: Result<&str, ()>) -> Planner {
        Planner::new(
            Arc::new(FixedModel(response.map(str::to_string))),
            Arc::new(StrategyMemory::new()),
        )
    }

    fn request(text: &str) -> PlanRequest {
        PlanRequest::new(text, WorkspaceSummary::empty("/work"))
    }

    #[tokio::test]
    async fn test_parses_structured_plan() {
        let response = r#"Here is the plan:
```json
{"steps": [
  {"title": "Read manifest", "description": "look", "action": {"type": "read_resource", "params": {"path": "Cargo.toml"}}},
  {"title": "Generate", "action": {"type": "generate_content", "params": {"prompt": "docs"}}, "critical": true}
]}
```"#;
        let plan = planner(Ok(response)).plan(&request("document it")).await;

        assert!(!plan.degraded);
        let steps = plan.task.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].id, "step_1");
        assert_eq!(steps[0].risk_level(), RiskLevel::Low);
        assert!(steps[0].fallbacks.is_empty());
        assert!(steps[1].critical);
        assert_eq!(steps[1].risk_level(), RiskLevel::High);
        assert_eq!(
            steps[1].fallbacks.last().unwrap().action.kind,
            ActionKind::RequestUserInput
        );
        assert_eq!(plan.insights.high_risk_steps, 1);
    }

    #[tokio::test]
    async fn test_malformed_output_degrades_to_manual_task() {
        let plan = planner(Ok("I think you should just do it.")).plan(&request("fix it")).await;
        assert!(plan.degraded);
        assert_eq!(plan.task.steps().len(), 1);
        assert_eq!(plan.task.steps()[0].title, MANUAL_TASK_TITLE);
        assert_eq!(
            plan.task.steps()[0].action.kind,
            ActionKind::RequestUserInput
        );
    }

    #[tokio::test]
    async fn test_model_error_degrades_to_manual_task() {
        let plan = planner(Err(())).plan(&request("fix it")).await;
        assert!(plan.degraded);
        assert_eq!(plan.task.steps()[0].title, MANUAL_TASK_TITLE);
    }

    #[tokio::test]
    async fn test_unknown_kinds_are_dropped() {
        let response = r#"{"steps": [
            {"title": "Teleport", "action": {"type": "teleport"}},
            {"title": "Search", "action": "search", "params": {"query": "main"}}
        ]}"#;
        let plan = planner(Ok(response)).plan(&request("find main")).await;
        assert_eq!(plan.task.steps().len(), 1);
        assert_eq!(plan.task.steps()[0].action.kind, ActionKind::Search);
    }

    #[test]
    fn test_read_of_unknown_file_gets_search_fallback() {
        let fallbacks = synthesize_fallbacks(
            "Read",
            &StepAction::read("/totally/fake/missing.txt"),
            RiskLevel::Medium,
        );
        assert_eq!(fallbacks.len(), 1);
        assert_eq!(fallbacks[0].action.kind, ActionKind::Search);
        assert_eq!(fallbacks[0].action.param_str("query"), Some("missing.txt"));
    }

    #[test]
    fn test_high_risk_well_known_read_gets_three_fallbacks() {
        let fallbacks =
            synthesize_fallbacks("Read", &StepAction::read("package.json"), RiskLevel::High);
        let kinds: Vec<_> = fallbacks.iter().map(|f| f.action.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ActionKind::Search,
                ActionKind::WriteResource,
                ActionKind::RequestUserInput
            ]
        );
        assert_eq!(fallbacks[2].confidence, 90);
    }

    #[test]
    fn test_low_risk_has_no_fallbacks() {
        assert!(synthesize_fallbacks("Read", &StepAction::read("x"), RiskLevel::Low).is_empty());
    }

    #[test]
    fn test_predicted_success_rate() {
        let memory = StrategyMemory::new();
        let action = StepAction::read("/totally/fake/missing.txt");
        let confidence = ConfidenceScorer::score(&action, &memory);
        let step = Step::new(0, "Read", "", action.clone(), confidence).with_fallbacks(
            synthesize_fallbacks("Read", &action, RiskLevel::Medium),
        );
        let insights = PlanningInsights::from_steps(&[step]);
        // 1 - 0.5 * 0.4
        assert!((insights.predicted_success_rate - 80.0).abs() < 1e-9);
        assert_eq!(insights.fallback_count, 1);
        assert!((insights.overall_confidence - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_workspace_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target").join("skip.rs"), "").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs").join("guide.md"), "# Guide").unwrap();

        let summary = WorkspaceSummary::scan(dir.path());
        assert_eq!(summary.files, vec!["docs/guide.md", "main.rs"]);
        assert_eq!(summary.language_stats.get("rs"), Some(&1));
        assert_eq!(summary.language_stats.get("md"), Some(&1));
    }
}

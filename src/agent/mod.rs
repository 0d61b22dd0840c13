//! Agent module: planning, scoring, reasoning cycles and execution.

mod confidence;
mod engine;
mod planner;
mod reasoning;
mod record;
mod strategy_memory;
mod stuck;
mod task;

pub use confidence::{
    is_well_known_file, ConfidenceBreakdown, ConfidenceFactor, ConfidenceScorer, RiskLevel,
    WELL_KNOWN_FILES,
};
pub use engine::{
    ApprovalHandler, AutoApprove, CancelHandle, ConsoleApprover, EngineBuilder, EngineConfig,
    EngineError, ExecutionEngine, ExecutionObserver, RetryPolicy, TaskRun,
};
pub use planner::{
    synthesize_fallbacks, Plan, PlanRequest, Planner, PlannerConfig, PlanningInsights,
    WorkspaceSummary, MANUAL_TASK_TITLE,
};
pub use reasoning::{
    parse_action, CycleContext, CycleOutcome, Observation, ReasoningConfig, ReasoningCycle,
    ReasoningExecutor, Reflection, Thought, DEFAULT_SUGGESTED_CHANGE,
};
pub use record::{RecordError, TaskRecord, TaskRecordStore, RECORD_SCHEMA_VERSION};
pub use strategy_memory::{
    pattern_hash, pattern_shape, MemoryStats, StrategyMemory, StrategyMemoryError, StrategyRecord,
};
pub use stuck::{
    AdvisoryChannel, AdvisoryError, AdvisoryResponse, EscalationContext, HelpOutcome,
    ModelAdvisor, Severity, StuckConfig, StuckKind, StuckMonitor, StuckPattern,
};
pub use task::{
    ApprovalRequest, ApprovalResolution, ExecutionLogEntry, FallbackPlan, Step, StepStatus, Task,
    TaskOutcome, TaskProgress, TaskStatus, TaskSummary,
};

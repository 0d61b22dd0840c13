//! Task Pilot - autonomous multi-step task execution
//!
//! This is the CLI entry point for the task-pilot tool.
//! Run with: cargo run --bin task-pilot -- run "Add a CHANGELOG entry"

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use task_pilot::agent::{
    ConsoleApprover, ExecutionObserver, ReasoningCycle, Step, StepStatus, TaskOutcome,
    TaskProgress,
};
use task_pilot::{
    workspace_registry, AppSettings, CancelHandle, EngineBuilder, ModelClient, Plan, PlanRequest,
    Planner, StrategyMemory, TaskRecordStore, WorkspaceSummary,
};

#[derive(Parser)]
#[command(name = "task-pilot", version, about = "Autonomous multi-step task execution")]
struct Cli {
    /// Workspace the task operates on
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Approve destructive steps without asking
    #[arg(long)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan a request and print the plan without executing it
    Plan { request: String },
    /// Plan and execute a request
    Run { request: String },
    /// Show learned strategy patterns
    Memory,
    /// Show a stored task record
    Show { task_id: String },
}

/// Prints progress to the console.
struct ConsoleObserver;

impl ExecutionObserver for ConsoleObserver {
    fn on_step_start(&self, _task_id: &str, step: &Step) {
        println!("▶ {} [{}]", step.title, step.action.describe());
    }

    fn on_step_complete(&self, _task_id: &str, step: &Step, status: StepStatus) {
        let mark = match status {
            StepStatus::Completed => "✓",
            StepStatus::Skipped => "↷",
            _ => "✗",
        };
        match &step.last_error {
            Some(error) if status != StepStatus::Completed => {
                println!("{} {} ({})", mark, step.title, error)
            }
            _ => println!("{} {}", mark, step.title),
        }
    }

    fn on_progress(&self, _task_id: &str, progress: &TaskProgress) {
        println!(
            "  progress: {} ({:.0}%)",
            progress,
            progress.completion_percentage()
        );
    }

    fn on_cycle(&self, _task_id: &str, cycle: &ReasoningCycle) {
        let verdict = if cycle.result.success { "ok" } else { "failed" };
        println!(
            "  cycle {} {}: {}",
            cycle.cycle_number, verdict, cycle.observation.actual_outcome
        );
    }
}

fn print_plan(plan: &Plan) {
    if plan.degraded {
        println!("⚠ Planning degraded to a manual step");
    }
    println!("Plan for: {}", plan.task.user_request);
    for step in plan.task.steps() {
        println!(
            "  {}. {} [{}] confidence {} ({:?})",
            step.order + 1,
            step.title,
            step.action.describe(),
            step.confidence.score,
            step.confidence.risk_level
        );
        let factors: Vec<String> = step
            .confidence
            .factors
            .iter()
            .map(|f| format!("{} {:+}", f.label, f.delta))
            .collect();
        println!("       factors: {}", factors.join(", "));
        for fallback in &step.fallbacks {
            println!(
                "       fallback: {} ({}%)",
                fallback.action.describe(),
                fallback.confidence
            );
        }
    }
    println!("Insights: {}", plan.insights);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = AppSettings::load().with_env_overrides();

    let memory_path = settings
        .strategy_memory_file()
        .context("Cannot determine data directory for strategy memory")?;
    let records_dir = settings
        .task_records_dir()
        .context("Cannot determine data directory for task records")?;

    match cli.command {
        Command::Memory => {
            let memory = StrategyMemory::load(&memory_path)?;
            let stats = memory.stats();
            println!(
                "{} patterns, {} attempts, {} successes",
                stats.patterns, stats.attempts, stats.successes
            );
            for record in memory.records() {
                println!(
                    "  {:>5.1}% {}/{}  {}",
                    record.success_rate() * 100.0,
                    record.success_count,
                    record.attempt_count,
                    record.pattern
                );
            }
        }
        Command::Show { task_id } => {
            let record = TaskRecordStore::new(&records_dir).load(&task_id)?;
            println!("Task {} ({:?})", record.task.id, record.task.status);
            println!("Request: {}", record.task.user_request);
            for step in record.task.steps() {
                println!(
                    "  {} {} {:?} retries={}",
                    step.id, step.title, step.status, step.retry_count
                );
                for cycle in record.cycles_for(&step.id) {
                    println!(
                        "    cycle {}: {} -> {}",
                        cycle.cycle_number,
                        cycle.action.describe(),
                        cycle.observation.actual_outcome
                    );
                }
            }
            if let Some(summary) = record.summary {
                println!("{}", summary);
            }
        }
        Command::Plan { request } | Command::Run { request } if request.trim().is_empty() => {
            bail!("Request must not be empty");
        }
        Command::Plan { request } => {
            let memory = Arc::new(StrategyMemory::load(&memory_path)?);
            let model = Arc::new(ModelClient::new(settings.model_config()));
            let planner = Planner::with_config(model, memory, settings.planner_config());
            let plan = planner
                .plan(&PlanRequest::new(request, WorkspaceSummary::scan(&cli.workspace)))
                .await;
            print_plan(&plan);
        }
        Command::Run { request } => {
            let memory = Arc::new(StrategyMemory::load(&memory_path)?);
            let model = Arc::new(ModelClient::new(settings.model_config()));
            let planner =
                Planner::with_config(model.clone(), memory.clone(), settings.planner_config());
            let plan = planner
                .plan(&PlanRequest::new(request, WorkspaceSummary::scan(&cli.workspace)))
                .await;
            print_plan(&plan);

            let registry = workspace_registry(&cli.workspace, model.clone(), None);
            let mut builder = EngineBuilder::new()
                .with_model(model)
                .with_registry(Arc::new(registry))
                .with_memory(memory.clone())
                .with_observer(Arc::new(ConsoleObserver))
                .with_record_store(TaskRecordStore::new(&records_dir))
                .with_config(settings.engine_config());
            builder = if cli.yes || settings.auto_approve {
                builder.auto_approve()
            } else {
                builder.with_approval_handler(Arc::new(ConsoleApprover))
            };
            let engine = builder.build()?;

            let cancel = CancelHandle::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, cancelling task");
                    ctrl_c.cancel();
                }
            });

            let run = engine.run_with_cancel(plan.task, cancel).await?;
            memory
                .save(&memory_path)
                .with_context(|| format!("Failed to save {}", memory_path.display()))?;

            println!("\n{}", "=".repeat(50));
            println!("Task {}: {}", run.task.id, run.summary);
            if !run.summary.rolled_back_steps.is_empty() {
                println!("Rolled back: {}", run.summary.rolled_back_steps.join(", "));
            }
            println!("{}", "=".repeat(50));

            // A console prompt may still be blocked reading stdin.
            if run.summary.outcome == TaskOutcome::Cancelled {
                std::process::exit(130);
            }
        }
    }

    Ok(())
}

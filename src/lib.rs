// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Task Pilot
//!
//! Autonomous multi-step task execution engine.
//!
//! A natural-language request is turned into an ordered plan of steps, each
//! scored for confidence and given fallbacks. The engine then executes the
//! plan one step at a time through a think / act / observe / reflect cycle,
//! retrying with backoff, switching to fallbacks, pausing for approval on
//! destructive actions, escalating when stuck, and rolling back completed
//! work when a critical step fails. Outcomes feed a persistent strategy
//! memory that raises the confidence of patterns that worked before.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use task_pilot::{
//!     workspace_registry, EngineBuilder, ModelClient, PlanRequest, Planner, StrategyMemory,
//!     WorkspaceSummary,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let model = Arc::new(ModelClient::with_defaults());
//!     let memory = Arc::new(StrategyMemory::load("strategy_memory.json")?);
//!
//!     let planner = Planner::new(model.clone(), memory.clone());
//!     let request = PlanRequest::new("Add a CHANGELOG entry", WorkspaceSummary::scan("."));
//!     let plan = planner.plan(&request).await;
//!     println!("{}", plan.insights);
//!
//!     let engine = EngineBuilder::new()
//!         .with_model(model.clone())
//!         .with_registry(Arc::new(workspace_registry(".", model, None)))
//!         .with_memory(memory.clone())
//!         .auto_approve()
//!         .build()?;
//!     let run = engine.run(plan.task).await?;
//!     println!("{}", run.summary);
//!
//!     memory.save("strategy_memory.json")?;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod agent;
pub mod config;
pub mod model;
pub mod settings;

pub use actions::{
    workspace_registry, ActionHandler, ActionKind, ActionRegistry, StepAction, StepResult,
};
pub use agent::{
    ApprovalHandler, CancelHandle, ConfidenceScorer, EngineBuilder, EngineConfig,
    ExecutionEngine, Plan, PlanRequest, Planner, PlannerConfig, RetryPolicy, StrategyMemory,
    Task, TaskRecordStore, TaskRun, TaskStatus, TaskSummary, WorkspaceSummary,
};
pub use model::{LanguageModel, ModelClient, ModelConfig};
pub use settings::AppSettings;

// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Core workflow execution engine.
//!
//! Takes a declarative graph of typed steps with explicit dependencies,
//! resolves a deterministic execution order, and runs the graph to
//! completion while honoring per-step timeouts, retry policies, named
//! resource quotas, cooperative cancellation, and optional checkpoint
//! persistence with resume.
//!
//! ```no_run
//! use flowrun_core::{RunnerOptions, Workflow, WorkflowRunner};
//!
//! # async fn run() -> flowrun_core::Result<()> {
//! let workflow = Workflow::from_file("pipeline.yaml")?;
//! let runner = WorkflowRunner::new(RunnerOptions::default());
//! let result = runner.execute(workflow).await?;
//! println!("{}", runner.generate_summary(&result));
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod dag;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod interpolate;
pub mod metrics;
#[cfg(feature = "state-persistence")]
mod persist;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod shutdown;
pub mod workflow;

pub use context::{ContextSnapshot, ExecutionContext, LogEntry, LogLevel};
pub use dag::{ParallelGroup, WorkflowDag};
pub use error::{EngineError, ErrorKind, InterpolationError, Result, ValidationError};
pub use executor::{
    AgentExecutor, AgentHost, AgentRequest, AgentResponse, ExecutorRegistry, ScriptExecutor,
    StepExecutor,
};
pub use hooks::{EventKind, HookBus, HookBusConfig, HookEvent, HookHandler, HookRegistration};
pub use interpolate::{InterpolationOptions, Interpolator};
pub use metrics::ExecutionMetrics;
pub use retry::{RetryExecutor, RetryPolicy};
pub use runner::{RunnerOptions, WorkflowResult, WorkflowRunner, WorkflowStatus};
pub use scheduler::{GroupScheduler, SchedulerConfig, StepResult, StepStatus};
pub use shutdown::{ShutdownController, ShutdownReason};
pub use workflow::{
    AgentConfig, ParallelConfig, RetryConfig, ScriptConfig, Step, StepConfig, StepKind,
    StepParallel, Workflow,
};

// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Workflow runner: composes the resolver, context, scheduler, executor
//! registry, hook bus, and (optionally) the snapshot store into one
//! lifecycle.
//!
//! A runner drives one workflow execution at a time; `cancel`, `status`
//! and `progress` observe the in-flight run from other tasks.

use crate::context::{ContextSnapshot, ExecutionContext};
use crate::dag::WorkflowDag;
use crate::error::{EngineError, Result, ValidationError};
use crate::executor::ExecutorRegistry;
use crate::hooks::{EventKind, HookBus, HookEvent};
use crate::interpolate::{InterpolationOptions, Interpolator};
use crate::metrics::{self, ExecutionMetrics};
use crate::scheduler::{GroupScheduler, SchedulerConfig, StepResult, StepStatus};
use crate::shutdown::{ShutdownController, ShutdownReason};
use crate::workflow::{RetryConfig, Workflow};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[cfg(feature = "state-persistence")]
use crate::persist::{restore_step_result, Checkpointer};
#[cfg(feature = "state-persistence")]
use flowrun_state::StateStoreRef;

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution options.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Whole-workflow deadline in milliseconds; overrides the definition.
    pub timeout_ms: Option<u64>,

    /// Workflow-wide continue-on-error default.
    pub continue_on_error: bool,

    /// Seed variables overlaid onto the context.
    pub variables: HashMap<String, Value>,

    /// Force parallelism on or off; `None` follows the definition.
    pub parallel_enabled: Option<bool>,

    /// Default per-group concurrency cap; `None` follows the definition.
    pub max_concurrency: Option<usize>,

    /// Fallback retry policy for steps without one.
    pub retry: Option<RetryConfig>,

    /// Randomize retry backoff delays.
    pub retry_jitter: bool,

    /// Fallback per-step deadline in milliseconds.
    pub step_timeout_ms: Option<u64>,

    /// Append step transitions to the context log.
    pub enable_logging: bool,

    /// Collect the per-run metrics block and prometheus counters.
    pub enable_metrics: bool,

    /// Emit lifecycle events through the hook bus.
    pub enable_hooks: bool,

    /// Persist snapshots (requires a state store).
    pub enable_persistence: bool,

    /// Checkpoint after every N completed steps.
    pub checkpoint_interval: u64,

    /// Grace period for in-flight steps after a shutdown signal, in
    /// milliseconds.
    pub grace_period_ms: u64,

    /// Missing interpolation paths become errors instead of empty
    /// strings.
    pub strict_interpolation: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            continue_on_error: false,
            variables: HashMap::new(),
            parallel_enabled: None,
            max_concurrency: None,
            retry: None,
            retry_jitter: false,
            step_timeout_ms: None,
            enable_logging: true,
            enable_metrics: false,
            enable_hooks: true,
            enable_persistence: false,
            checkpoint_interval: 1,
            grace_period_ms: 5_000,
            strict_interpolation: false,
        }
    }
}

/// Final outcome of a workflow execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub success: bool,
    pub step_results: HashMap<String, StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecutionMetrics>,
}

/// State carried from a snapshot into a resumed execution.
struct ResumeState {
    context: ContextSnapshot,
    completed: Vec<StepResult>,
    base_version: u64,
    paused_duration_ms: u64,
}

/// The orchestrator.
pub struct WorkflowRunner {
    registry: Arc<ExecutorRegistry>,
    hooks: Arc<HookBus>,
    options: RunnerOptions,
    shutdown: Arc<ShutdownController>,
    status: Arc<RwLock<WorkflowStatus>>,
    active: RwLock<Option<GroupScheduler>>,
    pause_requested: AtomicBool,
    #[cfg(feature = "state-persistence")]
    store: Option<StateStoreRef>,
}

impl WorkflowRunner {
    /// Creates a runner with the built-in executors and a fresh hook bus.
    pub fn new(options: RunnerOptions) -> Self {
        let grace = Duration::from_millis(options.grace_period_ms);
        Self {
            registry: Arc::new(ExecutorRegistry::with_builtins()),
            hooks: Arc::new(HookBus::default()),
            options,
            shutdown: Arc::new(ShutdownController::new(grace)),
            status: Arc::new(RwLock::new(WorkflowStatus::Pending)),
            active: RwLock::new(None),
            pause_requested: AtomicBool::new(false),
            #[cfg(feature = "state-persistence")]
            store: None,
        }
    }

    /// Replaces the executor registry.
    pub fn with_registry(mut self, registry: Arc<ExecutorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the hook bus.
    pub fn with_hooks(mut self, hooks: Arc<HookBus>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Attaches a snapshot store and turns persistence on.
    #[cfg(feature = "state-persistence")]
    pub fn with_state_store(mut self, store: StateStoreRef) -> Self {
        self.store = Some(store);
        self.options.enable_persistence = true;
        self
    }

    /// The hook bus, for registering handlers.
    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    /// The executor registry, for registering plugins.
    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Executes a workflow definition to completion.
    pub async fn execute(&self, workflow: Workflow) -> Result<WorkflowResult> {
        let workflow_id = uuid::Uuid::new_v4().to_string();
        self.execute_inner(workflow, workflow_id, None).await
    }

    /// Resumes a previously persisted workflow. Completed steps are
    /// restored without re-running; a step recorded as running at the
    /// time of the snapshot is treated as not started.
    #[cfg(feature = "state-persistence")]
    pub async fn resume(&self, workflow_id: &str) -> Result<WorkflowResult> {
        let store = self.store.as_ref().ok_or_else(|| {
            EngineError::Persistence("resume requires a state store".to_string())
        })?;
        let snapshot = store
            .load(workflow_id)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?
            .ok_or_else(|| {
                EngineError::Persistence(format!("no snapshot for workflow '{workflow_id}'"))
            })?;

        if !snapshot.status.is_resumable() {
            return Err(EngineError::Persistence(format!(
                "workflow '{workflow_id}' is not resumable from status '{}'",
                snapshot.status
            )));
        }
        snapshot
            .validate()
            .map_err(|reason| EngineError::Persistence(format!("corrupt snapshot: {reason}")))?;

        let workflow: Workflow = serde_json::from_value(snapshot.definition.clone())?;
        let context: ContextSnapshot = serde_json::from_value(snapshot.context.clone())?;

        let mut completed = Vec::new();
        for (id, state) in &snapshot.step_states {
            if state.status.is_completed() {
                if let Some(result) = restore_step_result(id, state) {
                    completed.push(result);
                }
            }
        }

        let paused_extra = if snapshot.status == flowrun_state::SnapshotStatus::Paused {
            (Utc::now() - snapshot.updated_at).num_milliseconds().max(0) as u64
        } else {
            0
        };

        info!(
            workflow_id = %workflow_id,
            completed = completed.len(),
            total = snapshot.execution_order.len(),
            "resuming workflow"
        );

        self.execute_inner(
            workflow,
            workflow_id.to_string(),
            Some(ResumeState {
                context,
                completed,
                base_version: snapshot.version,
                paused_duration_ms: snapshot.paused_duration_ms + paused_extra,
            }),
        )
        .await
    }

    /// Requests cancellation of the in-flight execution.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.shutdown
            .shutdown(ShutdownReason::UserCancel(reason.into()));
    }

    /// Requests a pause: execution stops like a cancel, but the snapshot
    /// is left in a resumable `Paused` state.
    #[cfg(feature = "state-persistence")]
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        self.shutdown
            .shutdown(ShutdownReason::UserCancel("pause requested".to_string()));
    }

    /// Current workflow status.
    pub fn status(&self) -> WorkflowStatus {
        *self.status.read()
    }

    /// Completion percentage in `[0, 100]`.
    pub fn progress(&self) -> f64 {
        let active = self.active.read();
        match active.as_ref() {
            Some(scheduler) => {
                let statuses = scheduler.statuses();
                if statuses.is_empty() {
                    return 0.0;
                }
                let terminal = statuses.values().filter(|s| s.is_terminal()).count();
                terminal as f64 / statuses.len() as f64 * 100.0
            }
            None => {
                if self.status().is_terminal() {
                    100.0
                } else {
                    0.0
                }
            }
        }
    }

    async fn execute_inner(
        &self,
        workflow: Workflow,
        workflow_id: String,
        resume: Option<ResumeState>,
    ) -> Result<WorkflowResult> {
        // Validation aborts before any step runs.
        if let Err(errors) = workflow.validate() {
            for error in &errors {
                warn!(error = %error, "workflow validation error");
            }
            let first = errors.into_iter().next().expect("validation errors present");
            return Err(first.into());
        }
        for step in &workflow.steps {
            if !self.registry.contains(step.kind.as_str()) {
                return Err(ValidationError::UnknownStepType {
                    step_id: step.id.clone(),
                    kind: step.kind.as_str().to_string(),
                }
                .into());
            }
            self.registry.validate_step(step)?;
        }

        let dag = WorkflowDag::from_workflow(&workflow)?;
        let execution_order = dag.execution_order()?;
        let parallel_cfg = workflow.parallel_config();
        let default_cap = self
            .options
            .max_concurrency
            .unwrap_or(parallel_cfg.default_max_concurrency);
        let groups = dag.parallel_groups(&workflow, default_cap)?;

        info!(
            workflow_id = %workflow_id,
            workflow_name = %workflow.name,
            steps = workflow.steps.len(),
            groups = groups.len(),
            "starting workflow execution"
        );

        let ctx = match &resume {
            Some(state) => Arc::new(ExecutionContext::from_snapshot(&state.context)),
            None => Arc::new(ExecutionContext::new(
                &workflow_id,
                self.options.variables.clone(),
                workflow.env.clone(),
            )),
        };

        let interpolator = Arc::new(Interpolator::new(InterpolationOptions {
            strict: self.options.strict_interpolation,
            ..Default::default()
        }));

        let scheduler_config = SchedulerConfig {
            parallel_enabled: self
                .options
                .parallel_enabled
                .unwrap_or(parallel_cfg.enabled),
            continue_on_error: self.options.continue_on_error,
            grace_period: Duration::from_millis(self.options.grace_period_ms),
            default_retry: self.options.retry.clone(),
            default_step_timeout_ms: self.options.step_timeout_ms,
            retry_jitter: self.options.retry_jitter,
            enable_hooks: self.options.enable_hooks,
            enable_context_logs: self.options.enable_logging,
            enable_metrics: self.options.enable_metrics,
        };

        #[allow(unused_mut)]
        let mut scheduler = GroupScheduler::new(
            &workflow,
            self.registry.clone(),
            self.hooks.clone(),
            self.shutdown.clone(),
            interpolator,
            scheduler_config,
        )?;

        let mut completed: HashSet<String> = HashSet::new();
        if let Some(state) = &resume {
            for result in &state.completed {
                completed.insert(result.step_id.clone());
                scheduler.restore_result(result.clone());
            }
        }

        *self.status.write() = WorkflowStatus::Running;

        #[cfg(feature = "state-persistence")]
        let checkpointer = self.build_checkpointer(&workflow, &ctx, &execution_order, &scheduler, &resume);
        #[cfg(feature = "state-persistence")]
        if let Some(cp) = &checkpointer {
            scheduler = scheduler.with_checkpoint_sink(cp.clone());
            // Snapshot as soon as the workflow is running.
            cp.save().await;
        }

        *self.active.write() = Some(scheduler.clone());

        self.emit(
            HookEvent::workflow(EventKind::WorkflowStart, &workflow_id)
                .with_payload(json!({ "name": workflow.name, "resumed": resume.is_some() })),
        )
        .await;

        // Whole-workflow deadline flows through the shutdown controller.
        let timeout_ms = self.options.timeout_ms.or(workflow.timeout_ms);
        let watchdog = timeout_ms.map(|ms| {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        warn!(timeout_ms = ms, "workflow deadline exceeded");
                        shutdown.shutdown(ShutdownReason::WorkflowTimeout);
                    }
                    _ = shutdown.token().cancelled() => {}
                }
            })
        });

        let started_at = Utc::now();
        let run_started = Instant::now();

        let run_outcome = scheduler.run(&workflow, &groups, ctx.clone(), &completed).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        run_outcome?;

        let results = scheduler.results();
        let failed: Vec<&str> = execution_order
            .iter()
            .filter(|id| {
                results
                    .get(id.as_str())
                    .map(|r| r.status == StepStatus::Failed)
                    .unwrap_or(false)
            })
            .map(|id| id.as_str())
            .collect();

        let (status, error) = if let Some(reason) = self.shutdown.reason() {
            match reason {
                ShutdownReason::UserCancel(cancel_reason) => {
                    if self.pause_requested.load(Ordering::SeqCst) {
                        (WorkflowStatus::Paused, None)
                    } else {
                        (
                            WorkflowStatus::Cancelled,
                            Some(format!("cancelled: {cancel_reason}")),
                        )
                    }
                }
                ShutdownReason::WorkflowTimeout => (
                    WorkflowStatus::Failed,
                    Some("workflow deadline exceeded".to_string()),
                ),
                ShutdownReason::FatalStep(_) => (
                    WorkflowStatus::Failed,
                    Some(format!("steps failed: {}", failed.join(", "))),
                ),
            }
        } else if !failed.is_empty() {
            (
                WorkflowStatus::Failed,
                Some(format!("steps failed: {}", failed.join(", "))),
            )
        } else {
            (WorkflowStatus::Completed, None)
        };

        *self.status.write() = status;

        let duration = run_started.elapsed();
        let metrics_block = self.options.enable_metrics.then(|| {
            metrics::record_workflow(status.as_str());
            let mut block = ExecutionMetrics {
                total_steps: workflow.steps.len(),
                total_retries: scheduler.total_retries(),
                peak_concurrency: scheduler.peak_concurrency(),
                duration_ms: duration.as_millis() as u64,
                ..Default::default()
            };
            for result in results.values() {
                match result.status {
                    StepStatus::Completed => block.completed_steps += 1,
                    StepStatus::Failed => block.failed_steps += 1,
                    StepStatus::Skipped => block.skipped_steps += 1,
                    StepStatus::Cancelled => block.cancelled_steps += 1,
                    _ => {}
                }
            }
            block
        });

        let terminal_event = match status {
            WorkflowStatus::Completed => EventKind::WorkflowComplete,
            WorkflowStatus::Failed => EventKind::WorkflowError,
            _ => EventKind::WorkflowCancelled,
        };
        self.emit(
            HookEvent::workflow(terminal_event, &workflow_id).with_payload(json!({
                "status": status.as_str(),
                "error": error,
            })),
        )
        .await;

        #[cfg(feature = "state-persistence")]
        if let Some(cp) = &checkpointer {
            cp.save().await;
        }

        info!(
            workflow_id = %workflow_id,
            status = %status,
            duration_ms = duration.as_millis() as u64,
            "workflow finished"
        );

        Ok(WorkflowResult {
            workflow_id,
            workflow_name: workflow.name.clone(),
            status,
            success: status == WorkflowStatus::Completed,
            step_results: results,
            error,
            started_at,
            finished_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            metrics: metrics_block,
        })
    }

    #[cfg(feature = "state-persistence")]
    fn build_checkpointer(
        &self,
        workflow: &Workflow,
        ctx: &Arc<ExecutionContext>,
        execution_order: &[String],
        scheduler: &GroupScheduler,
        resume: &Option<ResumeState>,
    ) -> Option<Arc<Checkpointer>> {
        if !self.options.enable_persistence {
            return None;
        }
        let store = self.store.as_ref()?;
        Some(Arc::new(Checkpointer::new(
            store.clone(),
            ctx.clone(),
            serde_json::to_value(workflow).unwrap_or(Value::Null),
            execution_order.to_vec(),
            scheduler.clone(),
            self.status.clone(),
            self.options.checkpoint_interval,
            resume.as_ref().map(|s| s.base_version).unwrap_or(0),
            resume.as_ref().map(|s| s.paused_duration_ms).unwrap_or(0),
        )))
    }

    async fn emit(&self, event: HookEvent) {
        if !self.options.enable_hooks {
            return;
        }
        if let Err(e) = self.hooks.emit(&event).await {
            warn!(error = %e, "hook emission failed");
        }
    }

    /// Human-readable execution summary.
    pub fn generate_summary(&self, result: &WorkflowResult) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Workflow '{}' ({}) {} in {}ms\n",
            result.workflow_name,
            result.workflow_id,
            result.status.as_str().to_uppercase(),
            result.duration_ms
        ));

        let mut counts = (0usize, 0usize, 0usize, 0usize);
        for r in result.step_results.values() {
            match r.status {
                StepStatus::Completed => counts.0 += 1,
                StepStatus::Failed => counts.1 += 1,
                StepStatus::Skipped => counts.2 += 1,
                StepStatus::Cancelled => counts.3 += 1,
                _ => {}
            }
        }
        out.push_str(&format!(
            "Steps: {} total, {} completed, {} failed, {} skipped, {} cancelled\n",
            result.step_results.len(),
            counts.0,
            counts.1,
            counts.2,
            counts.3
        ));

        let mut results: Vec<&StepResult> = result.step_results.values().collect();
        results.sort_by(|a, b| {
            a.parallel_group
                .cmp(&b.parallel_group)
                .then_with(|| a.step_id.cmp(&b.step_id))
        });
        for r in results {
            let marker = match r.status {
                StepStatus::Completed => "+",
                StepStatus::Failed => "x",
                StepStatus::Skipped => "-",
                StepStatus::Cancelled => "!",
                _ => "?",
            };
            let detail = r
                .error
                .as_deref()
                .or(r.skip_reason.as_deref())
                .unwrap_or("ok");
            out.push_str(&format!(
                "  [{marker}] {} ({}ms, {} attempts): {detail}\n",
                r.step_id,
                r.execution_time.as_millis(),
                r.attempts
            ));
        }

        if let Some(error) = &result.error {
            out.push_str(&format!("Error: {error}\n"));
        }
        if let Some(metrics) = &result.metrics {
            out.push_str(&format!(
                "Peak concurrency: {}, retries: {}\n",
                metrics.peak_concurrency, metrics.total_retries
            ));
        }
        out
    }

    /// Machine-parseable execution report.
    pub fn generate_detailed_report(&self, result: &WorkflowResult) -> Value {
        json!({
            "workflow": result,
            "hookStats": self.hooks.all_stats(),
        })
    }
}

// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Parallel group scheduler.
//!
//! Groups run strictly in order; steps within a group run concurrently
//! under the group's semaphore and, when tagged, a workflow-global named
//! resource semaphore. Acquisition order is fixed (group first, then
//! resource) so concurrent steps cannot deadlock. A fatal failure stops
//! dispatch, signals in-flight steps, and grants them a grace period
//! before they are abandoned and reported as cancelled.

use crate::context::{ExecutionContext, LogLevel};
use crate::dag::ParallelGroup;
use crate::error::{EngineError, Result};
use crate::executor::ExecutorRegistry;
use crate::hooks::{EventKind, HookBus, HookEvent};
use crate::interpolate::Interpolator;
use crate::metrics::{self, ConcurrencyGauge};
use crate::retry::{with_deadline, RetryExecutor, RetryPolicy};
use crate::shutdown::{ShutdownController, ShutdownReason};
use crate::workflow::{RetryConfig, Step, Workflow};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Execution status for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step is waiting for dependencies.
    Pending,
    /// Step is currently executing.
    Running,
    /// Step completed successfully.
    Completed,
    /// Step failed with an error.
    Failed,
    /// Step was skipped (condition or failed dependencies).
    Skipped,
    /// Step was cancelled before or during execution.
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of a step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Step id.
    pub step_id: String,
    /// Terminal status.
    pub status: StepStatus,
    /// Convenience flag, true only for completed steps.
    pub success: bool,
    /// Output adopted by the context on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message if failed or cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the step was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Wall-clock time across all attempts, in milliseconds.
    #[serde(
        rename = "executionTime",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub execution_time: Duration,
    /// Attempts made; 0 when the step never started.
    pub attempts: u32,
    /// Index of the parallel group the step belonged to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<usize>,
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

impl StepResult {
    pub fn completed(
        step_id: impl Into<String>,
        output: Value,
        execution_time: Duration,
        attempts: u32,
        parallel_group: usize,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Completed,
            success: true,
            output: Some(output),
            error: None,
            skip_reason: None,
            execution_time,
            attempts,
            parallel_group: Some(parallel_group),
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        error: impl Into<String>,
        execution_time: Duration,
        attempts: u32,
        parallel_group: usize,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            success: false,
            output: None,
            error: Some(error.into()),
            skip_reason: None,
            execution_time,
            attempts,
            parallel_group: Some(parallel_group),
        }
    }

    pub fn skipped(
        step_id: impl Into<String>,
        reason: impl Into<String>,
        parallel_group: usize,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            success: false,
            output: None,
            error: None,
            skip_reason: Some(reason.into()),
            execution_time: Duration::ZERO,
            attempts: 0,
            parallel_group: Some(parallel_group),
        }
    }

    pub fn cancelled(
        step_id: impl Into<String>,
        reason: impl Into<String>,
        execution_time: Duration,
        attempts: u32,
        parallel_group: usize,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Cancelled,
            success: false,
            output: None,
            error: Some(reason.into()),
            skip_reason: None,
            execution_time,
            attempts,
            parallel_group: Some(parallel_group),
        }
    }
}

/// Receives terminal step transitions, e.g. to drive checkpointing.
#[async_trait::async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn on_step_terminal(&self, step_id: &str, status: StepStatus);
}

/// Scheduler behavior switches derived from runner options.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Master parallelism switch; off forces group caps to 1.
    pub parallel_enabled: bool,
    /// Workflow-level continue-on-error default.
    pub continue_on_error: bool,
    /// Grace period granted to in-flight steps after a shutdown signal.
    pub grace_period: Duration,
    /// Fallback retry policy for steps without one.
    pub default_retry: Option<RetryConfig>,
    /// Fallback per-step deadline.
    pub default_step_timeout_ms: Option<u64>,
    /// Randomize retry backoff.
    pub retry_jitter: bool,
    /// Emit lifecycle events.
    pub enable_hooks: bool,
    /// Append step transitions to the context log.
    pub enable_context_logs: bool,
    /// Record prometheus metrics.
    pub enable_metrics: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel_enabled: true,
            continue_on_error: false,
            grace_period: ShutdownController::DEFAULT_GRACE_PERIOD,
            default_retry: None,
            default_step_timeout_ms: None,
            retry_jitter: false,
            enable_hooks: true,
            enable_context_logs: true,
            enable_metrics: false,
        }
    }
}

/// Drives parallel groups to completion.
#[derive(Clone)]
pub struct GroupScheduler {
    registry: Arc<ExecutorRegistry>,
    hooks: Arc<HookBus>,
    shutdown: Arc<ShutdownController>,
    interpolator: Arc<Interpolator>,
    config: SchedulerConfig,
    resources: HashMap<String, Arc<Semaphore>>,
    step_results: Arc<DashMap<String, StepResult>>,
    step_statuses: Arc<DashMap<String, StepStatus>>,
    gauge: Arc<ConcurrencyGauge>,
    retries: Arc<AtomicU64>,
    checkpoint: Option<Arc<dyn CheckpointSink>>,
}

impl GroupScheduler {
    /// Creates a scheduler for one workflow execution. Resource
    /// semaphores are sized from the workflow's resource table.
    pub fn new(
        workflow: &Workflow,
        registry: Arc<ExecutorRegistry>,
        hooks: Arc<HookBus>,
        shutdown: Arc<ShutdownController>,
        interpolator: Arc<Interpolator>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let mut resources = HashMap::new();
        for (name, quota) in &workflow.parallel_config().resources {
            if *quota == 0 {
                return Err(EngineError::ResourceExhausted(format!(
                    "resource '{name}' has a zero quota"
                )));
            }
            resources.insert(name.clone(), Arc::new(Semaphore::new(*quota)));
        }

        let step_statuses = Arc::new(DashMap::new());
        for step in &workflow.steps {
            step_statuses.insert(step.id.clone(), StepStatus::Pending);
        }

        Ok(Self {
            registry,
            hooks,
            shutdown,
            interpolator,
            config,
            resources,
            step_results: Arc::new(DashMap::new()),
            step_statuses,
            gauge: Arc::new(ConcurrencyGauge::default()),
            retries: Arc::new(AtomicU64::new(0)),
            checkpoint: None,
        })
    }

    /// Attaches a checkpoint sink invoked on terminal step transitions.
    pub fn with_checkpoint_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoint = Some(sink);
        self
    }

    /// Pre-loads a result for a step restored from a snapshot.
    pub fn restore_result(&self, result: StepResult) {
        self.step_statuses
            .insert(result.step_id.clone(), result.status);
        self.step_results.insert(result.step_id.clone(), result);
    }

    /// All step results recorded so far.
    pub fn results(&self) -> HashMap<String, StepResult> {
        self.step_results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Statuses for every known step.
    pub fn statuses(&self) -> HashMap<String, StepStatus> {
        self.step_statuses
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Peak concurrent in-flight steps observed.
    pub fn peak_concurrency(&self) -> usize {
        self.gauge.peak()
    }

    /// Total retry attempts observed.
    pub fn total_retries(&self) -> u64 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Runs every group in order. Steps in `already_completed` are
    /// skipped over without dispatch (resume path).
    pub async fn run(
        &self,
        workflow: &Workflow,
        groups: &[ParallelGroup],
        ctx: Arc<ExecutionContext>,
        already_completed: &HashSet<String>,
    ) -> Result<()> {
        for group in groups {
            self.run_group(workflow, group, ctx.clone(), already_completed)
                .await?;
        }
        Ok(())
    }

    async fn run_group(
        &self,
        workflow: &Workflow,
        group: &ParallelGroup,
        ctx: Arc<ExecutionContext>,
        already_completed: &HashSet<String>,
    ) -> Result<()> {
        let cap = if self.config.parallel_enabled {
            group.max_concurrency.max(1)
        } else {
            1
        };
        let group_sem = Arc::new(Semaphore::new(cap));
        debug!(group = group.index, cap, steps = group.step_ids.len(), "starting group");

        let mut join_set: JoinSet<()> = JoinSet::new();

        for step_id in &group.step_ids {
            if already_completed.contains(step_id) {
                continue;
            }
            let step = workflow
                .step(step_id)
                .ok_or_else(|| EngineError::StepNotFound(step_id.clone()))?
                .clone();

            // 1. Condition gate.
            if let Some(condition) = &step.condition {
                match self.interpolator.evaluate_condition(&ctx, condition) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.record_skip(&ctx, &step, "condition evaluated falsy", group.index)
                            .await;
                        continue;
                    }
                    Err(e) => {
                        self.record_failure_without_start(
                            &ctx,
                            &step,
                            format!("condition error: {e}"),
                            group.index,
                        )
                        .await;
                        if !(step.continue_on_error || self.config.continue_on_error) {
                            self.shutdown
                                .shutdown(ShutdownReason::FatalStep(step.id.clone()));
                        }
                        continue;
                    }
                }
            }

            // 2. Dependency outcomes.
            let failed_dep = step.depends_on.iter().find(|dep| {
                self.step_results
                    .get(dep.as_str())
                    .map(|r| matches!(r.status, StepStatus::Failed | StepStatus::Cancelled))
                    .unwrap_or(false)
            });
            if failed_dep.is_some()
                && !(step.continue_on_error || self.config.continue_on_error)
            {
                self.record_skip(&ctx, &step, "dependencies failed", group.index)
                    .await;
                continue;
            }

            // 3. Shutdown gate: stop dispatching new work.
            if self.shutdown.is_shutdown() {
                let reason = self
                    .shutdown
                    .reason()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "shutdown".to_string());
                self.record_cancelled_without_start(&ctx, &step, reason, group.index)
                    .await;
                continue;
            }

            let this = self.clone();
            let ctx = ctx.clone();
            let group_sem = group_sem.clone();
            let resource_sem = step
                .parallel
                .as_ref()
                .and_then(|p| p.resource.as_ref())
                .and_then(|name| self.resources.get(name).cloned());
            let group_index = group.index;

            join_set.spawn(async move {
                this.run_step(step, ctx, group_sem, resource_sem, group_index)
                    .await;
            });
        }

        self.await_group(group, &mut join_set, already_completed).await;
        Ok(())
    }

    /// Waits for all spawned steps; once shutdown is signaled the wait is
    /// bounded by the grace period, after which survivors are aborted.
    async fn await_group(
        &self,
        group: &ParallelGroup,
        join_set: &mut JoinSet<()>,
        already_completed: &HashSet<String>,
    ) {
        let mut grace_deadline: Option<tokio::time::Instant> = None;

        while !join_set.is_empty() {
            if grace_deadline.is_none() && self.shutdown.is_shutdown() {
                grace_deadline = Some(tokio::time::Instant::now() + self.config.grace_period);
            }

            match grace_deadline {
                None => {
                    tokio::select! {
                        _ = join_set.join_next() => {}
                        _ = self.shutdown.token().cancelled() => {}
                    }
                }
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, join_set.join_next())
                        .await
                        .is_err()
                    {
                        warn!(
                            group = group.index,
                            in_flight = join_set.len(),
                            "grace period expired, abandoning in-flight steps"
                        );
                        join_set.abort_all();
                        while join_set.join_next().await.is_some() {}
                        break;
                    }
                }
            }
        }

        // Anything still non-terminal after an abort is reported cancelled.
        for step_id in &group.step_ids {
            if already_completed.contains(step_id) {
                continue;
            }
            let terminal = self
                .step_results
                .get(step_id.as_str())
                .map(|r| r.status.is_terminal())
                .unwrap_or(false);
            if !terminal {
                let result = StepResult::cancelled(
                    step_id.clone(),
                    "abandoned after grace period",
                    Duration::ZERO,
                    0,
                    group.index,
                );
                self.step_statuses
                    .insert(step_id.clone(), StepStatus::Cancelled);
                self.step_results.insert(step_id.clone(), result);
            }
        }
    }

    /// One step's full lifecycle inside its group.
    async fn run_step(
        &self,
        step: Step,
        ctx: Arc<ExecutionContext>,
        group_sem: Arc<Semaphore>,
        resource_sem: Option<Arc<Semaphore>>,
        group_index: usize,
    ) {
        let step_token = self.shutdown.child_token();

        // Fixed acquisition order: group first, then resource.
        let _group_permit = tokio::select! {
            permit = group_sem.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = step_token.cancelled() => {
                self.record_cancelled_without_start(&ctx, &step, "cancelled while queued".to_string(), group_index)
                    .await;
                return;
            }
        };
        let _resource_permit = match resource_sem {
            Some(sem) => {
                let permit = tokio::select! {
                    permit = sem.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = step_token.cancelled() => {
                        self.record_cancelled_without_start(&ctx, &step, "cancelled while queued".to_string(), group_index)
                            .await;
                        return;
                    }
                };
                Some(permit)
            }
            None => None,
        };

        let executor = match self.registry.get(step.kind.as_str()) {
            Ok(executor) => executor,
            Err(e) => {
                self.record_failure_without_start(&ctx, &step, e.to_string(), group_index)
                    .await;
                if !(step.continue_on_error || self.config.continue_on_error) {
                    self.shutdown
                        .shutdown(ShutdownReason::FatalStep(step.id.clone()));
                }
                return;
            }
        };

        self.step_statuses
            .insert(step.id.clone(), StepStatus::Running);
        ctx.set_current_step_id(Some(step.id.clone()));
        if self.config.enable_context_logs {
            ctx.log(LogLevel::Info, format!("step '{}' started", step.id), Some(&step.id));
        }
        self.emit(
            HookEvent::step(EventKind::StepStart, ctx.workflow_id(), &step.id)
                .with_payload(json!({ "type": step.kind.as_str() })),
        )
        .await;
        self.gauge.enter();

        let started = Instant::now();
        let policy = self.retry_policy(&step);
        let retry = RetryExecutor::new(policy);
        let deadline_ms = self.step_deadline_ms(&step);

        let hooks = self.hooks.clone();
        let retries = self.retries.clone();
        let enable_hooks = self.config.enable_hooks;
        let workflow_id = ctx.workflow_id().to_string();
        let retry_step_id = step.id.clone();
        let on_retry = move |attempt: u32, error: String| {
            let hooks = hooks.clone();
            let retries = retries.clone();
            let workflow_id = workflow_id.clone();
            let step_id = retry_step_id.clone();
            async move {
                retries.fetch_add(1, Ordering::SeqCst);
                metrics::STEP_RETRIES_TOTAL.inc();
                if enable_hooks {
                    let event = HookEvent::step(EventKind::StepRetry, workflow_id, step_id)
                        .with_payload(json!({ "attempt": attempt, "error": error }));
                    if let Err(e) = hooks.emit(&event).await {
                        warn!(error = %e, "hook emission failed");
                    }
                }
            }
        };

        let grace = self.config.grace_period;
        let (result, attempts) = retry
            .execute_with_retry_hook(
                &step_token,
                |_attempt| {
                    let executor = executor.clone();
                    let step = step.clone();
                    let ctx = ctx.clone();
                    let interpolator = self.interpolator.clone();
                    let attempt_token = step_token.child_token();
                    let deadline = deadline_ms.map(Duration::from_millis);
                    async move {
                        let exec_token = attempt_token.clone();
                        with_deadline(deadline, grace, &attempt_token, async move {
                            executor
                                .execute(&step, ctx, &interpolator, exec_token)
                                .await
                        })
                        .await
                    }
                },
                on_retry,
            )
            .await;

        let execution_time = started.elapsed();
        self.gauge.exit();

        match result {
            Ok(output) => {
                info!(
                    step_id = %step.id,
                    duration_ms = execution_time.as_millis() as u64,
                    attempts,
                    "step completed"
                );
                ctx.set_step_output(&step.id, output.clone());
                let result = StepResult::completed(
                    &step.id,
                    output,
                    execution_time,
                    attempts,
                    group_index,
                );
                self.step_statuses
                    .insert(step.id.clone(), StepStatus::Completed);
                self.step_results.insert(step.id.clone(), result);
                if self.config.enable_context_logs {
                    ctx.log(
                        LogLevel::Info,
                        format!("step '{}' completed", step.id),
                        Some(&step.id),
                    );
                }
                if self.config.enable_metrics {
                    metrics::record_step("completed", step.kind.as_str(), execution_time);
                }
                self.emit(
                    HookEvent::step(EventKind::StepComplete, ctx.workflow_id(), &step.id)
                        .with_payload(json!({
                            "executionTime": execution_time.as_millis() as u64,
                            "attempts": attempts,
                        })),
                )
                .await;
                self.notify_checkpoint(&step.id, StepStatus::Completed).await;
            }
            Err(error) if error.is_cancelled() => {
                warn!(step_id = %step.id, "step cancelled");
                let result = StepResult::cancelled(
                    &step.id,
                    error.to_string(),
                    execution_time,
                    attempts,
                    group_index,
                );
                self.step_statuses
                    .insert(step.id.clone(), StepStatus::Cancelled);
                self.step_results.insert(step.id.clone(), result);
                if self.config.enable_metrics {
                    metrics::record_step("cancelled", step.kind.as_str(), execution_time);
                }
                self.emit(
                    HookEvent::step(EventKind::StepError, ctx.workflow_id(), &step.id)
                        .with_payload(json!({ "error": error.to_string(), "cancelled": true })),
                )
                .await;
            }
            Err(error) => {
                warn!(step_id = %step.id, error = %error, attempts, "step failed");
                let result = StepResult::failed(
                    &step.id,
                    error.to_string(),
                    execution_time,
                    attempts,
                    group_index,
                );
                self.step_statuses
                    .insert(step.id.clone(), StepStatus::Failed);
                self.step_results.insert(step.id.clone(), result);
                if self.config.enable_context_logs {
                    ctx.log(
                        LogLevel::Error,
                        format!("step '{}' failed: {error}", step.id),
                        Some(&step.id),
                    );
                }
                if self.config.enable_metrics {
                    metrics::record_step("failed", step.kind.as_str(), execution_time);
                }
                self.emit(
                    HookEvent::step(EventKind::StepError, ctx.workflow_id(), &step.id)
                        .with_payload(json!({
                            "error": error.to_string(),
                            "attempts": attempts,
                        })),
                )
                .await;
                self.notify_checkpoint(&step.id, StepStatus::Failed).await;
                if !(step.continue_on_error || self.config.continue_on_error) {
                    self.shutdown
                        .shutdown(ShutdownReason::FatalStep(step.id.clone()));
                }
            }
        }
    }

    fn retry_policy(&self, step: &Step) -> RetryPolicy {
        let config = step.retry.as_ref().or(self.config.default_retry.as_ref());
        let policy = match config {
            Some(config) => RetryPolicy::from_config(config),
            None => RetryPolicy::default(),
        };
        policy.with_jitter(self.config.retry_jitter)
    }

    fn step_deadline_ms(&self, step: &Step) -> Option<u64> {
        step.config
            .as_script()
            .and_then(|c| c.timeout_ms)
            .or(step.timeout_ms)
            .or(self.config.default_step_timeout_ms)
    }

    async fn record_skip(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        reason: &str,
        group_index: usize,
    ) {
        info!(step_id = %step.id, reason, "step skipped");
        let result = StepResult::skipped(&step.id, reason, group_index);
        self.step_statuses
            .insert(step.id.clone(), StepStatus::Skipped);
        self.step_results.insert(step.id.clone(), result);
        if self.config.enable_context_logs {
            ctx.log(
                LogLevel::Info,
                format!("step '{}' skipped: {reason}", step.id),
                Some(&step.id),
            );
        }
        if self.config.enable_metrics {
            metrics::record_step("skipped", step.kind.as_str(), Duration::ZERO);
        }
        self.emit(
            HookEvent::step(EventKind::StepSkip, ctx.workflow_id(), &step.id)
                .with_payload(json!({ "reason": reason })),
        )
        .await;
    }

    async fn record_failure_without_start(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        error: String,
        group_index: usize,
    ) {
        warn!(step_id = %step.id, error = %error, "step failed before start");
        let result = StepResult::failed(&step.id, &error, Duration::ZERO, 0, group_index);
        self.step_statuses
            .insert(step.id.clone(), StepStatus::Failed);
        self.step_results.insert(step.id.clone(), result);
        if self.config.enable_metrics {
            metrics::record_step("failed", step.kind.as_str(), Duration::ZERO);
        }
        self.emit(
            HookEvent::step(EventKind::StepError, ctx.workflow_id(), &step.id)
                .with_payload(json!({ "error": error })),
        )
        .await;
        self.notify_checkpoint(&step.id, StepStatus::Failed).await;
    }

    async fn record_cancelled_without_start(
        &self,
        ctx: &ExecutionContext,
        step: &Step,
        reason: String,
        group_index: usize,
    ) {
        debug!(step_id = %step.id, reason = %reason, "step cancelled before start");
        let result = StepResult::cancelled(&step.id, &reason, Duration::ZERO, 0, group_index);
        self.step_statuses
            .insert(step.id.clone(), StepStatus::Cancelled);
        self.step_results.insert(step.id.clone(), result);
        if self.config.enable_context_logs {
            ctx.log(
                LogLevel::Warn,
                format!("step '{}' cancelled: {reason}", step.id),
                Some(&step.id),
            );
        }
    }

    async fn emit(&self, event: HookEvent) {
        if !self.config.enable_hooks {
            return;
        }
        if let Err(e) = self.hooks.emit(&event).await {
            warn!(error = %e, "hook emission failed");
        }
    }

    async fn notify_checkpoint(&self, step_id: &str, status: StepStatus) {
        if let Some(sink) = &self.checkpoint {
            sink.on_step_terminal(step_id, status).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::WorkflowDag;
    use crate::executor::StepExecutor;
    use crate::workflow::{ParallelConfig, StepConfig, StepKind, StepParallel};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio_util::sync::CancellationToken;

    /// Test executor: sleeps, optionally fails the first N attempts,
    /// optionally ignores cancellation.
    struct FakeExecutor {
        delay: Duration,
        fail_first: u32,
        ignore_cancel: bool,
        calls: AtomicU32,
        gauge: ConcurrencyGauge,
    }

    impl FakeExecutor {
        fn instant() -> Self {
            Self::slow(Duration::ZERO)
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                fail_first: 0,
                ignore_cancel: false,
                calls: AtomicU32::new(0),
                gauge: ConcurrencyGauge::default(),
            }
        }

        fn failing_first(fail_first: u32) -> Self {
            Self {
                fail_first,
                ..Self::instant()
            }
        }
    }

    #[async_trait]
    impl StepExecutor for FakeExecutor {
        fn kind(&self) -> &str {
            "fake"
        }

        fn validate(&self, _step: &Step) -> Result<()> {
            Ok(())
        }

        async fn execute(
            &self,
            step: &Step,
            _ctx: Arc<ExecutionContext>,
            _interpolator: &Interpolator,
            cancel: CancellationToken,
        ) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.enter();
            if self.delay > Duration::ZERO {
                if self.ignore_cancel {
                    tokio::time::sleep(self.delay).await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        _ = cancel.cancelled() => {
                            self.gauge.exit();
                            return Err(EngineError::Cancelled(format!(
                                "step '{}' cancelled",
                                step.id
                            )));
                        }
                    }
                }
            }
            self.gauge.exit();
            if call <= self.fail_first {
                return Err(EngineError::executor_failure(&step.id, "induced failure"));
            }
            Ok(json!({ "step": step.id, "call": call }))
        }
    }

    fn fake_step(id: &str, deps: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            name: None,
            kind: StepKind::Custom("fake".to_string()),
            config: StepConfig::default(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            condition: None,
            continue_on_error: false,
            parallel: None,
            retry: None,
            timeout_ms: None,
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            name: "sched-test".to_string(),
            version: "1.0".to_string(),
            description: None,
            env: Default::default(),
            steps,
            parallel: None,
            timeout_ms: None,
            metadata: Default::default(),
        }
    }

    struct Harness {
        scheduler: GroupScheduler,
        workflow: Workflow,
        groups: Vec<ParallelGroup>,
        ctx: Arc<ExecutionContext>,
        shutdown: Arc<ShutdownController>,
    }

    fn harness(workflow: Workflow, executor: Arc<dyn StepExecutor>, config: SchedulerConfig) -> Harness {
        let registry = Arc::new(ExecutorRegistry::new());
        registry.register(executor).unwrap();
        let hooks = Arc::new(HookBus::default());
        let shutdown = Arc::new(ShutdownController::new(config.grace_period));
        let scheduler = GroupScheduler::new(
            &workflow,
            registry,
            hooks,
            shutdown.clone(),
            Arc::new(Interpolator::default()),
            config,
        )
        .unwrap();
        let dag = WorkflowDag::from_workflow(&workflow).unwrap();
        let groups = dag
            .parallel_groups(&workflow, workflow.parallel_config().default_max_concurrency)
            .unwrap();
        let ctx = Arc::new(ExecutionContext::new(
            "wf-sched",
            HashMap::new(),
            HashMap::new(),
        ));
        Harness {
            scheduler,
            workflow,
            groups,
            ctx,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_linear_workflow_completes_in_order() {
        let wf = workflow(vec![
            fake_step("a", &[]),
            fake_step("b", &["a"]),
            fake_step("c", &["b"]),
        ]);
        let h = harness(wf, Arc::new(FakeExecutor::instant()), SchedulerConfig::default());

        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &HashSet::new())
            .await
            .unwrap();

        let results = h.scheduler.results();
        assert_eq!(results.len(), 3);
        for id in ["a", "b", "c"] {
            assert!(results[id].success, "step {id} should succeed");
        }
        assert_eq!(results["c"].parallel_group, Some(2));
        // Dependency output visible before dependent ran.
        assert!(h.ctx.get_step_output("a").is_some());
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_and_shuts_down() {
        let mut b = fake_step("b", &[]);
        b.kind = StepKind::Custom("boom".to_string());
        let wf = workflow(vec![
            fake_step("a", &[]),
            b,
            fake_step("c", &["b"]),
        ]);

        struct Boom;
        #[async_trait]
        impl StepExecutor for Boom {
            fn kind(&self) -> &str {
                "boom"
            }
            fn validate(&self, _step: &Step) -> Result<()> {
                Ok(())
            }
            async fn execute(
                &self,
                step: &Step,
                _ctx: Arc<ExecutionContext>,
                _interpolator: &Interpolator,
                _cancel: CancellationToken,
            ) -> Result<Value> {
                // Let group siblings finish before failing.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(EngineError::executor_failure(&step.id, "exit 1"))
            }
        }

        let registry = Arc::new(ExecutorRegistry::new());
        registry.register(Arc::new(FakeExecutor::instant())).unwrap();
        registry.register(Arc::new(Boom)).unwrap();
        let shutdown = Arc::new(ShutdownController::default());
        let scheduler = GroupScheduler::new(
            &wf,
            registry,
            Arc::new(HookBus::default()),
            shutdown.clone(),
            Arc::new(Interpolator::default()),
            SchedulerConfig::default(),
        )
        .unwrap();
        let dag = WorkflowDag::from_workflow(&wf).unwrap();
        let groups = dag.parallel_groups(&wf, 4).unwrap();
        let ctx = Arc::new(ExecutionContext::new("wf", HashMap::new(), HashMap::new()));

        scheduler
            .run(&wf, &groups, ctx, &HashSet::new())
            .await
            .unwrap();

        let results = scheduler.results();
        assert!(results["a"].success);
        assert_eq!(results["b"].status, StepStatus::Failed);
        assert_eq!(results["c"].status, StepStatus::Skipped);
        assert_eq!(results["c"].skip_reason.as_deref(), Some("dependencies failed"));
        assert_eq!(
            shutdown.reason(),
            Some(ShutdownReason::FatalStep("b".to_string()))
        );
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_going() {
        let mut b = fake_step("b", &[]);
        b.kind = StepKind::Custom("fake".to_string());
        b.continue_on_error = true;
        let wf = workflow(vec![b, fake_step("c", &["b"])]);

        // b fails all its attempts; c depends on b but b continues on error.
        let executor = Arc::new(FakeExecutor::failing_first(100));
        let h = harness(wf, executor, SchedulerConfig::default());

        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &HashSet::new())
            .await
            .unwrap();

        let results = h.scheduler.results();
        assert_eq!(results["b"].status, StepStatus::Failed);
        // Dependent of a failed-but-tolerated step is skipped only when it
        // does not tolerate failures itself; here neither c nor the
        // workflow continues on error, so c is skipped.
        assert_eq!(results["c"].status, StepStatus::Skipped);
        assert!(!h.shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_condition_skip() {
        let mut a = fake_step("a", &[]);
        a.condition = Some("false".to_string());
        let wf = workflow(vec![a, fake_step("b", &[])]);
        let h = harness(wf, Arc::new(FakeExecutor::instant()), SchedulerConfig::default());

        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &HashSet::new())
            .await
            .unwrap();

        let results = h.scheduler.results();
        assert_eq!(results["a"].status, StepStatus::Skipped);
        assert_eq!(
            results["a"].skip_reason.as_deref(),
            Some("condition evaluated falsy")
        );
        assert!(results["b"].success);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let mut a = fake_step("a", &[]);
        a.retry = Some(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 10,
            ..Default::default()
        });
        let wf = workflow(vec![a]);
        let executor = Arc::new(FakeExecutor::failing_first(2));
        let h = harness(wf, executor, SchedulerConfig::default());

        let started = Instant::now();
        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &HashSet::new())
            .await
            .unwrap();

        let results = h.scheduler.results();
        assert!(results["a"].success);
        assert_eq!(results["a"].attempts, 3);
        assert_eq!(h.scheduler.total_retries(), 2);
        // Backoff 10ms then 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(results["a"].execution_time >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_resource_quota_bounds_concurrency() {
        let mut steps = Vec::new();
        for id in ["x", "y", "z"] {
            let mut s = fake_step(id, &[]);
            s.parallel = Some(StepParallel {
                resource: Some("cpu".to_string()),
                ..Default::default()
            });
            steps.push(s);
        }
        let mut wf = workflow(steps);
        wf.parallel = Some(ParallelConfig {
            enabled: true,
            default_max_concurrency: 8,
            resources: HashMap::from([("cpu".to_string(), 2)]),
        });

        let executor = Arc::new(FakeExecutor::slow(Duration::from_millis(60)));
        let executor_ref = executor.clone();
        let h = harness(wf, executor, SchedulerConfig::default());

        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &HashSet::new())
            .await
            .unwrap();

        let results = h.scheduler.results();
        assert!(results.values().all(|r| r.success));
        assert!(executor_ref.gauge.peak() <= 2, "resource quota exceeded");
    }

    #[tokio::test]
    async fn test_group_cap_bounds_concurrency() {
        let steps = (0..6).map(|i| fake_step(&format!("s{i}"), &[])).collect();
        let mut wf = workflow(steps);
        wf.parallel = Some(ParallelConfig {
            enabled: true,
            default_max_concurrency: 2,
            resources: HashMap::new(),
        });

        let executor = Arc::new(FakeExecutor::slow(Duration::from_millis(40)));
        let executor_ref = executor.clone();
        let h = harness(wf, executor, SchedulerConfig::default());

        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &HashSet::new())
            .await
            .unwrap();

        assert!(executor_ref.gauge.peak() <= 2);
        assert!(h.scheduler.results().values().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_parallel_disabled_serializes_group() {
        let steps = (0..3).map(|i| fake_step(&format!("s{i}"), &[])).collect();
        let wf = workflow(steps);
        let executor = Arc::new(FakeExecutor::slow(Duration::from_millis(20)));
        let executor_ref = executor.clone();
        let h = harness(
            wf,
            executor,
            SchedulerConfig {
                parallel_enabled: false,
                ..Default::default()
            },
        );

        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &HashSet::new())
            .await
            .unwrap();

        assert_eq!(executor_ref.gauge.peak(), 1);
    }

    #[tokio::test]
    async fn test_user_cancel_abandons_stubborn_step_after_grace() {
        let wf = workflow(vec![fake_step("stubborn", &[])]);
        let executor = Arc::new(FakeExecutor {
            delay: Duration::from_secs(30),
            ignore_cancel: true,
            ..FakeExecutor::instant()
        });
        let h = harness(
            wf,
            executor,
            SchedulerConfig {
                grace_period: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let shutdown = h.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.shutdown(ShutdownReason::UserCancel("test".to_string()));
        });

        let started = Instant::now();
        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &HashSet::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        let results = h.scheduler.results();
        assert_eq!(results["stubborn"].status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_step_timeout_records_timeout_failure() {
        let mut a = fake_step("a", &[]);
        a.timeout_ms = Some(30);
        let wf = workflow(vec![a]);
        let executor = Arc::new(FakeExecutor::slow(Duration::from_secs(10)));
        let h = harness(
            wf,
            executor,
            SchedulerConfig {
                grace_period: Duration::from_millis(50),
                ..Default::default()
            },
        );

        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &HashSet::new())
            .await
            .unwrap();

        let results = h.scheduler.results();
        assert_eq!(results["a"].status, StepStatus::Failed);
        assert!(results["a"].error.as_ref().unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn test_already_completed_steps_not_redispatched() {
        let wf = workflow(vec![fake_step("a", &[]), fake_step("b", &["a"])]);
        let executor = Arc::new(FakeExecutor::instant());
        let executor_ref = executor.clone();
        let h = harness(wf, executor, SchedulerConfig::default());

        h.scheduler.restore_result(StepResult::completed(
            "a",
            json!({"restored": true}),
            Duration::ZERO,
            1,
            0,
        ));
        let completed = HashSet::from(["a".to_string()]);

        h.scheduler
            .run(&h.workflow, &h.groups, h.ctx.clone(), &completed)
            .await
            .unwrap();

        // Only b actually executed.
        assert_eq!(executor_ref.calls.load(Ordering::SeqCst), 1);
        let results = h.scheduler.results();
        assert!(results["a"].output.as_ref().unwrap()["restored"].as_bool().unwrap());
        assert!(results["b"].success);
    }

    #[tokio::test]
    async fn test_step_events_ordered_per_step() {
        let wf = workflow(vec![fake_step("a", &[]), fake_step("b", &["a"])]);
        let hooks = Arc::new(HookBus::default());
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for kind in [EventKind::StepStart, EventKind::StepComplete, EventKind::StepSkip] {
            let events = events.clone();
            hooks
                .register_fn(
                    crate::hooks::HookRegistration::new(format!("rec-{kind}"), kind),
                    move |event: &HookEvent| {
                        events
                            .lock()
                            .push((event.kind, event.step_id.clone().unwrap_or_default()));
                        Ok(())
                    },
                )
                .unwrap();
        }

        let registry = Arc::new(ExecutorRegistry::new());
        registry.register(Arc::new(FakeExecutor::instant())).unwrap();
        let scheduler = GroupScheduler::new(
            &wf,
            registry,
            hooks,
            Arc::new(ShutdownController::default()),
            Arc::new(Interpolator::default()),
            SchedulerConfig::default(),
        )
        .unwrap();
        let dag = WorkflowDag::from_workflow(&wf).unwrap();
        let groups = dag.parallel_groups(&wf, 4).unwrap();
        let ctx = Arc::new(ExecutionContext::new("wf", HashMap::new(), HashMap::new()));

        scheduler.run(&wf, &groups, ctx, &HashSet::new()).await.unwrap();

        let events = events.lock();
        for id in ["a", "b"] {
            let start = events
                .iter()
                .position(|(k, s)| *k == EventKind::StepStart && s == id)
                .unwrap();
            let terminal: Vec<usize> = events
                .iter()
                .enumerate()
                .filter(|(_, (k, s))| *k != EventKind::StepStart && s == id)
                .map(|(i, _)| i)
                .collect();
            assert_eq!(terminal.len(), 1, "exactly one terminal event for {id}");
            assert!(start < terminal[0], "StepStart precedes terminal for {id}");
        }
    }
}

// Copyright (c) 2025 Flowrun Team
// SPDX-License-Identifier: Apache-2.0

//! Glue between the engine and the snapshot store.
//!
//! Builds [`WorkflowSnapshot`]s from live execution state and drives the
//! checkpoint cadence: after the workflow enters `Running`, after every
//! N completed steps, on every failure, and at terminal status.

use crate::context::ExecutionContext;
use crate::runner::WorkflowStatus;
use crate::scheduler::{CheckpointSink, GroupScheduler, StepResult, StepStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowrun_state::{
    SnapshotStatus, StateStoreRef, StepRecordStatus, StepState, WorkflowSnapshot,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

pub(crate) fn to_snapshot_status(status: WorkflowStatus) -> SnapshotStatus {
    match status {
        WorkflowStatus::Pending => SnapshotStatus::Pending,
        WorkflowStatus::Running => SnapshotStatus::Running,
        WorkflowStatus::Paused => SnapshotStatus::Paused,
        WorkflowStatus::Completed => SnapshotStatus::Completed,
        WorkflowStatus::Failed => SnapshotStatus::Failed,
        WorkflowStatus::Cancelled => SnapshotStatus::Cancelled,
    }
}

pub(crate) fn to_record_status(status: StepStatus) -> StepRecordStatus {
    match status {
        StepStatus::Pending => StepRecordStatus::Pending,
        StepStatus::Running => StepRecordStatus::Running,
        StepStatus::Completed => StepRecordStatus::Completed,
        StepStatus::Failed => StepRecordStatus::Failed,
        StepStatus::Skipped => StepRecordStatus::Skipped,
        StepStatus::Cancelled => StepRecordStatus::Cancelled,
    }
}

/// Owns everything needed to write a consistent snapshot mid-run.
pub(crate) struct Checkpointer {
    store: StateStoreRef,
    ctx: Arc<ExecutionContext>,
    definition: Value,
    execution_order: Vec<String>,
    scheduler: GroupScheduler,
    status: Arc<RwLock<WorkflowStatus>>,
    checkpoint_interval: u64,
    completions: AtomicU64,
    version: AtomicU64,
    created_at: DateTime<Utc>,
    paused_duration_ms: u64,
}

impl Checkpointer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: StateStoreRef,
        ctx: Arc<ExecutionContext>,
        definition: Value,
        execution_order: Vec<String>,
        scheduler: GroupScheduler,
        status: Arc<RwLock<WorkflowStatus>>,
        checkpoint_interval: u64,
        base_version: u64,
        paused_duration_ms: u64,
    ) -> Self {
        Self {
            store,
            ctx,
            definition,
            execution_order,
            scheduler,
            status,
            checkpoint_interval: checkpoint_interval.max(1),
            completions: AtomicU64::new(0),
            version: AtomicU64::new(base_version),
            created_at: Utc::now(),
            paused_duration_ms,
        }
    }

    fn build_snapshot(&self) -> WorkflowSnapshot {
        let results = self.scheduler.results();
        let statuses = self.scheduler.statuses();

        let mut step_states = std::collections::HashMap::with_capacity(statuses.len());
        for (id, status) in &statuses {
            let result = results.get(id);
            step_states.insert(
                id.clone(),
                StepState {
                    status: to_record_status(*status),
                    result: result.and_then(|r| serde_json::to_value(r).ok()),
                    attempts: result.map(|r| r.attempts).unwrap_or(0),
                },
            );
        }

        // First non-completed position in the execution order.
        let current_index = self
            .execution_order
            .iter()
            .take_while(|id| {
                statuses
                    .get(id.as_str())
                    .map(|s| matches!(s, StepStatus::Completed))
                    .unwrap_or(false)
            })
            .count();

        let mut snapshot = WorkflowSnapshot::new(
            self.ctx.workflow_id(),
            self.definition.clone(),
            serde_json::to_value(self.ctx.create_snapshot()).unwrap_or(Value::Null),
            self.execution_order.clone(),
        );
        snapshot.step_states = step_states;
        snapshot.current_index = current_index;
        snapshot.status = to_snapshot_status(*self.status.read());
        snapshot.created_at = self.created_at;
        snapshot.updated_at = Utc::now();
        snapshot.paused_duration_ms = self.paused_duration_ms;
        snapshot.version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        snapshot
    }

    /// Writes a snapshot now. Checkpoint failures are logged, never
    /// fatal to the workflow.
    pub(crate) async fn save(&self) {
        let snapshot = self.build_snapshot();
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(
                workflow_id = %snapshot.workflow_id,
                error = %e,
                "checkpoint write failed"
            );
        }
    }
}

#[async_trait]
impl CheckpointSink for Checkpointer {
    async fn on_step_terminal(&self, _step_id: &str, status: StepStatus) {
        let due = match status {
            StepStatus::Completed => {
                let n = self.completions.fetch_add(1, Ordering::SeqCst) + 1;
                n % self.checkpoint_interval == 0
            }
            StepStatus::Failed => true,
            _ => false,
        };
        if due {
            self.save().await;
        }
    }
}

/// Rehydrates a completed step's result from its snapshot record.
pub(crate) fn restore_step_result(id: &str, state: &StepState) -> Option<StepResult> {
    let value = state.result.as_ref()?;
    match serde_json::from_value::<StepResult>(value.clone()) {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(step_id = %id, error = %e, "discarding unreadable step result");
            None
        }
    }
}

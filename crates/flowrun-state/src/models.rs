use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Workflow status as recorded in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SnapshotStatus {
    /// Whether a workflow in this state may be resumed. A snapshot left
    /// `Running` means the process died mid-run; it resumes too.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused | Self::Failed | Self::Running)
    }

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

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SnapshotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown snapshot status '{other}'")),
        }
    }
}

/// Per-step state recorded in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRecordStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepRecordStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Snapshot entry for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepRecordStatus,

    /// Serialized step result, present for terminal steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default)]
    pub attempts: u32,
}

/// A durable snapshot of one workflow execution.
///
/// The definition and context are stored as opaque JSON so this crate
/// stays independent of the engine's concrete types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub definition: Value,
    pub context: Value,
    pub execution_order: Vec<String>,
    pub step_states: HashMap<String, StepState>,
    pub current_index: usize,
    pub status: SnapshotStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub paused_duration_ms: u64,

    /// Monotonic write counter used for compare-and-set.
    #[serde(default)]
    pub version: u64,
}

impl WorkflowSnapshot {
    pub fn new(
        workflow_id: impl Into<String>,
        definition: Value,
        context: Value,
        execution_order: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            definition,
            context,
            execution_order,
            step_states: HashMap::new(),
            current_index: 0,
            status: SnapshotStatus::Pending,
            created_at: now,
            updated_at: now,
            paused_duration_ms: 0,
            version: 0,
        }
    }

    /// Ids of steps recorded as completed, in execution order.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .filter(|id| {
                self.step_states
                    .get(id.as_str())
                    .map(|s| s.status.is_completed())
                    .unwrap_or(false)
            })
            .map(|id| id.as_str())
            .collect()
    }

    /// Internal-consistency check applied before a resume. A snapshot is
    /// consistent when the index is within bounds and every completed
    /// step carries a result.
    pub fn validate(&self) -> Result<(), String> {
        if self.current_index > self.execution_order.len() {
            return Err(format!(
                "current index {} exceeds execution order length {}",
                self.current_index,
                self.execution_order.len()
            ));
        }
        for (id, state) in &self.step_states {
            if !self.execution_order.iter().any(|s| s == id) {
                return Err(format!("step state '{id}' not in execution order"));
            }
            if state.status.is_completed() && state.result.is_none() {
                return Err(format!("completed step '{id}' has no result"));
            }
        }
        Ok(())
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub workflow_id: String,
    pub status: SnapshotStatus,
    pub updated_at: DateTime<Utc>,
}

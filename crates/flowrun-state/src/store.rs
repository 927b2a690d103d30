use crate::models::{SnapshotSummary, WorkflowSnapshot};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No snapshot stored for the workflow.
    #[error("no snapshot for workflow '{0}'")]
    NotFound(String),

    /// Compare-and-set failure: a newer snapshot is already stored.
    #[error("stale snapshot for workflow '{workflow_id}': stored version {found}, write carries {attempted}")]
    Conflict {
        workflow_id: String,
        found: u64,
        attempted: u64,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Stored snapshot failed its consistency check.
    #[error("corrupt snapshot for workflow '{workflow_id}': {reason}")]
    Corrupt { workflow_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Keyed blob store for workflow snapshots.
///
/// Writes are atomic per key: a reader never observes a torn snapshot.
/// Version numbers are compare-and-set; saving a snapshot whose version
/// is not greater than the stored one fails with [`StateError::Conflict`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persists a snapshot.
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()>;

    /// Loads the snapshot for a workflow, if any.
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>>;

    /// Deletes a snapshot. Returns whether one existed.
    async fn delete(&self, workflow_id: &str) -> Result<bool>;

    /// Lists stored snapshots.
    async fn list(&self) -> Result<Vec<SnapshotSummary>>;

    /// Removes snapshots older than the TTL. Returns how many were
    /// removed.
    async fn cleanup(&self, ttl: Duration) -> Result<u64>;

    /// Checks that the backend is usable.
    async fn health_check(&self) -> Result<()>;
}

/// Type alias for Arc-wrapped stores.
pub type StateStoreRef = Arc<dyn StateStore>;

/// Shared compare-and-set check used by the backends.
pub(crate) fn check_version(
    workflow_id: &str,
    stored: Option<u64>,
    attempted: u64,
) -> Result<()> {
    if let Some(found) = stored {
        if attempted <= found {
            return Err(StateError::Conflict {
                workflow_id: workflow_id.to_string(),
                found,
                attempted,
            });
        }
    }
    Ok(())
}

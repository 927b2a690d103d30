use crate::models::{SnapshotSummary, WorkflowSnapshot};
use crate::store::{check_version, Result, StateStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// In-memory snapshot store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, WorkflowSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let mut entries = self.entries.write();
        check_version(
            &snapshot.workflow_id,
            entries.get(&snapshot.workflow_id).map(|s| s.version),
            snapshot.version,
        )?;
        entries.insert(snapshot.workflow_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>> {
        Ok(self.entries.read().get(workflow_id).cloned())
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool> {
        Ok(self.entries.write().remove(workflow_id).is_some())
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>> {
        let mut summaries: Vec<SnapshotSummary> = self
            .entries
            .read()
            .values()
            .map(|s| SnapshotSummary {
                workflow_id: s.workflow_id.clone(),
                status: s.status,
                updated_at: s.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn cleanup(&self, ttl: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| crate::store::StateError::Configuration(e.to_string()))?;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, s| s.updated_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

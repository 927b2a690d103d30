use crate::models::{SnapshotSummary, WorkflowSnapshot};
use crate::store::{check_version, Result, StateError, StateStore};
use async_trait::async_trait;
use chrono::Utc;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Filesystem-backed snapshot store.
///
/// Layout: `<root>/<workflowId>.json`, with the previous generation kept
/// as `<workflowId>.json.bak` when backups are enabled. Writes go to a
/// temp file, are fsynced, and land via rename so a crash never leaves a
/// torn snapshot.
pub struct FileStateStore {
    root: PathBuf,
    backup: bool,
}

impl FileStateStore {
    /// Creates the store, creating the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            backup: false,
        })
    }

    /// Keeps the previous snapshot as `<id>.json.bak` on every write.
    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, workflow_id: &str) -> Result<PathBuf> {
        if workflow_id.is_empty()
            || workflow_id.contains('/')
            || workflow_id.contains('\\')
            || workflow_id.contains("..")
        {
            return Err(StateError::Configuration(format!(
                "workflow id '{workflow_id}' is not a valid storage key"
            )));
        }
        Ok(self.root.join(format!("{workflow_id}.json")))
    }

    fn read_snapshot(path: &Path) -> Result<Option<WorkflowSnapshot>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.workflow_id)?;
        let existing = Self::read_snapshot(&path)?;
        check_version(
            &snapshot.workflow_id,
            existing.as_ref().map(|s| s.version),
            snapshot.version,
        )?;

        // Atomic write: temp file + fsync + rename.
        let tmp_path = self.root.join(format!("{}.json.tmp", snapshot.workflow_id));
        let payload = serde_json::to_vec_pretty(snapshot)?;
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&payload)?;
            tmp.sync_all()?;
        }

        if self.backup && path.exists() {
            let bak_path = self.root.join(format!("{}.json.bak", snapshot.workflow_id));
            fs::copy(&path, &bak_path)?;
        }

        fs::rename(&tmp_path, &path)?;
        debug!(
            workflow_id = %snapshot.workflow_id,
            version = snapshot.version,
            status = %snapshot.status,
            "snapshot saved"
        );
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>> {
        let path = self.snapshot_path(workflow_id)?;
        Self::read_snapshot(&path)
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool> {
        let path = self.snapshot_path(workflow_id)?;
        let existed = path.exists();
        if existed {
            fs::remove_file(&path)?;
        }
        let bak = self.root.join(format!("{workflow_id}.json.bak"));
        if bak.exists() {
            let _ = fs::remove_file(bak);
        }
        Ok(existed)
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_snapshot(&path) {
                Ok(Some(snapshot)) => summaries.push(SnapshotSummary {
                    workflow_id: snapshot.workflow_id,
                    status: snapshot.status,
                    updated_at: snapshot.updated_at,
                }),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                }
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn cleanup(&self, ttl: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| StateError::Configuration(e.to_string()))?;
        let mut removed = 0;
        for summary in self.list().await? {
            if summary.updated_at < cutoff {
                if self.delete(&summary.workflow_id).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        let metadata = fs::metadata(&self.root)?;
        if !metadata.is_dir() {
            return Err(StateError::Configuration(format!(
                "state root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}

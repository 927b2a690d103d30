use crate::store::{Result, StateStoreRef};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

/// Prunes expired snapshots on a schedule.
pub struct RetentionManager {
    store: StateStoreRef,
    ttl: Duration,
}

impl RetentionManager {
    /// Create a new retention manager
    pub fn new(store: StateStoreRef, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Run cleanup of expired snapshots.
    /// Returns the number of snapshots removed.
    pub async fn cleanup(&self) -> Result<u64> {
        tracing::info!(ttl_secs = self.ttl.as_secs(), "running snapshot cleanup");
        let removed = self.store.cleanup(self.ttl).await?;
        tracing::info!(removed_count = removed, "snapshot cleanup completed");
        Ok(removed)
    }

    /// Start background cleanup task
    /// Returns a handle that can be used to cancel the task
    pub fn start_background_cleanup(
        self: Arc<Self>,
        interval: time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = time::interval(interval);

            loop {
                interval_timer.tick().await;

                match self.cleanup().await {
                    Ok(removed) => {
                        tracing::debug!(removed_count = removed, "background cleanup completed");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "background cleanup failed");
                    }
                }
            }
        })
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

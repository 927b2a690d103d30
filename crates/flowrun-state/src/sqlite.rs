use crate::models::{SnapshotStatus, SnapshotSummary, WorkflowSnapshot};
use crate::store::{check_version, Result, StateError, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS workflow_snapshots (
    workflow_id   TEXT PRIMARY KEY,
    status        TEXT NOT NULL,
    version       INTEGER NOT NULL,
    snapshot      TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
)";

/// SQLite-backed snapshot store. Compare-and-set runs inside a
/// transaction, so concurrent writers cannot interleave stale snapshots.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Opens (creating if missing) a database file.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        sqlx::query(SCHEMA).execute(&pool).await.map_err(db_err)?;
        Ok(Self { pool })
    }
}

fn db_err(e: sqlx::Error) -> StateError {
    StateError::Database(e.to_string())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let stored: Option<u64> =
            sqlx::query("SELECT version FROM workflow_snapshots WHERE workflow_id = ?1")
                .bind(&snapshot.workflow_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .map(|row| row.try_get::<i64, _>("version").map(|v| v as u64))
                .transpose()
                .map_err(db_err)?;
        check_version(&snapshot.workflow_id, stored, snapshot.version)?;

        sqlx::query(
            "INSERT INTO workflow_snapshots (workflow_id, status, version, snapshot, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(workflow_id) DO UPDATE SET
                 status = excluded.status,
                 version = excluded.version,
                 snapshot = excluded.snapshot,
                 updated_at_ms = excluded.updated_at_ms",
        )
        .bind(&snapshot.workflow_id)
        .bind(snapshot.status.as_str())
        .bind(snapshot.version as i64)
        .bind(serde_json::to_string(snapshot)?)
        .bind(snapshot.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(workflow_id = %snapshot.workflow_id, version = snapshot.version, "snapshot saved");
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>> {
        let row = sqlx::query("SELECT snapshot FROM workflow_snapshots WHERE workflow_id = ?1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let payload: String = row.try_get("snapshot").map_err(db_err)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, workflow_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflow_snapshots WHERE workflow_id = ?1")
            .bind(workflow_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>> {
        let rows = sqlx::query(
            "SELECT workflow_id, status, updated_at_ms
             FROM workflow_snapshots
             ORDER BY updated_at_ms DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let workflow_id: String = row.try_get("workflow_id").map_err(db_err)?;
            let status: String = row.try_get("status").map_err(db_err)?;
            let updated_at_ms: i64 = row.try_get("updated_at_ms").map_err(db_err)?;
            let status: SnapshotStatus = status
                .parse()
                .map_err(|reason| StateError::Corrupt {
                    workflow_id: workflow_id.clone(),
                    reason,
                })?;
            let updated_at = DateTime::<Utc>::from_timestamp_millis(updated_at_ms)
                .unwrap_or_else(Utc::now);
            summaries.push(SnapshotSummary {
                workflow_id,
                status,
                updated_at,
            });
        }
        Ok(summaries)
    }

    async fn cleanup(&self, ttl: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|e| StateError::Configuration(e.to_string()))?;
        let result = sqlx::query("DELETE FROM workflow_snapshots WHERE updated_at_ms < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

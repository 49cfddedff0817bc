//! `good_job_processes`: the worker registry (spec §3) used to detect a
//! crashed lock owner for orphan recovery (spec §4.9).

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: Value,
    pub lock_type: Option<i16>,
}

#[derive(Clone)]
pub struct ProcessesRepo {
    pool: PgPool,
}

impl ProcessesRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Registers a worker process on startup. The returned id is what
    /// every job this process claims stores in `locked_by_id`.
    pub async fn register(&self, state: Value) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO good_job_processes (id, state) VALUES ($1, $2)")
            .bind(id)
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    /// Heartbeat: bump `updated_at` so the cleanup loop's staleness check
    /// (spec §4.9) doesn't treat a live, merely-idle process as dead.
    pub async fn heartbeat(&self, id: Uuid, state: Value) -> anyhow::Result<()> {
        sqlx::query("UPDATE good_job_processes SET updated_at = now(), state = $2 WHERE id = $1")
            .bind(id)
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clean shutdown: removes the row so jobs it held are immediately
    /// eligible for orphan recovery rather than waiting for a staleness
    /// threshold.
    pub async fn deregister(&self, id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM good_job_processes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes processes whose heartbeat is older than `stale_after`, so a
    /// process that died without deregistering (e.g. SIGKILL) doesn't
    /// linger forever and mask real orphans. Returns the removed ids so a
    /// caller can log which processes were reaped.
    pub async fn reap_stale(&self, stale_after_seconds: i64) -> anyhow::Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            DELETE FROM good_job_processes
            WHERE updated_at < now() - ($1::bigint * interval '1 second')
            RETURNING id
            "#,
        )
        .bind(stale_after_seconds)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

//! `good_job_executions`: the append-only attempt log (spec §3). One row
//! per attempt, keyed by `active_job_id`; rows are never mutated after
//! insert except to stamp `finished_at`/`error` once the attempt completes.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Execution {
    pub id: Uuid,
    pub active_job_id: Uuid,
    pub job_class: Option<String>,
    pub queue_name: Option<String>,
    pub serialized_params: Option<Value>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_event: Option<i16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ExecutionsRepo {
    pool: PgPool,
}

impl ExecutionsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a new attempt row. Called by the performer right before
    /// invoking the handler (spec §4.7 step 5).
    #[tracing::instrument(skip(self, serialized_params), fields(active_job_id = %active_job_id))]
    pub async fn start(
        &self,
        active_job_id: Uuid,
        job_class: &str,
        queue_name: &str,
        serialized_params: &Value,
    ) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO good_job_executions
                (id, active_job_id, job_class, queue_name, serialized_params, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, now())
            "#,
        )
        .bind(id)
        .bind(active_job_id)
        .bind(job_class)
        .bind(queue_name)
        .bind(serialized_params)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn finish(&self, id: Uuid, error: Option<&str>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE good_job_executions
            SET finished_at = now(), error = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_active_job(&self, active_job_id: Uuid) -> anyhow::Result<Vec<Execution>> {
        let rows = sqlx::query_as::<_, Execution>(
            r#"
            SELECT * FROM good_job_executions
            WHERE active_job_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(active_job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

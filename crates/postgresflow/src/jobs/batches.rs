//! `good_job_batches` (spec §3, expanded in SPEC_FULL §3 "Supplemented:
//! Batch callbacks"): a set of member jobs that fires a callback job once
//! every member has finished. Implemented as ordinary enqueues triggered
//! when a batch's outstanding-member count reaches zero — not a new
//! execution primitive, per the expanded spec.

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BatchRow {
    pub id: Uuid,
    pub description: Option<String>,
    pub serialized_properties: Option<Value>,
    pub on_finish: Option<String>,
    pub on_success: Option<String>,
    pub on_discard: Option<String>,
    pub callback_queue_name: Option<String>,
    pub callback_priority: Option<i32>,
    pub enqueued_at: Option<chrono::DateTime<Utc>>,
    pub discarded_at: Option<chrono::DateTime<Utc>>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Clone)]
pub struct BatchesRepo {
    pool: PgPool,
}

/// Which callback(s) a just-completed batch should fire, resolved by
/// [`BatchesRepo::member_finished`].
#[derive(Debug, Clone, Default)]
pub struct DueCallbacks {
    pub on_finish: Option<String>,
    pub on_success: Option<String>,
    pub on_discard: Option<String>,
    pub queue_name: String,
    pub priority: Option<i32>,
}

impl BatchesRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        description: Option<&str>,
        serialized_properties: Option<Value>,
        on_finish: Option<&str>,
        on_success: Option<&str>,
        on_discard: Option<&str>,
        callback_queue_name: &str,
        callback_priority: Option<i32>,
    ) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO good_job_batches (
                id, description, serialized_properties,
                on_finish, on_success, on_discard,
                callback_queue_name, callback_priority
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(description)
        .bind(serialized_properties)
        .bind(on_finish)
        .bind(on_success)
        .bind(on_discard)
        .bind(callback_queue_name)
        .bind(callback_priority)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<BatchRow>> {
        let row = sqlx::query_as::<_, BatchRow>("SELECT * FROM good_job_batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Count of member jobs (by `batch_id`) that are not yet finished.
    pub async fn outstanding_members(&self, batch_id: Uuid) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM good_jobs WHERE batch_id = $1 AND finished_at IS NULL",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn any_member_discarded(&self, batch_id: Uuid) -> anyhow::Result<bool> {
        let discarded: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM good_jobs
                WHERE batch_id = $1 AND finished_at IS NOT NULL AND error IS NOT NULL
            )
            "#,
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(discarded)
    }

    /// Called by the performer every time a member job finishes (spec
    /// SPEC_FULL §3). Returns the callbacks due to fire, or `None` if
    /// members remain outstanding or the batch already finished (so a
    /// caller never double-fires `on_finish`).
    pub async fn member_finished(&self, batch_id: Uuid) -> anyhow::Result<Option<DueCallbacks>> {
        let batch = match self.get(batch_id).await? {
            Some(b) => b,
            None => return Ok(None),
        };
        if batch.finished_at.is_some() {
            return Ok(None);
        }
        if self.outstanding_members(batch_id).await? > 0 {
            return Ok(None);
        }

        let discarded = self.any_member_discarded(batch_id).await?;
        sqlx::query(
            r#"
            UPDATE good_job_batches
            SET finished_at = now(),
                discarded_at = CASE WHEN $2 THEN now() ELSE discarded_at END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .bind(discarded)
        .execute(&self.pool)
        .await?;

        Ok(Some(DueCallbacks {
            on_finish: batch.on_finish,
            on_success: if discarded { None } else { batch.on_success },
            on_discard: if discarded { batch.on_discard } else { None },
            queue_name: batch.callback_queue_name.unwrap_or_else(|| "default".to_string()),
            priority: batch.callback_priority,
        }))
    }
}

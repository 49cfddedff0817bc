//! Storage Adapter's `good_jobs` surface (spec §4.1): typed CRUD, the
//! named scopes, and the advisory-locked claim sequence the performer
//! drives. Queries use the runtime-checked `query_as`/`query_scalar` API
//! rather than the `sqlx::query!` macro family — this workspace ships no
//! `.sqlx` offline cache for the macros to check against at compile time.

use crate::db::AdvisoryLock;
use crate::jobs::model::{Job, NewJob};
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
    notifier_channel: String,
    notify_after_transaction_commit: bool,
}

/// Ordering a dequeue query should use, per spec §4.1. Queue-ranked
/// ordering takes precedence over plain priority ordering when a worker
/// configures a prioritized queue list (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct DequeueOrdering {
    /// `queue_name -> rank`, ascending. Queues absent from the map sort
    /// after every ranked queue, in queue_name order.
    pub queue_ranks: Option<std::collections::HashMap<String, i32>>,
}

impl JobsRepo {
    /// Defaults the NOTIFY channel to `"good_job"` and publishes inside the
    /// same transaction as the insert (`enqueue_after_transaction_commit =
    /// false`, spec §4.4); [`with_notify`](Self::with_notify) overrides
    /// both from `Config`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            notifier_channel: "good_job".to_string(),
            notify_after_transaction_commit: false,
        }
    }

    pub fn with_notify(mut self, channel: impl Into<String>, after_transaction_commit: bool) -> Self {
        self.notifier_channel = channel.into();
        self.notify_after_transaction_commit = after_transaction_commit;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Inserts the row and publishes the Notifier's `NOTIFY` (spec §4.4)
    /// on a connection checked out just for this call.
    #[tracing::instrument(skip(self, job), fields(job_class = %job.job_class, queue = %job.queue_name))]
    pub async fn enqueue(&self, job: NewJob) -> anyhow::Result<Job> {
        let mut conn = self.pool.acquire().await?;
        self.enqueue_on_connection(&mut conn, job).await
    }

    /// Same insert-then-notify as [`enqueue`](Self::enqueue), but run on a
    /// connection the caller already holds — used by
    /// `ConcurrencyGuard::enqueue_guarded` so the enqueue-time count and the
    /// insert happen under the one advisory-locked connection (spec §4.6),
    /// rather than the count being checked on one connection and the
    /// insert racing in on another.
    pub(crate) async fn enqueue_on_connection(
        &self,
        conn: &mut PoolConnection<Postgres>,
        job: NewJob,
    ) -> anyhow::Result<Job> {
        let id = Uuid::new_v4();
        let mut tx = conn.begin().await?;
        let row = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO good_jobs (
                id, active_job_id, job_class, queue_name, priority, serialized_params,
                scheduled_at, concurrency_key, cron_key, cron_at,
                batch_id, batch_callback_id, labels
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(job.active_job_id)
        .bind(&job.job_class)
        .bind(&job.queue_name)
        .bind(job.priority)
        .bind(&job.serialized_params)
        .bind(job.scheduled_at)
        .bind(&job.concurrency_key)
        .bind(&job.cron_key)
        .bind(job.cron_at)
        .bind(job.batch_id)
        .bind(job.batch_callback_id)
        .bind(job.labels.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        if !self.notify_after_transaction_commit {
            self.notify(&mut *tx, &row).await?;
        }

        tx.commit().await?;

        if self.notify_after_transaction_commit {
            if let Err(err) = self.notify(&mut **conn, &row).await {
                tracing::warn!(
                    target: "pgflow::jobs",
                    job_id = %row.id,
                    error = %err,
                    "post-commit NOTIFY failed; the row is still enqueued, pollers will pick it up"
                );
            }
        }

        Ok(row)
    }

    async fn notify<'e, E>(&self, executor: E, row: &Job) -> anyhow::Result<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let payload = crate::notifier::job_available_payload(&row.queue_name, row.scheduled_at);
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.notifier_channel)
            .bind(payload.to_string())
            .execute(executor)
            .await?;
        Ok(())
    }

    /// `(cron_key, cron_at)` enqueue used by the cron loop (spec §4.8). The
    /// partial unique index makes a duplicate tick a no-op rather than an
    /// error — callers should treat a unique-violation here as "already
    /// materialized by a peer process", not a failure.
    pub async fn enqueue_cron_tick(&self, job: NewJob) -> anyhow::Result<Option<Job>> {
        match self.enqueue(job).await {
            Ok(row) => Ok(Some(row)),
            Err(err) => {
                if is_unique_violation(&err) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads / named scopes (spec §4.1)
    // ------------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, Job>("SELECT * FROM good_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn unfinished_count_for_concurrency_key(&self, key: &str) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM good_jobs WHERE concurrency_key = $1 AND finished_at IS NULL",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Running jobs sharing `key`, excluding `excluding_id` — the
    /// perform-time recount in spec §4.6.
    pub async fn running_count_for_concurrency_key(
        &self,
        key: &str,
        excluding_id: Uuid,
    ) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM good_jobs
            WHERE concurrency_key = $1
              AND id != $2
              AND finished_at IS NULL
              AND performed_at IS NOT NULL
            "#,
        )
        .bind(key)
        .bind(excluding_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Unfinished, unlocked, due candidates ordered per spec §4.1/§4.5.
    /// `queues` is the parsed include/exclude/ordered set from the
    /// Poller's queue filter (empty = all queues).
    pub async fn fetch_candidates(
        &self,
        queues: Option<&[String]>,
        ordering: &DequeueOrdering,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>> {
        let queue_filter: Option<Vec<String>> = queues.map(|q| q.to_vec());

        let rows = if let Some(ranks) = &ordering.queue_ranks {
            let (names, ranked): (Vec<String>, Vec<i32>) = ranks
                .iter()
                .map(|(name, rank)| (name.clone(), *rank))
                .unzip();
            sqlx::query_as::<_, Job>(
                r#"
                SELECT j.* FROM good_jobs j
                LEFT JOIN unnest($1::text[], $2::int4[]) AS r(queue_name, rank)
                    ON r.queue_name = j.queue_name
                WHERE j.finished_at IS NULL
                  AND j.locked_by_id IS NULL
                  AND (j.scheduled_at IS NULL OR j.scheduled_at <= now())
                  AND ($3::text[] IS NULL OR j.queue_name = ANY($3))
                ORDER BY COALESCE(r.rank, 2147483647) ASC,
                         j.priority ASC NULLS LAST,
                         j.created_at ASC
                LIMIT $4
                "#,
            )
            .bind(&names)
            .bind(&ranked)
            .bind(queue_filter.as_deref())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, Job>(
                r#"
                SELECT * FROM good_jobs
                WHERE finished_at IS NULL
                  AND locked_by_id IS NULL
                  AND (scheduled_at IS NULL OR scheduled_at <= now())
                  AND ($1::text[] IS NULL OR queue_name = ANY($1))
                ORDER BY priority ASC NULLS LAST, created_at ASC
                LIMIT $2
                "#,
            )
            .bind(queue_filter.as_deref())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Claim / state transitions (spec §4.7)
    // ------------------------------------------------------------------

    /// Marks a row running under its advisory lock. Does *not* touch
    /// `executions_count` — that increments exactly once per attempt when
    /// the outcome is recorded (spec §8), and a snoozed outcome must leave
    /// it untouched entirely. Returns `false` (no-op) if another process
    /// already finished or claimed it between candidate selection and
    /// this call — the caller must re-check before dispatching.
    pub async fn mark_running(
        &self,
        lock: &mut AdvisoryLock,
        job_id: Uuid,
        locked_by_id: Uuid,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE good_jobs
            SET performed_at = now(),
                locked_by_id = $2,
                locked_at = now(),
                updated_at = now()
            WHERE id = $1
              AND finished_at IS NULL
              AND performed_at IS NULL
            "#,
        )
        .bind(job_id)
        .bind(locked_by_id)
        .execute(lock.connection())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_succeeded(&self, job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE good_jobs
            SET finished_at = now(), error = NULL, executions_count = executions_count + 1, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_discarded(&self, job_id: Uuid, error: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE good_jobs
            SET finished_at = now(), error = $2, executions_count = executions_count + 1, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_cancelled(&self, job_id: Uuid) -> anyhow::Result<()> {
        self.mark_discarded(job_id, crate::jobs::model::CANCELLED_ERROR)
            .await
    }

    /// Schedules a retry: clears `finished_at`/lock fields, sets a future
    /// `scheduled_at`, and bumps `executions_count` by exactly one (spec
    /// §8's "retries increment executions_count by exactly 1" property).
    pub async fn schedule_retry(
        &self,
        job_id: Uuid,
        next_scheduled_at: DateTime<Utc>,
        error: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE good_jobs
            SET finished_at = NULL,
                performed_at = NULL,
                scheduled_at = $2,
                error = $3,
                executions_count = executions_count + 1,
                locked_by_id = NULL,
                locked_at = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(next_scheduled_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn snooze(&self, job_id: Uuid, until: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE good_jobs
            SET scheduled_at = $2,
                performed_at = NULL,
                locked_by_id = NULL,
                locked_at = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Releases the row-level lock fields without finishing the job —
    /// used when a perform-time concurrency check rejects the candidate
    /// (spec §4.6) or the claim otherwise has to be abandoned.
    pub async fn release_without_finishing(&self, job_id: Uuid) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE good_jobs
            SET performed_at = NULL, locked_by_id = NULL, locked_at = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert-new-row retry variant: inserts a fresh job row back-linked
    /// via `retried_good_job_id` on the prior attempt, rather than
    /// mutating the existing row in place. Not used by the default
    /// in-place retry path (spec §4.7) but kept for handlers that want an
    /// immutable history of attempts as separate rows.
    pub async fn retry_as_new_row(&self, job_id: Uuid, next_scheduled_at: DateTime<Utc>) -> anyhow::Result<Job> {
        let mut tx = self.pool.begin().await?;
        let src = sqlx::query_as::<_, Job>("SELECT * FROM good_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

        let new_id = Uuid::new_v4();
        let new_row = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO good_jobs (
                id, active_job_id, job_class, queue_name, priority, serialized_params,
                scheduled_at, concurrency_key, cron_key, cron_at,
                batch_id, batch_callback_id, labels
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, NULL, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(new_id)
        .bind(src.active_job_id)
        .bind(&src.job_class)
        .bind(&src.queue_name)
        .bind(src.priority)
        .bind(&src.serialized_params)
        .bind(next_scheduled_at)
        .bind(&src.concurrency_key)
        .bind(src.batch_id)
        .bind(src.batch_callback_id)
        .bind(src.labels.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE good_jobs SET retried_good_job_id = $2, updated_at = now() WHERE id = $1")
            .bind(job_id)
            .bind(new_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(new_row)
    }

    // ------------------------------------------------------------------
    // Cleanup (spec §4.9)
    // ------------------------------------------------------------------

    /// Rows locked by a process id no longer present in
    /// `good_job_processes`, and not finished. Recovery clears the lock
    /// fields so the row becomes available again.
    pub async fn recover_orphaned_locks(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE good_jobs
            SET locked_by_id = NULL, locked_at = NULL, performed_at = NULL, updated_at = now()
            WHERE finished_at IS NULL
              AND locked_by_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM good_job_processes p WHERE p.id = good_jobs.locked_by_id
              )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_finished_before(
        &self,
        cutoff: DateTime<Utc>,
        include_discarded: bool,
        batch: i64,
    ) -> anyhow::Result<u64> {
        let result = if include_discarded {
            sqlx::query(
                r#"
                DELETE FROM good_jobs
                WHERE id IN (
                    SELECT id FROM good_jobs
                    WHERE finished_at IS NOT NULL AND finished_at < $1
                    ORDER BY finished_at ASC
                    LIMIT $2
                )
                "#,
            )
            .bind(cutoff)
            .bind(batch)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                DELETE FROM good_jobs
                WHERE id IN (
                    SELECT id FROM good_jobs
                    WHERE finished_at IS NOT NULL AND finished_at < $1 AND error IS NULL
                    ORDER BY finished_at ASC
                    LIMIT $2
                )
                "#,
            )
            .bind(cutoff)
            .bind(batch)
            .execute(&self.pool)
            .await?
        };
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Admin / inspection listing
    // ------------------------------------------------------------------

    pub async fn list(
        &self,
        queue_name: Option<&str>,
        limit: i64,
    ) -> anyhow::Result<Vec<Job>> {
        let limit = limit.clamp(1, 500);
        let rows = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM good_jobs
            WHERE ($1::text IS NULL OR queue_name = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(queue_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

pub(crate) fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|e| e.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeue_ordering_defaults_to_plain_priority() {
        let ordering = DequeueOrdering::default();
        assert!(ordering.queue_ranks.is_none());
    }
}

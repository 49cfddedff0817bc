//! Per-queue metrics snapshot (SPEC_FULL ambient stack §6.3): depth plus a
//! 60-second window over `good_job_executions`, exposed by the admin API.
//! Not the wire-level "metrics" non-goal from spec §1 (that refers to a
//! cross-process metrics *system*) — this is read-only introspection.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

#[derive(Debug, Serialize)]
pub struct Metrics {
    pub at: DateTime<Utc>,

    pub queue: String,
    pub runnable_queue_depth: i64,

    // last 60s window, over good_job_executions
    pub jobs_per_sec: f64,
    pub success_rate: f64,
    pub retry_rate: f64,
    pub mean_latency_ms: f64,
}

#[derive(sqlx::FromRow)]
struct WindowStats {
    finished_count: Option<f64>,
    succeeded_count: Option<f64>,
    errored_count: Option<f64>,
    started_count: Option<f64>,
    mean_latency_ms: Option<f64>,
}

#[derive(Clone)]
pub struct MetricsRepo {
    pool: PgPool,
}

impl MetricsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn snapshot_all(&self) -> anyhow::Result<Vec<Metrics>> {
        let queues: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT queue_name FROM good_jobs ORDER BY queue_name")
                .fetch_all(&self.pool)
                .await?;

        let mut out = Vec::with_capacity(queues.len());
        for queue in queues {
            out.push(self.snapshot_for_queue(&queue).await?);
        }
        Ok(out)
    }

    pub async fn snapshot_for_queue(&self, queue: &str) -> anyhow::Result<Metrics> {
        let depth: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM good_jobs
            WHERE queue_name = $1
              AND finished_at IS NULL
              AND locked_by_id IS NULL
              AND (scheduled_at IS NULL OR scheduled_at <= now())
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        let stats = sqlx::query_as::<_, WindowStats>(
            r#"
            WITH window_executions AS (
                SELECT e.*
                FROM good_job_executions e
                JOIN good_jobs j ON j.active_job_id = e.active_job_id
                WHERE j.queue_name = $1
                  AND e.created_at >= now() - interval '60 seconds'
            ),
            finished AS (
                SELECT * FROM window_executions WHERE finished_at IS NOT NULL
            )
            SELECT
                (SELECT COUNT(*) FROM finished)::float8 AS finished_count,
                (SELECT COUNT(*) FROM finished WHERE error IS NULL)::float8 AS succeeded_count,
                (SELECT COUNT(*) FROM finished WHERE error IS NOT NULL)::float8 AS errored_count,
                (SELECT COUNT(*) FROM window_executions)::float8 AS started_count,
                COALESCE(
                    (SELECT AVG(EXTRACT(EPOCH FROM (finished_at - created_at)) * 1000.0) FROM finished),
                    0.0
                ) AS mean_latency_ms
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        let finished_count = stats.finished_count.unwrap_or(0.0);
        let succeeded_count = stats.succeeded_count.unwrap_or(0.0);
        let errored_count = stats.errored_count.unwrap_or(0.0);
        let started_count = stats.started_count.unwrap_or(0.0);
        let mean_latency_ms = stats.mean_latency_ms.unwrap_or(0.0);

        let jobs_per_sec = finished_count / 60.0;
        let success_rate = if finished_count > 0.0 { succeeded_count / finished_count } else { 0.0 };
        let retry_rate = if started_count > 0.0 { errored_count / started_count } else { 0.0 };

        Ok(Metrics {
            at: Utc::now(),
            queue: queue.to_string(),
            runnable_queue_depth: depth,
            jobs_per_sec,
            success_rate,
            retry_rate,
            mean_latency_ms,
        })
    }
}

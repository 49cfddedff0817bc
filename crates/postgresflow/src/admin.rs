//! Minimal JSON admin/inspection surface (SPEC_FULL §6): health, a
//! metrics snapshot, enqueue, and job lookup/timeline. The teacher's HTML
//! dashboard (`ADMIN_HTML`) has no counterpart in spec §1's "web
//! dashboards and LiveView UIs" non-goal and is dropped — only the data
//! endpoints survive, built with the same plain-JSON `axum` style the
//! teacher used for its non-HTML `src/admin/metrics.rs`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use std::sync::Arc;

use crate::concurrency::ConcurrencyGuard;
use crate::dispatch::DispatchRegistry;
use crate::error::PgflowError;
use crate::jobs::metrics::{Metrics, MetricsRepo};
use crate::jobs::model::{Job, NewJob};
use crate::jobs::timeline::build_timeline;
use crate::jobs::{ExecutionsRepo, JobRunner, JobsRepo};
use crate::serialization::JobEnvelope;

#[derive(Clone)]
pub struct AdminState {
    pub jobs: JobsRepo,
    pub executions: ExecutionsRepo,
    pub metrics: MetricsRepo,
    pub concurrency: ConcurrencyGuard,
    pub dispatch: Arc<DispatchRegistry>,
    /// Set when `execution_mode: inline` (spec §9): the enqueue handler
    /// drives the job to completion synchronously instead of leaving it
    /// for the async worker pool.
    pub inline_runner: Option<Arc<JobRunner>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/jobs", get(list_jobs).post(enqueue_job))
        .route("/jobs/:id/timeline", get(get_timeline))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn internal_err(e: anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: e.to_string(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    queue: Option<String>,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    now_utc: DateTime<Utc>,
    queues: Vec<Metrics>,
}

async fn metrics(
    State(state): State<AdminState>,
    Query(q): Query<MetricsQuery>,
) -> Response {
    let queues = if let Some(queue) = q.queue {
        match state.metrics.snapshot_for_queue(&queue).await {
            Ok(m) => vec![m],
            Err(e) => return internal_err(e).into_response(),
        }
    } else {
        match state.metrics.snapshot_all().await {
            Ok(m) => m,
            Err(e) => return internal_err(e).into_response(),
        }
    };

    Json(MetricsResponse {
        now_utc: Utc::now(),
        queues,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    queue: Option<String>,
    limit: Option<i64>,
}

async fn list_jobs(State(state): State<AdminState>, Query(q): Query<ListJobsQuery>) -> Response {
    match state.jobs.list(q.queue.as_deref(), q.limit.unwrap_or(100)).await {
        Ok(jobs) => Json(jobs_with_state(jobs)).into_response(),
        Err(e) => internal_err(e).into_response(),
    }
}

/// The wire shape for a listed job: the stored row plus its derived
/// state (spec §3's state is never stored, so the admin surface computes
/// it on the way out rather than exposing raw column combinations).
#[derive(Debug, Serialize)]
struct JobListItem {
    #[serde(flatten)]
    job: Job,
    state: String,
}

fn jobs_with_state(jobs: Vec<Job>) -> Vec<JobListItem> {
    let now = Utc::now();
    jobs.into_iter()
        .map(|job| {
            let state = job.state(now).as_str().to_string();
            JobListItem { job, state }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    job_class: String,
    queue_name: Option<String>,
    arguments: Option<Vec<Value>>,
    priority: Option<i32>,
    scheduled_at: Option<DateTime<Utc>>,
    concurrency_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: Uuid,
}

async fn enqueue_job(
    State(state): State<AdminState>,
    Json(body): Json<EnqueueRequest>,
) -> Response {
    if body.job_class.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "job_class is required".to_string(),
            }),
        )
            .into_response();
    }

    let queue_name = body.queue_name.unwrap_or_else(|| "default".to_string());
    let mut envelope = JobEnvelope::new(body.job_class.clone(), body.arguments.unwrap_or_default());
    envelope.queue_name = queue_name.clone();
    envelope.priority = body.priority;
    envelope.scheduled_at = body.scheduled_at;

    let mut new_job = NewJob::new(body.job_class, envelope.to_value()).queue(queue_name);
    if let Some(priority) = body.priority {
        new_job = new_job.priority(priority);
    }
    if let Some(at) = body.scheduled_at {
        new_job = new_job.scheduled_at(at);
    }
    if let Some(key) = body.concurrency_key {
        new_job = new_job.concurrency_key(key);
    }

    match state.concurrency.enqueue(&state.dispatch, new_job).await {
        Ok(job) => {
            if let Some(runner) = &state.inline_runner {
                if let Err(e) = runner.perform_now(job.id).await {
                    tracing::error!(target: "pgflow::admin", job_id = %job.id, error = %e, "inline perform failed");
                }
            }
            Json(EnqueueResponse { job_id: job.id }).into_response()
        }
        Err(e) => match e.downcast_ref::<PgflowError>() {
            Some(PgflowError::ConcurrencyLimitExceeded { key, limit }) => (
                StatusCode::CONFLICT,
                Json(ErrorBody {
                    error: format!("concurrency_key {key:?} is at its total_limit of {limit}"),
                }),
            )
                .into_response(),
            _ => internal_err(e).into_response(),
        },
    }
}

async fn get_timeline(Path(id): Path<Uuid>, State(state): State<AdminState>) -> Response {
    match build_timeline(&state.jobs, &state.executions, id).await {
        Ok(Some(timeline)) => Json(timeline).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "job not found".to_string(),
            }),
        )
            .into_response(),
        Err(e) => internal_err(e).into_response(),
    }
}

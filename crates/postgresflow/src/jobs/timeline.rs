//! Per-job timeline (SPEC_FULL ambient stack §6.3): derived state plus the
//! ordered `good_job_executions` history for one `active_job_id`, exposed
//! by the admin API's job-detail endpoint.

use crate::jobs::executions::ExecutionsRepo;
use crate::jobs::repo::JobsRepo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct JobTimeline {
    pub job_id: Uuid,
    pub active_job_id: Uuid,
    pub state: String,
    pub queue_name: String,
    pub job_class: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub executions_count: i32,
    pub last_error: Option<String>,
    pub executions: Vec<TimelineExecution>,
}

#[derive(Debug, Serialize)]
pub struct TimelineExecution {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
}

pub async fn build_timeline(
    jobs: &JobsRepo,
    executions: &ExecutionsRepo,
    job_id: Uuid,
) -> anyhow::Result<Option<JobTimeline>> {
    let job = match jobs.get(job_id).await? {
        Some(j) => j,
        None => return Ok(None),
    };

    let raw_executions = executions.list_for_active_job(job.active_job_id).await?;
    let now = Utc::now();

    let executions_out: Vec<TimelineExecution> = raw_executions
        .iter()
        .map(|e| TimelineExecution {
            id: e.id,
            created_at: e.created_at,
            finished_at: e.finished_at,
            error: e.error.clone(),
            latency_ms: e
                .finished_at
                .map(|finished| (finished - e.created_at).num_milliseconds()),
        })
        .collect();

    Ok(Some(JobTimeline {
        job_id: job.id,
        active_job_id: job.active_job_id,
        state: job.state(now).as_str().to_string(),
        queue_name: job.queue_name.clone(),
        job_class: job.job_class.clone(),
        scheduled_at: job.scheduled_at,
        executions_count: job.executions_count,
        last_error: job.error.clone(),
        executions: executions_out,
    }))
}

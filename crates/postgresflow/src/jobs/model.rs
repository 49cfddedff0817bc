use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// A row of `good_jobs`. Field order mirrors the table definition in
/// the schema migration, not call-site convenience.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub active_job_id: Uuid,

    pub job_class: String,
    pub queue_name: String,
    pub priority: Option<i32>,
    pub serialized_params: Value,

    pub scheduled_at: Option<DateTime<Utc>>,
    pub performed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub executions_count: i32,

    pub concurrency_key: Option<String>,

    pub cron_key: Option<String>,
    pub cron_at: Option<DateTime<Utc>>,

    pub retried_good_job_id: Option<Uuid>,

    pub batch_id: Option<Uuid>,
    pub batch_callback_id: Option<Uuid>,
    pub labels: Option<Vec<String>>,

    pub locked_by_id: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The derived lifecycle state of a job. Never stored — always computed
/// from the row per the rule in spec §3, so two readers of the same row
/// at different times may disagree only because `now` moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Succeeded,
    Discarded,
    Running,
    Retried,
    Scheduled,
    Available,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Succeeded => "succeeded",
            JobState::Discarded => "discarded",
            JobState::Running => "running",
            JobState::Retried => "retried",
            JobState::Scheduled => "scheduled",
            JobState::Available => "available",
        }
    }
}

/// `perform(args) -> {:cancel, reason}` writes this into `error` so the
/// derived state stays a pure function of the row (spec §3) while still
/// letting an operator tell "cancelled" apart from a genuine failure.
pub const CANCELLED_ERROR: &str = "Job cancelled";

impl Job {
    /// Pure function of the fields named in spec §3 and §8. A finished row
    /// is succeeded/discarded regardless of any other field; the retry
    /// backlink only matters for a row that never finished.
    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.finished_at.is_some() {
            return if self.error.is_none() {
                JobState::Succeeded
            } else {
                JobState::Discarded
            };
        }
        if self.performed_at.is_some() {
            return JobState::Running;
        }
        if self.retried_good_job_id.is_some() {
            return JobState::Retried;
        }
        if self.scheduled_at.map(|at| at > now).unwrap_or(false) {
            return JobState::Scheduled;
        }
        JobState::Available
    }

    pub fn is_cancelled(&self) -> bool {
        self.finished_at.is_some() && self.error.as_deref() == Some(CANCELLED_ERROR)
    }

    pub fn unfinished(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// Arguments for `JobsRepo::enqueue`. `scheduled_at: None` means
/// immediately eligible.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub active_job_id: Uuid,
    pub job_class: String,
    pub queue_name: String,
    pub priority: Option<i32>,
    pub serialized_params: Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub concurrency_key: Option<String>,
    pub cron_key: Option<String>,
    pub cron_at: Option<DateTime<Utc>>,
    pub batch_id: Option<Uuid>,
    pub batch_callback_id: Option<Uuid>,
    pub labels: Option<Vec<String>>,
}

impl NewJob {
    pub fn new(job_class: impl Into<String>, serialized_params: Value) -> Self {
        Self {
            active_job_id: Uuid::new_v4(),
            job_class: job_class.into(),
            queue_name: "default".to_string(),
            priority: None,
            serialized_params,
            scheduled_at: None,
            concurrency_key: None,
            cron_key: None,
            cron_at: None,
            batch_id: None,
            batch_callback_id: None,
            labels: None,
        }
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    pub fn cron(mut self, key: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.cron_key = Some(key.into());
        self.cron_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base_job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            active_job_id: Uuid::new_v4(),
            job_class: "Echo".into(),
            queue_name: "default".into(),
            priority: None,
            serialized_params: Value::Null,
            scheduled_at: None,
            performed_at: None,
            finished_at: None,
            error: None,
            executions_count: 0,
            concurrency_key: None,
            cron_key: None,
            cron_at: None,
            retried_good_job_id: None,
            batch_id: None,
            batch_callback_id: None,
            labels: None,
            locked_by_id: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn available_by_default() {
        let job = base_job();
        assert_eq!(job.state(Utc::now()), JobState::Available);
    }

    #[test]
    fn scheduled_when_in_future() {
        let now = Utc::now();
        let mut job = base_job();
        job.scheduled_at = Some(now + Duration::seconds(60));
        assert_eq!(job.state(now), JobState::Scheduled);
    }

    #[test]
    fn running_when_performed_but_not_finished() {
        let mut job = base_job();
        job.performed_at = Some(Utc::now());
        assert_eq!(job.state(Utc::now()), JobState::Running);
    }

    #[test]
    fn succeeded_when_finished_without_error() {
        let mut job = base_job();
        job.finished_at = Some(Utc::now());
        assert_eq!(job.state(Utc::now()), JobState::Succeeded);
    }

    #[test]
    fn discarded_when_finished_with_error() {
        let mut job = base_job();
        job.finished_at = Some(Utc::now());
        job.error = Some("boom".into());
        assert_eq!(job.state(Utc::now()), JobState::Discarded);
    }

    #[test]
    fn cancelled_is_a_discarded_with_marker_error() {
        let mut job = base_job();
        job.finished_at = Some(Utc::now());
        job.error = Some(CANCELLED_ERROR.to_string());
        assert_eq!(job.state(Utc::now()), JobState::Discarded);
        assert!(job.is_cancelled());
    }

    #[test]
    fn retried_when_backlinked_and_not_finished() {
        let mut job = base_job();
        job.retried_good_job_id = Some(Uuid::new_v4());
        assert_eq!(job.state(Utc::now()), JobState::Retried);
    }

    #[test]
    fn finished_state_wins_over_retried_backlink() {
        let mut job = base_job();
        job.retried_good_job_id = Some(Uuid::new_v4());
        job.finished_at = Some(Utc::now());
        assert_eq!(job.state(Utc::now()), JobState::Succeeded);
    }
}

//! The Scheduler/Performer pool (spec §4.7): a set of worker loops woken by
//! the Poller, each driving the claim → concurrency-check → dispatch →
//! record-outcome sequence for one candidate row at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::concurrency::{ConcurrencyGuard, PerformGate};
use crate::db::AdvisoryLock;
use crate::dispatch::{DispatchRegistry, HandlerEntry, Outcome};
use crate::error::PgflowError;
use crate::jobs::batches::BatchesRepo;
use crate::jobs::executions::ExecutionsRepo;
use crate::jobs::model::Job;
use crate::jobs::repo::{DequeueOrdering, JobsRepo};
use crate::jobs::settings::SettingsRepo;
use crate::poller::Wakeup;
use crate::serialization::JobEnvelope;

/// What the Scheduler passes to `fetch_candidates` on every wakeup: the
/// queue filter compiled once at startup from `queues` (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct SchedulerQueueFilter {
    pub explicit_includes: Option<Vec<String>>,
    pub ordering: DequeueOrdering,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_select_limit: i64,
    pub retry_on_unhandled_error: bool,
}

/// Shared state every worker task in the pool dispatches through. Cheap to
/// clone (every field is itself an `Arc`/pool handle).
#[derive(Clone)]
pub struct JobRunner {
    jobs: JobsRepo,
    executions: ExecutionsRepo,
    settings: SettingsRepo,
    batches: BatchesRepo,
    dispatch: Arc<DispatchRegistry>,
    concurrency: ConcurrencyGuard,
    pool: PgPool,
    process_id: Uuid,
    config: SchedulerConfig,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: JobsRepo,
        executions: ExecutionsRepo,
        settings: SettingsRepo,
        batches: BatchesRepo,
        dispatch: Arc<DispatchRegistry>,
        concurrency: ConcurrencyGuard,
        pool: PgPool,
        process_id: Uuid,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            executions,
            settings,
            batches,
            dispatch,
            concurrency,
            pool,
            process_id,
            config,
        }
    }

    /// Spawns `pool_size` worker tasks sharing one `Wakeup` receiver (any
    /// idle worker takes the next signal; a worker that finds candidates
    /// keeps draining the query before waiting again). Returns immediately;
    /// tasks run until `cancel` fires.
    pub fn spawn_pool(
        self: Arc<Self>,
        pool_size: usize,
        wakeups: tokio::sync::mpsc::Receiver<Wakeup>,
        filter: SchedulerQueueFilter,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let wakeups = Arc::new(Mutex::new(wakeups));
        (0..pool_size.max(1))
            .map(|worker_index| {
                let runner = self.clone();
                let wakeups = wakeups.clone();
                let filter = filter.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    runner.worker_loop(worker_index, wakeups, filter, cancel).await;
                })
            })
            .collect()
    }

    async fn worker_loop(
        &self,
        worker_index: usize,
        wakeups: Arc<Mutex<tokio::sync::mpsc::Receiver<Wakeup>>>,
        filter: SchedulerQueueFilter,
        cancel: CancellationToken,
    ) {
        loop {
            let signal = {
                let mut rx = wakeups.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    message = rx.recv() => message,
                }
            };
            if signal.is_none() {
                tracing::debug!(target: "pgflow::scheduler", worker_index, "wakeup channel closed, worker exiting");
                return;
            }

            loop {
                if cancel.is_cancelled() {
                    return;
                }
                match self.drain_one(&filter).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => {
                        tracing::error!(target: "pgflow::scheduler", worker_index, error = %err, "dequeue pass failed");
                        break;
                    }
                }
            }
        }
    }

    /// Claims and performs one specific job immediately, bypassing the
    /// queue scan — the `execution_mode: inline` path (spec §9): the
    /// enqueue caller wants `perform` to run synchronously right after
    /// the insert rather than waiting for a worker loop to pick it up.
    /// Returns `false` if the row was not claimable (already running,
    /// already finished, or concurrency-deferred) without that being an
    /// error — the caller falls back to leaving it for the async pool.
    pub async fn perform_now(&self, job_id: Uuid) -> anyhow::Result<bool> {
        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok(false);
        };
        self.try_claim_and_perform(job).await
    }

    /// Fetches one batch of candidates, attempts to claim the first one this
    /// worker can get an advisory lock on, and performs it. Returns `true`
    /// if a job was claimed and processed (so the worker should immediately
    /// look for more before going back to waiting on a wakeup), `false` if
    /// nothing was available or claimable.
    async fn drain_one(&self, filter: &SchedulerQueueFilter) -> anyhow::Result<bool> {
        let queues = filter.explicit_includes.as_deref();
        let candidates = self
            .jobs
            .fetch_candidates(queues, &filter.ordering, self.config.queue_select_limit)
            .await?;

        for candidate in candidates {
            if self.settings.is_queue_paused(&candidate.queue_name).await? {
                continue;
            }
            if self.try_claim_and_perform(candidate).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Attempts the full claim sequence (spec §4.7 steps 2-7) for a single
    /// candidate. Returns `false` without error if the row was claimed by a
    /// peer process between selection and lock acquisition, or deferred by
    /// a perform-time concurrency check.
    #[tracing::instrument(skip(self, candidate), fields(job_id = %candidate.id, job_class = %candidate.job_class))]
    async fn try_claim_and_perform(&self, candidate: Job) -> anyhow::Result<bool> {
        let mut lock = match AdvisoryLock::try_acquire(&self.pool, "good_jobs", candidate.id).await? {
            Some(lock) => lock,
            None => return Ok(false),
        };

        let fresh = match self.jobs.get(candidate.id).await? {
            Some(row) if row.unfinished() && row.performed_at.is_none() => row,
            _ => {
                lock.unlock().await?;
                return Ok(false);
            }
        };

        let spec = match self.dispatch.resolve(&fresh.job_class) {
            Ok(spec) => spec,
            Err(PgflowError::UnknownHandler { job_class }) => {
                tracing::warn!(target: "pgflow::scheduler", job_class, "discarding job with no registered handler");
                self.jobs.mark_discarded(fresh.id, &format!("UnknownHandler: {job_class}")).await?;
                self.fire_batch_callbacks(&fresh).await?;
                lock.unlock().await?;
                return Ok(true);
            }
            Err(err) => {
                lock.unlock().await?;
                return Err(err.into());
            }
        };

        if matches!(spec.handler, HandlerEntry::ExternalDescriptor) {
            tracing::warn!(target: "pgflow::scheduler", job_id = %fresh.id, "external-only job routed to this process");
            self.jobs
                .mark_discarded(fresh.id, &PgflowError::ExternalJobMisrouted { job_id: fresh.id }.to_string())
                .await?;
            self.fire_batch_callbacks(&fresh).await?;
            lock.unlock().await?;
            return Ok(true);
        }

        if let (Some(key), Some(limit)) = (fresh.concurrency_key.as_deref(), spec.concurrency_total_limit) {
            match self.concurrency.check_perform(&mut lock, key, limit, fresh.id).await? {
                PerformGate::Proceed => {}
                PerformGate::ReleaseAndRetryLater => {
                    self.jobs.release_without_finishing(fresh.id).await?;
                    lock.unlock().await?;
                    return Ok(false);
                }
            }
        }

        if !self.jobs.mark_running(&mut lock, fresh.id, self.process_id).await? {
            lock.unlock().await?;
            return Ok(false);
        }

        let handler = match &spec.handler {
            HandlerEntry::Local(handler) => handler.clone(),
            HandlerEntry::ExternalDescriptor => unreachable!("checked above"),
        };

        let envelope = JobEnvelope::from_value(fresh.serialized_params.clone())?;
        let arguments = crate::serialization::decode_arguments(&envelope.arguments);

        let execution_id = self
            .executions
            .start(fresh.active_job_id, &fresh.job_class, &fresh.queue_name, &fresh.serialized_params)
            .await?;

        handler.before_perform(&arguments).await;
        let outcome = match spec.timeout_seconds {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), handler.perform(&arguments)).await {
                Ok(outcome) => outcome,
                Err(_) => Outcome::Error(format!("timed out after {secs}s")),
            },
            None => handler.perform(&arguments).await,
        };
        handler.after_perform(&arguments, &outcome).await;

        self.record_outcome(&fresh, execution_id, spec.max_attempts, spec.backoff_base_seconds, spec.backoff_cap_seconds, outcome)
            .await?;

        lock.unlock().await?;
        Ok(true)
    }

    async fn record_outcome(
        &self,
        job: &Job,
        execution_id: Uuid,
        max_attempts: i32,
        backoff_base_seconds: i64,
        backoff_cap_seconds: i64,
        outcome: Outcome,
    ) -> anyhow::Result<()> {
        match outcome {
            Outcome::Ok => {
                self.jobs.mark_succeeded(job.id).await?;
                self.executions.finish(execution_id, None).await?;
                self.fire_batch_callbacks(job).await?;
            }
            Outcome::Error(reason) => {
                let attempt = job.executions_count + 1;
                self.executions.finish(execution_id, Some(&reason)).await?;
                if attempt < max_attempts {
                    let delay = backoff_seconds(attempt, backoff_base_seconds, backoff_cap_seconds);
                    let next_at = Utc::now() + chrono::Duration::seconds(delay);
                    self.jobs.schedule_retry(job.id, next_at, &reason).await?;
                    tracing::warn!(target: "pgflow::scheduler", job_id = %job.id, attempt, delay, "job errored, retry scheduled");
                } else if self.config.retry_on_unhandled_error {
                    // Exhausted but configured to retry indefinitely on
                    // unhandled errors: retry once more past max_attempts.
                    let delay = backoff_seconds(attempt, backoff_base_seconds, backoff_cap_seconds);
                    let next_at = Utc::now() + chrono::Duration::seconds(delay);
                    self.jobs.schedule_retry(job.id, next_at, &reason).await?;
                    tracing::warn!(target: "pgflow::scheduler", job_id = %job.id, attempt, "max_attempts exceeded, retrying anyway (retry_on_unhandled_error)");
                } else {
                    self.jobs.mark_discarded(job.id, &reason).await?;
                    tracing::error!(target: "pgflow::scheduler", job_id = %job.id, attempt, "job discarded: attempts exhausted");
                    self.fire_batch_callbacks(job).await?;
                }
            }
            Outcome::Discard(reason) => {
                self.jobs.mark_discarded(job.id, &reason).await?;
                self.executions.finish(execution_id, Some(&reason)).await?;
                self.fire_batch_callbacks(job).await?;
            }
            Outcome::Cancel(reason) => {
                self.jobs.mark_cancelled(job.id).await?;
                self.executions.finish(execution_id, Some(&reason)).await?;
                self.fire_batch_callbacks(job).await?;
            }
            Outcome::Snooze(seconds) => {
                let until = Utc::now() + chrono::Duration::seconds(seconds);
                self.jobs.snooze(job.id, until).await?;
                self.executions.finish(execution_id, None).await?;
                tracing::debug!(target: "pgflow::scheduler", job_id = %job.id, seconds, "job snoozed");
            }
        }
        Ok(())
    }

    /// Fires `on_finish`/`on_success`/`on_discard` callback jobs once a
    /// batch's last outstanding member finishes (SPEC_FULL §3 "Batch
    /// callbacks"). A no-op for jobs with no `batch_id`.
    async fn fire_batch_callbacks(&self, job: &Job) -> anyhow::Result<()> {
        let Some(batch_id) = job.batch_id else {
            return Ok(());
        };
        let Some(due) = self.batches.member_finished(batch_id).await? else {
            return Ok(());
        };

        for job_class in [due.on_finish.as_deref(), due.on_success.as_deref(), due.on_discard.as_deref()]
            .into_iter()
            .flatten()
        {
            let new_job = crate::jobs::model::NewJob::new(job_class.to_string(), callback_params(job_class, batch_id))
                .queue(due.queue_name.clone());
            let new_job = match due.priority {
                Some(priority) => new_job.priority(priority),
                None => new_job,
            };
            self.concurrency.enqueue(&self.dispatch, new_job).await?;
        }
        Ok(())
    }
}

fn callback_params(job_class: &str, batch_id: Uuid) -> Value {
    let mut envelope = JobEnvelope::new(job_class.to_string(), vec![serde_json::json!({ "batch_id": batch_id })]);
    envelope.queue_name = "default".to_string();
    envelope.to_value()
}

/// `min(base * 2^(attempt-1), cap)`, no jitter — spec §4.7's deterministic
/// backoff formula for the in-place retry path.
pub fn backoff_seconds(attempt: i32, base_seconds: i64, cap_seconds: i64) -> i64 {
    let exponent = (attempt - 1).max(0);
    let scaled = base_seconds.saturating_mul(1i64.checked_shl(exponent as u32).unwrap_or(i64::MAX));
    scaled.min(cap_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_until_cap() {
        assert_eq!(backoff_seconds(1, 3, 86_400), 3);
        assert_eq!(backoff_seconds(2, 3, 86_400), 6);
        assert_eq!(backoff_seconds(3, 3, 86_400), 12);
        assert_eq!(backoff_seconds(10, 3, 86_400), 86_400);
    }

    #[test]
    fn backoff_never_exceeds_cap_even_for_large_attempts() {
        assert_eq!(backoff_seconds(100, 1, 60), 60);
    }
}

//! Cleanup Loop (spec §4.9): orphan-lock recovery and retention-based
//! deletion, each on its own configurable interval.

use crate::jobs::processes::ProcessesRepo;
use crate::jobs::repo::JobsRepo;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub process_stale_after_seconds: i64,
    pub preserved_jobs_before_seconds_ago: i64,
    pub cleanup_discarded_jobs: bool,
    pub delete_batch_size: i64,
}

pub struct CleanupLoop {
    jobs: JobsRepo,
    processes: ProcessesRepo,
    config: CleanupConfig,
}

impl CleanupLoop {
    pub fn new(jobs: JobsRepo, processes: ProcessesRepo, config: CleanupConfig) -> Self {
        Self {
            jobs,
            processes,
            config,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = timer.tick() => {
                        if let Err(err) = self.run_once().await {
                            tracing::error!(target: "pgflow::cleanup", error = %err, "cleanup pass failed");
                        }
                    }
                }
            }
        });
    }

    #[tracing::instrument(skip(self))]
    async fn run_once(&self) -> anyhow::Result<()> {
        let reaped = self
            .processes
            .reap_stale(self.config.process_stale_after_seconds)
            .await?;
        if !reaped.is_empty() {
            tracing::info!(target: "pgflow::cleanup", count = reaped.len(), "reaped stale processes");
        }

        let recovered = self.jobs.recover_orphaned_locks().await?;
        if recovered > 0 {
            tracing::info!(target: "pgflow::cleanup", count = recovered, "recovered orphaned locks");
        }

        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.preserved_jobs_before_seconds_ago);
        let deleted = self
            .jobs
            .delete_finished_before(cutoff, self.config.cleanup_discarded_jobs, self.config.delete_batch_size)
            .await?;
        if deleted > 0 {
            tracing::info!(target: "pgflow::cleanup", count = deleted, %cutoff, "deleted retained finished jobs");
        }

        Ok(())
    }
}

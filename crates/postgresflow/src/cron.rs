//! Cron Loop (spec §4.8): per-entry periodic enqueue keyed by
//! `(cron_key, cron_at)`, using the `cron` crate for 5-field expression
//! parsing and `next_after(now)` — the pack's convention for this
//! (`roadster`'s pg job processor and two other pack files use it).

use crate::concurrency::ConcurrencyGuard;
use crate::config::CronEntry;
use crate::dispatch::DispatchRegistry;
use crate::jobs::model::NewJob;
use crate::jobs::settings::SettingsRepo;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct CronLoop {
    concurrency: ConcurrencyGuard,
    dispatch: Arc<DispatchRegistry>,
    settings: SettingsRepo,
    entries: Vec<CronEntry>,
}

impl CronLoop {
    pub fn new(
        concurrency: ConcurrencyGuard,
        dispatch: Arc<DispatchRegistry>,
        settings: SettingsRepo,
        entries: Vec<CronEntry>,
    ) -> Self {
        Self {
            concurrency,
            dispatch,
            settings,
            entries,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) {
        for entry in self.entries.clone() {
            let concurrency = self.concurrency.clone();
            let dispatch = self.dispatch.clone();
            let settings = self.settings.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { run_entry(concurrency, dispatch, settings, entry, cancel).await });
        }
    }
}

async fn run_entry(
    concurrency: ConcurrencyGuard,
    dispatch: Arc<DispatchRegistry>,
    settings: SettingsRepo,
    entry: CronEntry,
    cancel: CancellationToken,
) {
    let schedule = match Schedule::from_str(&expand_to_six_field(&entry.cron_expression)) {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(
                target: "pgflow::cron",
                cron_key = entry.key,
                error = %err,
                "invalid cron expression, entry disabled"
            );
            return;
        }
    };

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let now = Utc::now();
        let next = match schedule.after(&now).next() {
            Some(at) => at,
            None => {
                tracing::warn!(target: "pgflow::cron", cron_key = entry.key, "schedule exhausted");
                return;
            }
        };

        let sleep_for = (next - now).to_std().unwrap_or(Duration::from_secs(0));
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = cancel.cancelled() => return,
        }

        if let Err(err) = tick(&concurrency, &dispatch, &settings, &entry, next).await {
            tracing::error!(target: "pgflow::cron", cron_key = entry.key, error = %err, "cron tick failed");
        }
    }
}

async fn tick(
    concurrency: &ConcurrencyGuard,
    dispatch: &DispatchRegistry,
    settings: &SettingsRepo,
    entry: &CronEntry,
    cron_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    if !settings.is_cron_enabled(&entry.key).await? {
        tracing::debug!(target: "pgflow::cron", cron_key = entry.key, "paused, skipping tick");
        return Ok(());
    }

    let new_job = NewJob {
        active_job_id: Uuid::new_v4(),
        job_class: entry.job_class.clone(),
        queue_name: entry.queue_name.clone(),
        priority: entry.priority,
        serialized_params: {
            let mut envelope =
                crate::serialization::JobEnvelope::new(entry.job_class.clone(), vec![]);
            envelope.queue_name = entry.queue_name.clone();
            envelope.priority = entry.priority;
            envelope.to_value()
        },
        scheduled_at: None,
        concurrency_key: None,
        cron_key: Some(entry.key.clone()),
        cron_at: Some(cron_at),
        batch_id: None,
        batch_callback_id: None,
        labels: None,
    };

    match concurrency.enqueue_cron_tick(dispatch, new_job).await? {
        Some(row) => {
            tracing::info!(target: "pgflow::cron", cron_key = entry.key, job_id = %row.id, %cron_at, "tick enqueued");
        }
        None => {
            tracing::debug!(target: "pgflow::cron", cron_key = entry.key, %cron_at, "tick already materialized by a peer process");
        }
    }
    Ok(())
}

/// The `cron` crate expects a 6-field (with seconds) expression; the
/// standard 5-field expressions in spec §4.8 get a leading `0` seconds
/// field when they don't already have six fields.
fn expand_to_six_field(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    if field_count == 6 {
        expr.to_string()
    } else {
        format!("0 {expr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_five_field_expressions() {
        assert_eq!(expand_to_six_field("*/1 * * * *"), "0 */1 * * * *");
    }

    #[test]
    fn leaves_six_field_expressions_untouched() {
        assert_eq!(expand_to_six_field("30 */1 * * * *"), "30 */1 * * * *");
    }

    #[test]
    fn parses_with_cron_crate_after_expansion() {
        let schedule = Schedule::from_str(&expand_to_six_field("*/1 * * * *")).unwrap();
        assert!(schedule.upcoming(Utc).next().is_some());
    }
}

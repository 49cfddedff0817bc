//! Wires the `postgresflow` library components into a running process:
//! notifier → poller → scheduler/performer, cron loop, cleanup loop, and
//! the admin JSON surface, plus the example handlers in `handlers.rs`.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use postgresflow::admin::{self, AdminState};
use postgresflow::concurrency::ConcurrencyGuard;
use postgresflow::config::{Config, ExecutionMode};
use postgresflow::cron::CronLoop;
use postgresflow::cleanup::{CleanupConfig, CleanupLoop};
use postgresflow::db;
use postgresflow::jobs::runner::{JobRunner, SchedulerConfig, SchedulerQueueFilter};
use postgresflow::jobs::{BatchesRepo, ExecutionsRepo, JobsRepo, ProcessesRepo, SettingsRepo};
use postgresflow::notifier::Notifier;
use postgresflow::poller::{Poller, QueueFilter};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = Config::from_env()?;
    tracing::info!(
        target: "worker",
        worker_id = %cfg.worker_id,
        queues = %cfg.queues,
        max_processes = cfg.max_processes,
        execution_mode = ?cfg.execution_mode,
        "starting"
    );

    let pool = db::make_pool(&cfg.database_url, cfg.max_processes as u32 + 4).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let jobs = JobsRepo::new(pool.clone()).with_notify(cfg.notifier_channel.clone(), cfg.enqueue_after_transaction_commit);
    let executions = ExecutionsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());
    let batches = BatchesRepo::new(pool.clone());
    let processes = ProcessesRepo::new(pool.clone());
    let metrics = postgresflow::jobs::metrics::MetricsRepo::new(pool.clone());

    let process_id = processes
        .register(serde_json::json!({ "worker_id": cfg.worker_id, "max_processes": cfg.max_processes }))
        .await?;
    tracing::info!(target: "worker", process_id = %process_id, "registered process");

    let dispatch = handlers::build_registry();
    let concurrency = ConcurrencyGuard::new(jobs.clone(), pool.clone());

    let cancel = CancellationToken::new();

    let queue_filter = QueueFilter::parse(&cfg.queues);
    let scheduler_filter = SchedulerQueueFilter {
        explicit_includes: queue_filter.explicit_includes(),
        ordering: postgresflow::jobs::repo::DequeueOrdering {
            queue_ranks: queue_filter.queue_ranks(),
        },
    };

    let notifier = if cfg.enable_listen_notify {
        Some(Notifier::spawn(
            pool.clone(),
            cfg.notifier_channel.clone(),
            Duration::from_secs(cfg.notifier_keepalive_interval),
            cancel.clone(),
        ))
    } else {
        None
    };

    let runner = Arc::new(JobRunner::new(
        jobs.clone(),
        executions.clone(),
        settings.clone(),
        batches.clone(),
        dispatch.clone(),
        concurrency.clone(),
        pool.clone(),
        process_id,
        SchedulerConfig {
            queue_select_limit: cfg.queue_select_limit,
            retry_on_unhandled_error: cfg.retry_on_unhandled_error,
        },
    ));

    let mut worker_handles = Vec::new();

    if matches!(cfg.execution_mode, ExecutionMode::Async) {
        let (poller, wakeups) = match &notifier {
            Some(notifier) => Poller::spawn(
                notifier,
                queue_filter,
                Duration::from_secs(cfg.poll_interval),
                cancel.clone(),
            ),
            None => {
                // No Notifier: fabricate a notifier-less broadcast so the
                // Poller still ticks on its timer (spec §4.5's backstop).
                let standalone = Notifier::spawn(
                    pool.clone(),
                    cfg.notifier_channel.clone(),
                    Duration::from_secs(cfg.notifier_keepalive_interval),
                    cancel.clone(),
                );
                Poller::spawn(&standalone, queue_filter, Duration::from_secs(cfg.poll_interval), cancel.clone())
            }
        };
        let _ = poller; // keep alive via the spawned task; handle not otherwise needed.

        worker_handles = runner.clone().spawn_pool(cfg.max_processes, wakeups, scheduler_filter, cancel.clone());
    } else {
        tracing::info!(
            target: "worker",
            execution_mode = ?cfg.execution_mode,
            "execution_mode is not async: the scheduler pool is not started. \
             inline jobs are performed synchronously by the admin enqueue endpoint; \
             external jobs are executed by a peer runtime."
        );
    }

    if cfg.enable_cron && !cfg.cron.is_empty() {
        CronLoop::new(concurrency.clone(), dispatch.clone(), settings.clone(), cfg.cron.clone())
            .spawn(cancel.clone());
    }

    CleanupLoop::new(
        jobs.clone(),
        processes.clone(),
        CleanupConfig {
            interval: Duration::from_secs(cfg.cleanup_interval_seconds),
            process_stale_after_seconds: (cfg.advisory_lock_heartbeat * 3).max(30),
            preserved_jobs_before_seconds_ago: cfg.cleanup_preserved_jobs_before_seconds_ago,
            cleanup_discarded_jobs: cfg.cleanup_discarded_jobs,
            delete_batch_size: 500,
        },
    )
    .spawn(cancel.clone());

    let admin_handle = {
        let admin_addr = cfg.admin_addr.clone();
        let inline_runner = matches!(cfg.execution_mode, ExecutionMode::Inline).then(|| runner.clone());
        let state = AdminState {
            jobs: jobs.clone(),
            executions: executions.clone(),
            metrics,
            concurrency: concurrency.clone(),
            dispatch: dispatch.clone(),
            inline_runner,
        };
        tokio::spawn(async move {
            let Some(addr) = admin_addr else {
                std::future::pending::<()>().await;
                return Ok::<(), anyhow::Error>(());
            };
            let app = admin::router(state);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(target: "worker", %addr, "admin api listening");
            axum::serve(listener, app).await?;
            Ok(())
        })
    };

    let heartbeat_handle = {
        let processes = processes.clone();
        let interval = Duration::from_secs(cfg.advisory_lock_heartbeat.max(1));
        let cancel = cancel.clone();
        let worker_id = cfg.worker_id.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = timer.tick() => {
                        if let Err(err) = processes
                            .heartbeat(process_id, serde_json::json!({ "worker_id": worker_id }))
                            .await
                        {
                            tracing::warn!(target: "worker", error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "worker", "shutdown signal received");
        }
    }

    cancel.cancel();
    heartbeat_handle.abort();

    if cfg.shutdown_timeout < 0 {
        for handle in worker_handles {
            let _ = handle.await;
        }
    } else {
        let deadline = Duration::from_secs(cfg.shutdown_timeout as u64);
        let _ = tokio::time::timeout(deadline, futures::future::join_all(worker_handles)).await;
    }

    admin_handle.abort();
    processes.deregister(process_id).await?;
    tracing::info!(target: "worker", "shut down cleanly");

    Ok(())
}

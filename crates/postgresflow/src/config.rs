//! Runtime configuration, loaded from environment variables per spec §6.4.
//!
//! Every option below has a `PGFLOW_<NAME>` variable (checked first) and,
//! for the options the teacher already exposed, a bare legacy fallback
//! name. Boolean options coerce `"true"`/`"1"`/`"yes"`/`"on"` (and their
//! negations) the way `env_bool` always has.

use std::collections::HashMap;

/// How an enqueued job gets performed, per spec §9's "Execution modes".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// A peer runtime (or a different local process) owns execution.
    External,
    /// This process's scheduler/performer pool claims and runs it.
    Async,
    /// `perform` runs synchronously in the same transaction as the insert.
    Inline,
}

impl ExecutionMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "external" => Some(Self::External),
            "async" => Some(Self::Async),
            "inline" => Some(Self::Inline),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CronEntry {
    pub key: String,
    pub cron_expression: String,
    pub job_class: String,
    pub queue_name: String,
    pub priority: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,

    pub execution_mode: ExecutionMode,
    pub queues: String,
    pub max_processes: usize,
    pub poll_interval: u64,

    pub enable_listen_notify: bool,
    pub notifier_channel: String,
    pub notifier_wait_interval: u64,
    pub notifier_keepalive_interval: u64,
    pub notifier_pool_size: u32,
    /// Spec §4.4: `false` (default) publishes `NOTIFY` in the same
    /// transaction as the insert; `true` defers it until after commit.
    pub enqueue_after_transaction_commit: bool,

    pub enable_cron: bool,
    pub cron: Vec<CronEntry>,

    pub cleanup_discarded_jobs: bool,
    pub cleanup_preserved_jobs_before_seconds_ago: i64,
    pub cleanup_interval_seconds: u64,

    pub queue_select_limit: i64,
    pub shutdown_timeout: i64,

    pub advisory_lock_heartbeat: u64,
    pub enable_pauses: bool,
    pub retry_on_unhandled_error: bool,
    pub max_cache: usize,

    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("PGFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

        let execution_mode = env_or_fallback("PGFLOW_EXECUTION_MODE", "EXECUTION_MODE")
            .and_then(|s| ExecutionMode::parse(&s))
            .unwrap_or(ExecutionMode::Async);

        let queues = env_or_fallback("PGFLOW_QUEUES", "QUEUES").unwrap_or_else(|| "*".to_string());

        let max_processes = env_usize("PGFLOW_MAX_PROCESSES").unwrap_or(5);
        let poll_interval = env_u64("PGFLOW_POLL_INTERVAL").unwrap_or(10);

        let enable_listen_notify = env_bool("PGFLOW_ENABLE_LISTEN_NOTIFY").unwrap_or(true);
        let notifier_channel =
            std::env::var("PGFLOW_NOTIFIER_CHANNEL").unwrap_or_else(|_| "good_job".to_string());
        let notifier_wait_interval = env_u64("PGFLOW_NOTIFIER_WAIT_INTERVAL").unwrap_or(1);
        let notifier_keepalive_interval =
            env_u64("PGFLOW_NOTIFIER_KEEPALIVE_INTERVAL").unwrap_or(10);
        let notifier_pool_size = env_usize("PGFLOW_NOTIFIER_POOL_SIZE").unwrap_or(1) as u32;
        let enqueue_after_transaction_commit =
            env_bool("PGFLOW_ENQUEUE_AFTER_TRANSACTION_COMMIT").unwrap_or(false);

        let enable_cron = env_bool("PGFLOW_ENABLE_CRON").unwrap_or(false);
        let cron = parse_cron_table(&std::env::var("PGFLOW_CRON").unwrap_or_default());

        let cleanup_discarded_jobs = env_bool("PGFLOW_CLEANUP_DISCARDED_JOBS").unwrap_or(true);
        let cleanup_preserved_jobs_before_seconds_ago =
            env_i64("PGFLOW_CLEANUP_PRESERVED_JOBS_BEFORE_SECONDS_AGO")
                .unwrap_or(14 * 24 * 60 * 60);
        let cleanup_interval_seconds = env_u64("PGFLOW_CLEANUP_INTERVAL_SECONDS").unwrap_or(60);

        let queue_select_limit = env_i64("PGFLOW_QUEUE_SELECT_LIMIT").unwrap_or(50);
        let shutdown_timeout = env_i64("PGFLOW_SHUTDOWN_TIMEOUT").unwrap_or(25);

        let advisory_lock_heartbeat = env_u64("PGFLOW_ADVISORY_LOCK_HEARTBEAT").unwrap_or(60);
        let enable_pauses = env_bool("PGFLOW_ENABLE_PAUSES").unwrap_or(true);
        let retry_on_unhandled_error = env_bool("PGFLOW_RETRY_ON_UNHANDLED_ERROR").unwrap_or(true);
        let max_cache = env_usize("PGFLOW_MAX_CACHE").unwrap_or(10_000);

        let admin_addr = env_or_fallback("PGFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));
        let migrate_on_startup = env_bool("PGFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        if max_processes == 0 {
            anyhow::bail!("PGFLOW_MAX_PROCESSES must be >= 1");
        }
        if poll_interval == 0 {
            anyhow::bail!("PGFLOW_POLL_INTERVAL must be >= 1");
        }

        Ok(Self {
            database_url,
            worker_id,
            execution_mode,
            queues,
            max_processes,
            poll_interval,
            enable_listen_notify,
            notifier_channel,
            notifier_wait_interval,
            notifier_keepalive_interval,
            notifier_pool_size,
            enqueue_after_transaction_commit,
            enable_cron,
            cron,
            cleanup_discarded_jobs,
            cleanup_preserved_jobs_before_seconds_ago,
            cleanup_interval_seconds,
            queue_select_limit,
            shutdown_timeout,
            advisory_lock_heartbeat,
            enable_pauses,
            retry_on_unhandled_error,
            max_cache,
            admin_addr,
            migrate_on_startup,
        })
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

/// `PGFLOW_CRON` is a `;`-separated table of
/// `key=cron_expr,class=JobClass,queue=name,priority=N` entries — a plain
/// text encoding since this crate doesn't parse a config *file* (spec §1
/// scopes config-file loading out; only the enumerated env vars are core).
fn parse_cron_table(raw: &str) -> Vec<CronEntry> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let fields: HashMap<&str, &str> = entry
                .split(',')
                .filter_map(|kv| kv.split_once('='))
                .map(|(k, v)| (k.trim(), v.trim()))
                .collect();

            let key = fields.get("key")?.to_string();
            let cron_expression = fields.get("cron")?.to_string();
            let job_class = fields.get("class")?.to_string();
            let queue_name = fields.get("queue").unwrap_or(&"default").to_string();
            let priority = fields.get("priority").and_then(|p| p.parse().ok());

            Some(CronEntry {
                key,
                cron_expression,
                job_class,
                queue_name,
                priority,
            })
        })
        .collect()
}

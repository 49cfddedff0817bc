use uuid::Uuid;

/// The error taxonomy from spec §7. Infrastructure failures (`Storage`,
/// `NotifierDisconnect`) are the ones worth matching on at the call site;
/// most callers still just propagate this via `anyhow` as the teacher did.
#[derive(Debug, thiserror::Error)]
pub enum PgflowError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no handler registered for job_class {job_class:?}")]
    UnknownHandler { job_class: String },

    #[error("job {job_id} targets an externally-owned queue and cannot be performed locally")]
    ExternalJobMisrouted { job_id: Uuid },

    #[error("concurrency_key {key:?} is at its total_limit of {limit}")]
    ConcurrencyLimitExceeded { key: String, limit: i32 },

    #[error("handler error: {0}")]
    Handler(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("notifier disconnected: {0}")]
    NotifierDisconnect(String),
}

pub type Result<T> = std::result::Result<T, PgflowError>;

//! Dispatch Registry (spec §4.3): resolves `job_class` strings to local
//! handlers, and the reverse at enqueue time so a local handler gets an
//! external-facing class name peers can recognize.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{PgflowError, Result};

/// What a handler's `perform` returned, translated 1:1 from spec §4.7
/// step 6's outcome table.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ok,
    Error(String),
    Discard(String),
    Cancel(String),
    Snooze(i64),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, arguments: &[Value]) -> Outcome;

    /// Called with the claimed row's arguments before `perform`. Default
    /// no-op; a handler overrides it for the hook named in spec §9.
    async fn before_perform(&self, _arguments: &[Value]) {}

    /// Called after `perform` regardless of outcome.
    async fn after_perform(&self, _arguments: &[Value], _outcome: &Outcome) {}
}

/// Per-handler registration, built by [`HandlerSpec`] at startup — the
/// language-neutral stand-in for the `use Job` DSL (spec §9).
pub struct HandlerSpec {
    pub name: String,
    pub queue: String,
    pub priority: Option<i32>,
    pub max_attempts: i32,
    pub timeout_seconds: Option<u64>,
    pub concurrency_total_limit: Option<i32>,
    pub backoff_base_seconds: i64,
    pub backoff_cap_seconds: i64,
    pub handler: HandlerEntry,
}

pub enum HandlerEntry {
    Local(Arc<dyn JobHandler>),
    /// "External-only descriptor" (spec §4.3): declares routing metadata
    /// only. Enqueuing is fine; performing locally is a misroute.
    ExternalDescriptor,
}

impl HandlerSpec {
    pub fn local(name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            queue: "default".to_string(),
            priority: None,
            max_attempts: 25,
            timeout_seconds: None,
            concurrency_total_limit: None,
            backoff_base_seconds: 3,
            backoff_cap_seconds: 86_400,
            handler: HandlerEntry::Local(handler),
        }
    }

    pub fn external_descriptor(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            priority: None,
            max_attempts: 25,
            timeout_seconds: None,
            concurrency_total_limit: None,
            backoff_base_seconds: 3,
            backoff_cap_seconds: 86_400,
            handler: HandlerEntry::ExternalDescriptor,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn total_limit(mut self, n: i32) -> Self {
        self.concurrency_total_limit = Some(n);
        self
    }

    pub fn backoff(mut self, base_seconds: i64, cap_seconds: i64) -> Self {
        self.backoff_base_seconds = base_seconds;
        self.backoff_cap_seconds = cap_seconds;
        self
    }
}

/// Maps `external_class_name -> HandlerSpec`. Populated at startup and
/// read-only afterward (spec §5's shared-resource policy for this
/// component).
#[derive(Default)]
pub struct DispatchRegistry {
    by_class_name: HashMap<String, Arc<HandlerSpec>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: HandlerSpec) {
        self.by_class_name.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn spec_for_class(&self, job_class: &str) -> Option<Arc<HandlerSpec>> {
        self.by_class_name.get(job_class).cloned()
    }

    /// Resolution order per spec §4.3: exact match first, then treat
    /// `job_class` as a native identifier with `::` normalized to `.`.
    pub fn resolve(&self, job_class: &str) -> Result<Arc<HandlerSpec>> {
        if let Some(spec) = self.by_class_name.get(job_class) {
            return Ok(spec.clone());
        }

        let native_identifier = job_class.replace("::", ".");
        if let Some(spec) = self.by_class_name.get(native_identifier.as_str()) {
            return Ok(spec.clone());
        }

        Err(PgflowError::UnknownHandler {
            job_class: job_class.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn perform(&self, _arguments: &[Value]) -> Outcome {
            Outcome::Ok
        }
    }

    #[test]
    fn resolves_exact_external_class_match() {
        let mut registry = DispatchRegistry::new();
        registry.register(HandlerSpec::local("EchoJob", Arc::new(NoopHandler)));
        let spec = registry.resolve("EchoJob").unwrap();
        assert_eq!(spec.name, "EchoJob");
    }

    #[test]
    fn falls_back_to_native_identifier_with_dots_for_colons() {
        let mut registry = DispatchRegistry::new();
        registry.register(HandlerSpec::local("jobs.echo", Arc::new(NoopHandler)));
        let spec = registry.resolve("jobs::echo").unwrap();
        assert_eq!(spec.name, "jobs.echo");
    }

    #[test]
    fn unknown_class_fails_with_unknown_handler() {
        let registry = DispatchRegistry::new();
        let err = registry.resolve("Nope").unwrap_err();
        assert!(matches!(err, PgflowError::UnknownHandler { .. }));
    }

    #[test]
    fn external_descriptor_is_registered_but_not_locally_performable() {
        let mut registry = DispatchRegistry::new();
        registry.register(HandlerSpec::external_descriptor("PeerOnlyJob", "peer-queue"));
        let spec = registry.resolve("PeerOnlyJob").unwrap();
        assert!(matches!(spec.handler, HandlerEntry::ExternalDescriptor));

        let misrouted = PgflowError::ExternalJobMisrouted { job_id: Uuid::new_v4() };
        assert!(matches!(misrouted, PgflowError::ExternalJobMisrouted { .. }));
    }
}

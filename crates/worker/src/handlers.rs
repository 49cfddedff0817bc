//! Example handlers wired into the `DispatchRegistry` at startup. Real
//! deployments replace these with their own `JobHandler` implementations;
//! these exist to exercise the runtime end to end (the "Echo" scenario
//! from spec §8 and a couple of handlers that exercise retry/discard).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use postgresflow::dispatch::{DispatchRegistry, HandlerSpec, JobHandler, Outcome};
use serde_json::Value;

/// Succeeds immediately, echoing its arguments back into the log. Spec
/// §8 scenario 1.
struct EchoJob;

#[async_trait]
impl JobHandler for EchoJob {
    async fn perform(&self, arguments: &[Value]) -> Outcome {
        tracing::info!(target: "worker::echo", ?arguments, "echo");
        Outcome::Ok
    }
}

/// Fails every attempt until `succeed_on_attempt`, then succeeds. Spec §8
/// scenarios 2 and 3 (retry-then-succeed, exhaustion) both exercise this
/// shape with different `max_attempts`.
struct FlakyJob {
    attempts: AtomicU32,
    succeed_on_attempt: u32,
}

#[async_trait]
impl JobHandler for FlakyJob {
    async fn perform(&self, _arguments: &[Value]) -> Outcome {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt >= self.succeed_on_attempt {
            Outcome::Ok
        } else {
            Outcome::Error(format!("boom on attempt {attempt}"))
        }
    }
}

/// Always discards without retrying — exercises the `{:discard, reason}`
/// outcome path.
struct DiscardJob;

#[async_trait]
impl JobHandler for DiscardJob {
    async fn perform(&self, _arguments: &[Value]) -> Outcome {
        Outcome::Discard("not worth retrying".to_string())
    }
}

/// Snoozes once then succeeds — exercises the `:snooze` outcome path,
/// which must not increment `executions_count`.
struct SnoozeThenSucceedJob {
    snoozed: AtomicU32,
}

#[async_trait]
impl JobHandler for SnoozeThenSucceedJob {
    async fn perform(&self, _arguments: &[Value]) -> Outcome {
        if self.snoozed.fetch_add(1, Ordering::SeqCst) == 0 {
            Outcome::Snooze(5)
        } else {
            Outcome::Ok
        }
    }
}

pub fn build_registry() -> Arc<DispatchRegistry> {
    let mut registry = DispatchRegistry::new();

    registry.register(HandlerSpec::local("EchoJob", Arc::new(EchoJob)));

    registry.register(
        HandlerSpec::local(
            "FlakyJob",
            Arc::new(FlakyJob {
                attempts: AtomicU32::new(0),
                succeed_on_attempt: 2,
            }),
        )
        .max_attempts(3)
        .backoff(1, 60),
    );

    registry.register(HandlerSpec::local("DiscardJob", Arc::new(DiscardJob)));

    registry.register(HandlerSpec::local(
        "SnoozeThenSucceedJob",
        Arc::new(SnoozeThenSucceedJob {
            snoozed: AtomicU32::new(0),
        }),
    ));

    // A peer-runtime-owned queue this process knows how to route to but
    // never performs locally (spec §4.3's "external-only descriptor").
    registry.register(HandlerSpec::external_descriptor("PeerMailerJob", "mailers"));

    Arc::new(registry)
}

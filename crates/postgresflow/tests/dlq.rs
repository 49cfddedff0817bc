// tests/dlq.rs
//
// Terminal-without-retry paths from spec §4.7 step 6: `{:discard, reason}`
// discards immediately (no retry, regardless of max_attempts), an
// unregistered `job_class` discards as `UnknownHandler`, and an
// external-only descriptor performed locally discards as
// `ExternalJobMisrouted`.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{build_runner, register_process, setup_db, unique_queue};
use postgresflow::dispatch::{DispatchRegistry, HandlerSpec, JobHandler, Outcome};
use postgresflow::jobs::model::NewJob;
use postgresflow::jobs::JobsRepo;
use postgresflow::serialization::JobEnvelope;
use serde_json::Value;

struct AlwaysDiscards;

#[async_trait]
impl JobHandler for AlwaysDiscards {
    async fn perform(&self, _arguments: &[Value]) -> Outcome {
        Outcome::Discard("not worth retrying".to_string())
    }
}

async fn enqueue(jobs: &JobsRepo, queue: &str, job_class: &str) -> uuid::Uuid {
    let mut envelope = JobEnvelope::new(job_class.to_string(), vec![]);
    envelope.queue_name = queue.to_string();
    jobs.enqueue(NewJob::new(job_class, envelope.to_value()).queue(queue))
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn discard_outcome_is_immediate_regardless_of_max_attempts() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("dlq-discard");

    let mut registry = DispatchRegistry::new();
    registry.register(HandlerSpec::local("DiscardJob", Arc::new(AlwaysDiscards)).max_attempts(25));

    let process_id = register_process(&db.pool).await;
    let runner = build_runner(&db.pool, Arc::new(registry), process_id).await;

    let job_id = enqueue(&jobs, &queue, "DiscardJob").await;
    assert!(runner.perform_now(job_id).await.unwrap());

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert!(job.finished_at.is_some());
    assert_eq!(job.executions_count, 1, "discard does not retry even with attempts remaining");
    assert_eq!(job.error.as_deref(), Some("not worth retrying"));
}

#[tokio::test]
async fn unregistered_job_class_is_discarded_as_unknown_handler() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("dlq-unknown");

    let registry = DispatchRegistry::new();
    let process_id = register_process(&db.pool).await;
    let runner = build_runner(&db.pool, Arc::new(registry), process_id).await;

    let job_id = enqueue(&jobs, &queue, "NoSuchHandler").await;
    assert!(runner.perform_now(job_id).await.unwrap());

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert!(job.finished_at.is_some());
    assert!(job.error.as_deref().unwrap().contains("UnknownHandler"));
}

#[tokio::test]
async fn external_descriptor_performed_locally_is_discarded_as_misrouted() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("dlq-misrouted");

    let mut registry = DispatchRegistry::new();
    registry.register(HandlerSpec::external_descriptor("PeerOnlyJob", &queue));
    let process_id = register_process(&db.pool).await;
    let runner = build_runner(&db.pool, Arc::new(registry), process_id).await;

    let job_id = enqueue(&jobs, &queue, "PeerOnlyJob").await;
    assert!(runner.perform_now(job_id).await.unwrap());

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert!(job.finished_at.is_some());
    assert!(job.error.as_deref().unwrap().contains("externally-owned"));
}

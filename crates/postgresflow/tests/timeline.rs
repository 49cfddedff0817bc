// crates/postgresflow/tests/timeline.rs
//
// The admin surface's per-job timeline (SPEC_FULL §6): derived state plus
// the ordered execution history for one job.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{build_runner, register_process, setup_db, unique_queue};
use postgresflow::dispatch::{DispatchRegistry, HandlerSpec, JobHandler, Outcome};
use postgresflow::jobs::model::NewJob;
use postgresflow::jobs::timeline::build_timeline;
use postgresflow::jobs::{ExecutionsRepo, JobsRepo};
use postgresflow::serialization::JobEnvelope;
use serde_json::Value;

struct SucceedsOnce;

#[async_trait]
impl JobHandler for SucceedsOnce {
    async fn perform(&self, _arguments: &[Value]) -> Outcome {
        Outcome::Ok
    }
}

#[tokio::test]
async fn timeline_reports_derived_state_and_execution_history() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let executions = ExecutionsRepo::new(db.pool.clone());
    let queue = unique_queue("timeline");

    let mut registry = DispatchRegistry::new();
    registry.register(HandlerSpec::local("EchoJob", Arc::new(SucceedsOnce)));
    let process_id = register_process(&db.pool).await;
    let runner = build_runner(&db.pool, Arc::new(registry), process_id).await;

    let mut envelope = JobEnvelope::new("EchoJob".to_string(), vec![serde_json::json!("hi")]);
    envelope.queue_name = queue.clone();
    let job = jobs
        .enqueue(NewJob::new("EchoJob", envelope.to_value()).queue(&queue))
        .await
        .unwrap();

    assert!(runner.perform_now(job.id).await.unwrap());

    let timeline = build_timeline(&jobs, &executions, job.id).await.unwrap().unwrap();
    assert_eq!(timeline.job_id, job.id);
    assert_eq!(timeline.state, "succeeded");
    assert_eq!(timeline.executions_count, 1);
    assert!(timeline.last_error.is_none());
    assert_eq!(timeline.executions.len(), 1);
    assert!(timeline.executions[0].finished_at.is_some());
    assert!(timeline.executions[0].error.is_none());
}

#[tokio::test]
async fn timeline_is_none_for_an_unknown_job() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let executions = ExecutionsRepo::new(db.pool.clone());

    let missing = build_timeline(&jobs, &executions, uuid::Uuid::new_v4()).await.unwrap();
    assert!(missing.is_none());
}

// crates/postgresflow/tests/scheduling.rs
//
// Dequeue candidate selection (spec §4.1/§4.5/§4.7 step 1): a job whose
// `scheduled_at` is in the future is not a candidate; once it is in the
// past it becomes one, and ordering within a queue follows
// (priority asc NULLS LAST, created_at asc) per spec §8.

mod common;

use chrono::{Duration, Utc};
use common::{insert_scheduled_job, setup_db, unique_queue};
use postgresflow::jobs::repo::DequeueOrdering;
use postgresflow::jobs::{JobsRepo, NewJob};

#[tokio::test]
async fn future_scheduled_job_is_not_a_candidate_until_due() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("scheduling");

    let future_id = insert_scheduled_job(&db.pool, &queue, Utc::now() + Duration::seconds(60)).await;

    let candidates = jobs
        .fetch_candidates(Some(&[queue.clone()]), &DequeueOrdering::default(), 10)
        .await
        .unwrap();
    assert!(candidates.iter().all(|c| c.id != future_id));

    let past_id = insert_scheduled_job(&db.pool, &queue, Utc::now() - Duration::seconds(1)).await;
    let candidates = jobs
        .fetch_candidates(Some(&[queue.clone()]), &DequeueOrdering::default(), 10)
        .await
        .unwrap();
    assert!(candidates.iter().any(|c| c.id == past_id));
}

#[tokio::test]
async fn dequeue_orders_by_priority_then_created_at() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("scheduling-order");

    let high = jobs
        .enqueue(NewJob::new("TestJob", serde_json::json!({})).queue(&queue).priority(1))
        .await
        .unwrap();
    let mid = jobs
        .enqueue(NewJob::new("TestJob", serde_json::json!({})).queue(&queue).priority(5))
        .await
        .unwrap();
    let null_priority = jobs
        .enqueue(NewJob::new("TestJob", serde_json::json!({})).queue(&queue))
        .await
        .unwrap();

    let candidates = jobs
        .fetch_candidates(Some(&[queue.clone()]), &DequeueOrdering::default(), 10)
        .await
        .unwrap();

    let ids: Vec<_> = candidates.iter().map(|c| c.id).collect();
    let pos_high = ids.iter().position(|&id| id == high.id).unwrap();
    let pos_mid = ids.iter().position(|&id| id == mid.id).unwrap();
    let pos_null = ids.iter().position(|&id| id == null_priority.id).unwrap();

    assert!(pos_high < pos_mid, "priority 1 must precede priority 5");
    assert!(pos_mid < pos_null, "any priority must precede NULL (NULLS LAST)");
}

// tests/cron_idempotency.rs
//
// Spec §8 scenario 5: two processes racing to materialize the same
// `(cron_key, cron_at)` tick must leave exactly one row. The partial
// unique index on `good_jobs` (cron_key, cron_at) is what actually
// enforces this; `enqueue_cron_tick` just turns the resulting unique
// violation into `Ok(None)` instead of an error.

mod common;

use chrono::Utc;
use common::{setup_db, unique_queue};
use postgresflow::jobs::model::NewJob;
use postgresflow::jobs::JobsRepo;
use postgresflow::serialization::JobEnvelope;

fn tick_job(queue: &str, cron_key: &str, cron_at: chrono::DateTime<Utc>) -> NewJob {
    let mut envelope = JobEnvelope::new("TickJob".to_string(), vec![]);
    envelope.queue_name = queue.to_string();
    NewJob {
        cron_key: Some(cron_key.to_string()),
        cron_at: Some(cron_at),
        ..NewJob::new("TickJob", envelope.to_value()).queue(queue)
    }
}

#[tokio::test]
async fn only_one_row_materializes_for_a_racing_tick() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("cron");
    let cron_at = Utc::now();

    let first = jobs.enqueue_cron_tick(tick_job(&queue, "tick", cron_at)).await.unwrap();
    let second = jobs.enqueue_cron_tick(tick_job(&queue, "tick", cron_at)).await.unwrap();

    assert!(first.is_some(), "the first racer materializes the tick");
    assert!(second.is_none(), "the second racer observes the duplicate as a no-op");

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM good_jobs WHERE cron_key = $1 AND cron_at = $2",
    )
    .bind("tick")
    .bind(cron_at)
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn distinct_cron_at_values_each_materialize_their_own_row() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("cron-distinct");

    let first_tick = Utc::now();
    let second_tick = first_tick + chrono::Duration::minutes(1);

    jobs.enqueue_cron_tick(tick_job(&queue, "tick", first_tick)).await.unwrap();
    jobs.enqueue_cron_tick(tick_job(&queue, "tick", second_tick)).await.unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM good_jobs WHERE cron_key = $1")
        .bind("tick")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
}

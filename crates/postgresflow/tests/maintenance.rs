// tests/maintenance.rs
//
// Cleanup Loop (spec §4.9): retention deletes finished jobs past the
// configured horizon, gated by `cleanup_discarded_jobs` for discarded
// rows; succeeded jobs inside the horizon are left alone.

mod common;

use chrono::{Duration, Utc};
use common::{setup_db, unique_queue};
use postgresflow::jobs::model::NewJob;
use postgresflow::jobs::JobsRepo;
use postgresflow::serialization::JobEnvelope;

async fn enqueue(jobs: &JobsRepo, queue: &str) -> uuid::Uuid {
    let mut envelope = JobEnvelope::new("TestJob".to_string(), vec![]);
    envelope.queue_name = queue.to_string();
    jobs.enqueue(NewJob::new("TestJob", envelope.to_value()).queue(queue))
        .await
        .unwrap()
        .id
}

async fn force_finished(pool: &sqlx::PgPool, job_id: uuid::Uuid, finished_at: chrono::DateTime<Utc>, error: Option<&str>) {
    sqlx::query("UPDATE good_jobs SET finished_at = $2, error = $3 WHERE id = $1")
        .bind(job_id)
        .bind(finished_at)
        .bind(error)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn retention_deletes_old_succeeded_jobs_past_the_horizon() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("maintenance-retention");

    let old_succeeded = enqueue(&jobs, &queue).await;
    force_finished(&db.pool, old_succeeded, Utc::now() - Duration::days(30), None).await;

    let recent_succeeded = enqueue(&jobs, &queue).await;
    force_finished(&db.pool, recent_succeeded, Utc::now() - Duration::hours(1), None).await;

    let cutoff = Utc::now() - Duration::days(14);
    let deleted = jobs.delete_finished_before(cutoff, true, 500).await.unwrap();

    assert_eq!(deleted, 1);
    assert!(jobs.get(old_succeeded).await.unwrap().is_none());
    assert!(jobs.get(recent_succeeded).await.unwrap().is_some());
}

#[tokio::test]
async fn retention_skips_discarded_jobs_unless_enabled() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("maintenance-discarded");

    let old_discarded = enqueue(&jobs, &queue).await;
    force_finished(&db.pool, old_discarded, Utc::now() - Duration::days(30), Some("boom")).await;

    let cutoff = Utc::now() - Duration::days(14);

    let deleted = jobs.delete_finished_before(cutoff, false, 500).await.unwrap();
    assert_eq!(deleted, 0, "cleanup_discarded_jobs=false must preserve discarded rows");
    assert!(jobs.get(old_discarded).await.unwrap().is_some());

    let deleted = jobs.delete_finished_before(cutoff, true, 500).await.unwrap();
    assert_eq!(deleted, 1);
    assert!(jobs.get(old_discarded).await.unwrap().is_none());
}

#[tokio::test]
async fn retention_leaves_unfinished_jobs_untouched() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("maintenance-unfinished");

    let running = enqueue(&jobs, &queue).await;

    let cutoff = Utc::now() + Duration::days(365);
    let deleted = jobs.delete_finished_before(cutoff, true, 500).await.unwrap();

    assert_eq!(deleted, 0);
    assert!(jobs.get(running).await.unwrap().is_some());
}

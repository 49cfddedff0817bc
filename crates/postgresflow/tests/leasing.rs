// tests/leasing.rs
//
// Claim sequence (spec §4.1/§4.7 step 2): a session-scoped advisory lock
// on a job's id is exclusive, and queue filtering restricts which rows a
// worker will ever consider.

mod common;

use common::{insert_job, insert_job_with_class, setup_db, unique_queue};

use postgresflow::db::AdvisoryLock;
use postgresflow::jobs::repo::DequeueOrdering;
use postgresflow::jobs::JobsRepo;

#[tokio::test]
async fn advisory_lock_on_same_job_is_exclusive() {
    let db = setup_db().await;
    let queue = unique_queue("leasing");
    let job_id = insert_job(&db.pool, &queue).await;

    let first = AdvisoryLock::try_acquire(&db.pool, "good_jobs", job_id)
        .await
        .unwrap();
    assert!(first.is_some(), "first claim should succeed");

    let second = AdvisoryLock::try_acquire(&db.pool, "good_jobs", job_id)
        .await
        .unwrap();
    assert!(second.is_none(), "concurrent claim of the same job must fail");

    assert!(AdvisoryLock::is_locked(&db.pool, "good_jobs", job_id).await.unwrap());

    first.unwrap().unlock().await.unwrap();
    assert!(!AdvisoryLock::is_locked(&db.pool, "good_jobs", job_id).await.unwrap());

    let third = AdvisoryLock::try_acquire(&db.pool, "good_jobs", job_id)
        .await
        .unwrap();
    assert!(third.is_some(), "claim should succeed again once released");
}

#[tokio::test]
async fn advisory_lock_is_per_job_id() {
    let db = setup_db().await;
    let queue = unique_queue("leasing-distinct");
    let job_a = insert_job(&db.pool, &queue).await;
    let job_b = insert_job(&db.pool, &queue).await;

    let lock_a = AdvisoryLock::try_acquire(&db.pool, "good_jobs", job_a).await.unwrap();
    let lock_b = AdvisoryLock::try_acquire(&db.pool, "good_jobs", job_b).await.unwrap();
    assert!(lock_a.is_some());
    assert!(lock_b.is_some(), "a distinct job id must not contend with job_a's lock");
}

#[tokio::test]
async fn fetch_candidates_restricts_to_the_given_queues() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());

    let mailers = unique_queue("mailers");
    let default = unique_queue("default");

    let mailer_job = insert_job_with_class(&db.pool, &mailers, "MailerJob").await;
    let _default_job = insert_job_with_class(&db.pool, &default, "DefaultJob").await;

    let candidates = jobs
        .fetch_candidates(Some(&[mailers.clone()]), &DequeueOrdering::default(), 10)
        .await
        .unwrap();

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, mailer_job);
}

#[tokio::test]
async fn fetch_candidates_excludes_locked_rows() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("leasing-locked");

    let job_id = insert_job(&db.pool, &queue).await;
    let process_id = common::register_process(&db.pool).await;

    let mut lock = AdvisoryLock::try_acquire(&db.pool, "good_jobs", job_id).await.unwrap().unwrap();
    assert!(jobs.mark_running(&mut lock, job_id, process_id).await.unwrap());

    let candidates = jobs
        .fetch_candidates(Some(&[queue.clone()]), &DequeueOrdering::default(), 10)
        .await
        .unwrap();
    assert!(candidates.iter().all(|c| c.id != job_id), "running jobs are not re-offered as candidates");
}

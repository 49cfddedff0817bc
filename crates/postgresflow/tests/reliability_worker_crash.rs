// tests/reliability_worker_crash.rs
//
// Spec §8 scenario 6 ("orphan recovery"): a worker holding a job's lock
// disappears without deregistering. Once its process row is gone,
// `recover_orphaned_locks` clears `locked_by_id`/`locked_at`/`performed_at`
// and the row becomes an ordinary available candidate again.

mod common;

use common::{insert_job, setup_db, unique_queue};

use postgresflow::db::AdvisoryLock;
use postgresflow::jobs::model::JobState;
use postgresflow::jobs::repo::DequeueOrdering;
use postgresflow::jobs::JobsRepo;

#[tokio::test]
async fn orphaned_lock_is_recovered_once_its_process_disappears() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("crash-recovery");
    let job_id = insert_job(&db.pool, &queue).await;

    let crashed_process_id = common::register_process(&db.pool).await;

    let mut lock = AdvisoryLock::try_acquire(&db.pool, "good_jobs", job_id)
        .await
        .unwrap()
        .unwrap();
    assert!(jobs.mark_running(&mut lock, job_id, crashed_process_id).await.unwrap());

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.state(chrono::Utc::now()), JobState::Running);

    // The worker vanishes (SIGKILL) without deregistering or releasing
    // its session — simulated here by deleting its process row directly,
    // which is exactly what orphan recovery keys off.
    sqlx::query("DELETE FROM good_job_processes WHERE id = $1")
        .bind(crashed_process_id)
        .execute(&db.pool)
        .await
        .unwrap();

    let recovered = jobs.recover_orphaned_locks().await.unwrap();
    assert_eq!(recovered, 1);

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert!(job.locked_by_id.is_none());
    assert!(job.locked_at.is_none());
    assert!(job.performed_at.is_none());
    assert_eq!(job.state(chrono::Utc::now()), JobState::Available);

    let candidates = jobs
        .fetch_candidates(Some(&[queue.clone()]), &DequeueOrdering::default(), 10)
        .await
        .unwrap();
    assert!(
        candidates.iter().any(|c| c.id == job_id),
        "recovered job must be claimable by another worker"
    );
}

#[tokio::test]
async fn a_live_process_lock_is_not_touched_by_recovery() {
    let db = setup_db().await;
    let jobs = JobsRepo::new(db.pool.clone());
    let queue = unique_queue("crash-recovery-live");
    let job_id = insert_job(&db.pool, &queue).await;

    let live_process_id = common::register_process(&db.pool).await;
    let mut lock = AdvisoryLock::try_acquire(&db.pool, "good_jobs", job_id)
        .await
        .unwrap()
        .unwrap();
    assert!(jobs.mark_running(&mut lock, job_id, live_process_id).await.unwrap());

    let recovered = jobs.recover_orphaned_locks().await.unwrap();
    assert_eq!(recovered, 0);

    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.locked_by_id, Some(live_process_id));
}

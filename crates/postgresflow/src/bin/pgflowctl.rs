//! Small operator CLI against the `good_jobs` schema: reset the database
//! for local experimentation, seed a handful of jobs, and print a job's
//! timeline without standing up the full worker binary.

use postgresflow::jobs::model::NewJob;
use postgresflow::jobs::timeline::build_timeline;
use postgresflow::jobs::{ExecutionsRepo, JobsRepo};
use postgresflow::serialization::JobEnvelope;
use sqlx::PgPool;
use std::env;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!(
            "pgflowctl <command>\n\
             Commands:\n\
             - reset\n\
             - seed <n>\n\
             - demo\n\
             - timeline <job_id>\n\
             \n\
             Uses DATABASE_URL or TEST_DATABASE_URL.\n"
        );
        std::process::exit(2);
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .expect("DATABASE_URL or TEST_DATABASE_URL must be set");

    let pool = postgresflow::db::make_pool(&url, 5).await?;
    let jobs = JobsRepo::new(pool.clone());
    let executions = ExecutionsRepo::new(pool.clone());

    match args[1].as_str() {
        "reset" => reset(&pool).await?,
        "seed" => {
            let n: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            seed(&jobs, n).await?;
        }
        "demo" => {
            reset(&pool).await?;
            seed(&jobs, 5).await?;
            show_counts(&pool).await?;
        }
        "timeline" => {
            let id = args.get(2).expect("usage: pgflowctl timeline <job_id>");
            let job_id: Uuid = id.parse()?;
            print_timeline(&jobs, &executions, job_id).await?;
        }
        other => {
            eprintln!("Unknown command: {other}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE TABLE
            good_job_executions,
            good_job_batches,
            good_jobs,
            good_job_processes,
            good_job_settings
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(pool)
    .await?;

    println!("reset OK");
    Ok(())
}

async fn seed(jobs: &JobsRepo, n: i64) -> anyhow::Result<()> {
    for i in 0..n {
        let job_class = if i % 2 == 0 { "EchoJob" } else { "FlakyJob" };

        let mut envelope = JobEnvelope::new(job_class.to_string(), vec![]);
        envelope.queue_name = "default".to_string();
        let new_job = NewJob::new(job_class, envelope.to_value()).queue("default");

        let row = jobs.enqueue(new_job).await?;
        println!("+ inserted job {job_class} id={}", row.id);
    }
    Ok(())
}

async fn show_counts(pool: &PgPool) -> anyhow::Result<()> {
    let available: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM good_jobs
        WHERE finished_at IS NULL AND performed_at IS NULL AND locked_by_id IS NULL
        "#,
    )
    .fetch_one(pool)
    .await?;
    let running: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM good_jobs WHERE finished_at IS NULL AND performed_at IS NOT NULL",
    )
    .fetch_one(pool)
    .await?;
    let discarded: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM good_jobs WHERE finished_at IS NOT NULL AND error IS NOT NULL",
    )
    .fetch_one(pool)
    .await?;

    println!("jobs: available={available} running={running} discarded={discarded}");
    Ok(())
}

async fn print_timeline(jobs: &JobsRepo, executions: &ExecutionsRepo, job_id: Uuid) -> anyhow::Result<()> {
    match build_timeline(jobs, executions, job_id).await? {
        Some(timeline) => {
            println!(
                "JOB: id={} active_job_id={} queue={} class={} state={} scheduled_at={:?} executions_count={} last_error={:?}",
                timeline.job_id,
                timeline.active_job_id,
                timeline.queue_name,
                timeline.job_class,
                timeline.state,
                timeline.scheduled_at,
                timeline.executions_count,
                timeline.last_error,
            );
            for execution in timeline.executions {
                println!(
                    "{} | finished_at={:?} | error={:?} | latency_ms={:?}",
                    execution.created_at, execution.finished_at, execution.error, execution.latency_ms
                );
            }
        }
        None => println!("no such job: {job_id}"),
    }
    Ok(())
}

//! Handlers for the one-shot commands: everything except `worker`.

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use uuid::Uuid;

use queuectl_core::core::api::{parse_run_at, QueueApi};
use queuectl_core::core::clock::SystemClock;
use queuectl_core::core::job::{Job, JobState};
use queuectl_core::core::store::StoreError;
use queuectl_sqlite::{init_store, open_store, SqliteStore};

use crate::table;

const EXIT_NOT_FOUND: u8 = 1;

async fn open_api(db: &Path) -> anyhow::Result<QueueApi<SqliteStore, SystemClock>> {
    let pool = open_store(db).await?;
    Ok(QueueApi::new(SqliteStore::with_pool(pool), SystemClock))
}

pub async fn initdb(db: &Path) -> anyhow::Result<ExitCode> {
    init_store(db).await?;
    println!("Store initialized at {}", db.display());
    Ok(ExitCode::SUCCESS)
}

pub async fn add(
    db: &Path,
    command: String,
    priority: i32,
    max_retries: u32,
    run_at: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let run_at = run_at.map(parse_run_at).transpose()?;
    let api = open_api(db).await?;
    let id = api.enqueue(command, priority, max_retries, run_at).await?;
    println!("{id}");
    Ok(ExitCode::SUCCESS)
}

pub async fn list(
    db: &Path,
    state: Option<JobState>,
    dlq: bool,
    limit: u32,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let api = open_api(db).await?;
    // Pending is the default view, mirroring what an operator checks first.
    let state = state.or(Some(JobState::Pending)).filter(|_| !dlq);
    let jobs = api.list(state, dlq, Some(limit)).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&jobs).context("failed to render jobs as JSON")?
        );
    } else if jobs.is_empty() {
        println!("No jobs.");
    } else {
        print!("{}", table::render(&jobs));
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn show(db: &Path, id: Uuid, json: bool) -> anyhow::Result<ExitCode> {
    let api = open_api(db).await?;
    let job = match api.get(id).await {
        Ok(job) => job,
        Err(StoreError::NotFound(_)) => {
            eprintln!("job {id} not found");
            return Ok(ExitCode::from(EXIT_NOT_FOUND));
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&job).context("failed to render job as JSON")?
        );
    } else {
        print_job(&job);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn requeue(db: &Path, id: Uuid) -> anyhow::Result<ExitCode> {
    let api = open_api(db).await?;
    match api.requeue(id).await {
        Ok(()) => {
            println!("Job {id} requeued to pending.");
            Ok(ExitCode::SUCCESS)
        }
        Err(StoreError::NotFound(_)) => {
            eprintln!("job {id} not found");
            Ok(ExitCode::from(EXIT_NOT_FOUND))
        }
        Err(StoreError::NotDead { state, .. }) => {
            eprintln!("job {id} is in state '{state}', only dead jobs can be requeued");
            Ok(ExitCode::from(EXIT_NOT_FOUND))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_job(job: &Job) {
    println!("Id:          {}", job.id);
    println!("State:       {}", job.state);
    println!("Command:     {}", job.command);
    println!("Priority:    {}", job.priority);
    println!("Attempts:    {} / {}", job.attempts, job.max_retries + 1);
    println!("Created:     {}", job.created_at.to_rfc3339());
    println!("Updated:     {}", job.updated_at.to_rfc3339());
    println!("Run at:      {}", job.run_at.to_rfc3339());
    match job.last_exit_code {
        Some(code) => println!("Exit code:   {code}"),
        None => println!("Exit code:   -"),
    }
    if let Some(worker_id) = &job.worker_id {
        println!("Worker:      {worker_id}");
    }
    if let Some(claimed_at) = job.claimed_at {
        println!("Claimed at:  {}", claimed_at.to_rfc3339());
    }
    if let Some(stdout) = &job.stdout_tail {
        if !stdout.is_empty() {
            println!("--- stdout ---");
            println!("{stdout}");
        }
    }
    if let Some(stderr) = &job.stderr_tail {
        if !stderr.is_empty() {
            println!("--- stderr ---");
            println!("{stderr}");
        }
    }
}

mod commands;
mod supervisor;
mod table;
mod worker_process;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use queuectl_core::core::job::JobState;

#[derive(Debug, Parser)]
#[command(
    name = "queuectl",
    version,
    about = "Persistent background job queue over a local SQLite file",
    propagate_version = true
)]
struct Cli {
    /// Path to the queue database file.
    #[arg(long = "db", global = true, default_value = "queue.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Initialize the job queue database (idempotent).
    Initdb,

    /// Enqueue a shell command as a new job.
    Add {
        /// The command line, handed to a shell at execution time.
        command: String,
        /// Job priority; higher is claimed first.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
        /// Failed attempts allowed before the job moves to the DLQ.
        #[arg(long = "max-retries", default_value_t = 3)]
        max_retries: u32,
        /// Earliest start time, RFC 3339 with an explicit offset.
        #[arg(long = "run-at")]
        run_at: Option<String>,
    },

    /// List jobs, pending by default.
    List {
        /// Filter by state.
        #[arg(long)]
        state: Option<JobState>,
        /// Show the dead-letter queue (same as --state dead).
        #[arg(long)]
        dlq: bool,
        /// Maximum number of jobs to show.
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Show one job in full, including captured output.
    Show {
        id: uuid::Uuid,
        /// Emit JSON instead of the formatted view.
        #[arg(long)]
        json: bool,
    },

    /// Move a dead job back to pending with a fresh retry budget.
    Requeue { id: uuid::Uuid },

    /// Run a pool of worker processes until signalled.
    Worker {
        /// Number of worker processes.
        #[arg(short = 'n', long = "workers", default_value_t = 1)]
        workers: usize,
        /// Base for exponential retry backoff (base ^ attempts seconds).
        #[arg(long = "backoff-base", default_value_t = 2.0)]
        backoff_base: f64,
        /// Per-job execution timeout in seconds. Unbounded when absent.
        #[arg(long)]
        timeout: Option<u64>,
        /// Queue poll interval in seconds.
        #[arg(long = "poll-interval", default_value_t = 1.0)]
        poll_interval: f64,
        /// Seconds workers get to finish their current job on shutdown.
        #[arg(long = "grace-period", default_value_t = 30)]
        grace_period: u64,
    },

    /// Internal: one worker process. Spawned by `worker`.
    #[command(name = "worker-process", hide = true)]
    WorkerProcess {
        #[arg(long = "backoff-base", default_value_t = 2.0)]
        backoff_base: f64,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long = "poll-interval", default_value_t = 1.0)]
        poll_interval: f64,
        #[arg(long = "grace-period", default_value_t = 30)]
        grace_period: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Worker processes are single-threaded by design; everything they block
    // on is either the store or a child process.
    let runtime = match &cli.command {
        Commands::WorkerProcess { .. } => {
            tokio::runtime::Builder::new_current_thread().enable_all().build()
        }
        _ => tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build(),
    };
    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Initdb => commands::initdb(&cli.db).await,
        Commands::Add {
            command,
            priority,
            max_retries,
            run_at,
        } => commands::add(&cli.db, command, priority, max_retries, run_at.as_deref()).await,
        Commands::List {
            state,
            dlq,
            limit,
            json,
        } => commands::list(&cli.db, state, dlq, limit, json).await,
        Commands::Show { id, json } => commands::show(&cli.db, id, json).await,
        Commands::Requeue { id } => commands::requeue(&cli.db, id).await,
        Commands::Worker {
            workers,
            backoff_base,
            timeout,
            poll_interval,
            grace_period,
        } => {
            supervisor::run(
                &cli.db,
                supervisor::SupervisorOptions {
                    workers,
                    backoff_base,
                    timeout,
                    poll_interval,
                    grace_period: std::time::Duration::from_secs(grace_period),
                },
            )
            .await
        }
        Commands::WorkerProcess {
            backoff_base,
            timeout,
            poll_interval,
            grace_period,
        } => {
            worker_process::run(
                &cli.db,
                worker_process::WorkerProcessOptions {
                    backoff_base,
                    timeout,
                    poll_interval,
                    grace_period: std::time::Duration::from_secs(grace_period),
                },
            )
            .await
        }
    }
}

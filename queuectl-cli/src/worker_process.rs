//! Entry point of one worker OS process, spawned by the supervisor.
//!
//! Installs its own SIGINT/SIGTERM handlers so a shutdown signal cancels the
//! loop cooperatively: the current job runs to completion (or its timeout)
//! and no new job is claimed afterwards.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration as StdDuration;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use queuectl_core::core::backoff::BackoffPolicy;
use queuectl_core::core::clock::SystemClock;
use queuectl_core::runner::executor::ShellExecutor;
use queuectl_core::runner::worker::{generate_worker_id, Worker, WorkerOptions};
use queuectl_sqlite::{open_store, SqliteStore};

#[derive(Debug, Clone)]
pub struct WorkerProcessOptions {
    pub backoff_base: f64,
    pub timeout: Option<u64>,
    pub poll_interval: f64,
    pub grace_period: StdDuration,
}

/// Orphaned-claim threshold: `timeout + 2 × grace`, never below 5 minutes.
/// Conservative on purpose; reaping a live worker's claim is the one
/// mistake this system must not make.
fn reap_threshold(timeout: Option<StdDuration>, grace: StdDuration) -> chrono::Duration {
    let secs = timeout.unwrap_or_default().as_secs() + 2 * grace.as_secs();
    chrono::Duration::seconds(secs.max(300) as i64)
}

pub async fn run(db: &Path, options: WorkerProcessOptions) -> anyhow::Result<ExitCode> {
    let pool = open_store(db).await?;
    let store = SqliteStore::new(pool, BackoffPolicy::new(options.backoff_base));

    let timeout = options.timeout.map(StdDuration::from_secs);
    let worker_options = WorkerOptions {
        poll_interval: StdDuration::from_secs_f64(options.poll_interval.max(0.01)),
        job_timeout: timeout,
        reap_after: reap_threshold(timeout, options.grace_period),
        ..WorkerOptions::default()
    };

    let worker = Worker::new(
        generate_worker_id(),
        store,
        ShellExecutor::new(),
        SystemClock,
        worker_options,
    );

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        info!("shutdown signal received, finishing current job");
        trigger.cancel();
    });

    worker.run(shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_threshold_has_a_floor() {
        assert_eq!(
            reap_threshold(None, StdDuration::from_secs(30)),
            chrono::Duration::seconds(300)
        );
        assert_eq!(
            reap_threshold(Some(StdDuration::from_secs(10)), StdDuration::from_secs(30)),
            chrono::Duration::seconds(300)
        );
    }

    #[test]
    fn reap_threshold_scales_with_timeout_and_grace() {
        assert_eq!(
            reap_threshold(
                Some(StdDuration::from_secs(600)),
                StdDuration::from_secs(60)
            ),
            chrono::Duration::seconds(720)
        );
    }
}

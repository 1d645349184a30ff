//! The supervisor behind `queuectl worker`: forks N worker OS processes and
//! owns their lifecycle.
//!
//! Workers are processes rather than threads so a crashing job cannot take
//! its siblings down, and so every worker stays single-threaded over its own
//! store connection. Shutdown is two-phase: SIGTERM to every child, then
//! SIGKILL for whatever outlives the grace period.

use std::path::Path;
use std::process::ExitCode;
use std::time::{Duration as StdDuration, Instant};

use anyhow::Context;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub workers: usize,
    pub backoff_base: f64,
    pub timeout: Option<u64>,
    pub poll_interval: f64,
    pub grace_period: StdDuration,
}

/// Restarts allowed across the pool per sliding minute. Beyond this the
/// slot is abandoned rather than fork-storming a broken configuration.
const RESTART_BUDGET_PER_MINUTE: usize = 5;

const EXIT_FORCED: u8 = 1;

pub async fn run(db: &Path, options: SupervisorOptions) -> anyhow::Result<ExitCode> {
    anyhow::ensure!(options.workers >= 1, "at least one worker is required");
    let exe = std::env::current_exe().context("failed to locate own executable")?;

    info!(workers = options.workers, db = %db.display(), "starting worker pool");
    let mut slots: Vec<Option<Child>> = Vec::with_capacity(options.workers);
    for _ in 0..options.workers {
        slots.push(Some(spawn_worker(&exe, db, &options)?));
    }

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut restarts: Vec<Instant> = Vec::new();
    let mut check = tokio::time::interval(StdDuration::from_millis(500));
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = check.tick() => {
                restart_crashed(&mut slots, &mut restarts, &exe, db, &options);
                if slots.iter().all(Option::is_none) {
                    error!("all worker slots abandoned, giving up");
                    return Ok(ExitCode::from(EXIT_FORCED));
                }
            }
        }
    }

    info!("shutdown signal received, draining workers");
    let forced = drain(&mut slots, options.grace_period).await;
    if forced {
        warn!("some workers exceeded the grace period and were killed");
        Ok(ExitCode::from(EXIT_FORCED))
    } else {
        info!("all workers stopped");
        Ok(ExitCode::SUCCESS)
    }
}

fn spawn_worker(exe: &Path, db: &Path, options: &SupervisorOptions) -> anyhow::Result<Child> {
    let mut cmd = Command::new(exe);
    cmd.arg("worker-process")
        .arg("--db")
        .arg(db)
        .arg("--backoff-base")
        .arg(options.backoff_base.to_string())
        .arg("--poll-interval")
        .arg(options.poll_interval.to_string())
        .arg("--grace-period")
        .arg(options.grace_period.as_secs().to_string());
    if let Some(timeout) = options.timeout {
        cmd.arg("--timeout").arg(timeout.to_string());
    }
    cmd.kill_on_drop(true);

    let child = cmd.spawn().context("failed to spawn worker process")?;
    info!(pid = child.id(), "worker process started");
    Ok(child)
}

/// Respawn exited workers within the restart budget; abandon their slots
/// beyond it.
fn restart_crashed(
    slots: &mut [Option<Child>],
    restarts: &mut Vec<Instant>,
    exe: &Path,
    db: &Path,
    options: &SupervisorOptions,
) {
    for slot in slots.iter_mut() {
        let Some(child) = slot else { continue };
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(%status, "worker exited unexpectedly");
                let now = Instant::now();
                restarts.retain(|at| now.duration_since(*at) < StdDuration::from_secs(60));
                if restarts.len() >= RESTART_BUDGET_PER_MINUTE {
                    error!("restart budget exhausted, abandoning worker slot");
                    *slot = None;
                } else {
                    restarts.push(now);
                    match spawn_worker(exe, db, options) {
                        Ok(fresh) => *slot = Some(fresh),
                        Err(e) => {
                            error!(error = %e, "failed to respawn worker");
                            *slot = None;
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to poll worker status"),
        }
    }
}

/// SIGTERM everyone, then wait out a shared grace deadline. Returns whether
/// any worker had to be SIGKILLed.
async fn drain(slots: &mut [Option<Child>], grace: StdDuration) -> bool {
    for child in slots.iter().flatten() {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    let deadline = Instant::now() + grace;
    let mut forced = false;
    for slot in slots.iter_mut() {
        let Some(child) = slot else { continue };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "worker exited"),
            Ok(Err(e)) => warn!(error = %e, "failed waiting for worker"),
            Err(_) => {
                warn!(pid = child.id(), "worker exceeded grace period, killing");
                forced = true;
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
    forced
}

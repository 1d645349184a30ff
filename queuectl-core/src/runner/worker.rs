//! The per-process worker loop: claim, execute, record, repeat.
//!
//! Retry policy lives entirely in the store's state machine; this loop never
//! re-runs a job on its own. Job-level failures become recorded outcomes,
//! store-level failures are retried with bounded backoff, and shutdown is
//! cooperative: the in-flight job always runs to completion (or timeout)
//! before the loop exits.

use std::time::{Duration as StdDuration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::clock::Clock;
use crate::core::job::{Job, JobState};
use crate::core::store::{JobStore, StoreError};

/// Tuning knobs for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Sleep between polls when the queue is empty (default 1 s).
    pub poll_interval: StdDuration,
    /// Fraction by which the poll sleep is jittered, to keep a pool of
    /// workers from hammering the store in lockstep (default 0.25).
    pub poll_jitter: f64,
    /// Per-job execution timeout. `None` means unbounded.
    pub job_timeout: Option<StdDuration>,
    /// Age of a `processing` claim after which it is considered orphaned.
    pub reap_after: chrono::Duration,
    /// How often this worker sweeps for orphans (default 30 s).
    pub reap_interval: StdDuration,
    /// Consecutive store failures tolerated before the loop gives up.
    pub store_retry_limit: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: StdDuration::from_secs(1),
            poll_jitter: 0.25,
            job_timeout: None,
            reap_after: chrono::Duration::minutes(5),
            reap_interval: StdDuration::from_secs(30),
            store_retry_limit: 5,
        }
    }
}

/// A single-threaded worker: stable identity, a store, an executor, a clock.
pub struct Worker<S, E, C> {
    worker_id: String,
    store: S,
    executor: E,
    clock: C,
    options: WorkerOptions,
}

/// A worker identity unique within a supervisor run: `pid-uuidv7`.
pub fn generate_worker_id() -> String {
    format!("{}-{}", std::process::id(), Uuid::now_v7())
}

impl<S, E, C> Worker<S, E, C>
where
    S: JobStore,
    E: crate::runner::executor::Executor,
    C: Clock,
{
    pub fn new(worker_id: String, store: S, executor: E, clock: C, options: WorkerOptions) -> Self {
        Self {
            worker_id,
            store,
            executor,
            clock,
            options,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Returns an error only when the store stayed unreachable past the
    /// retry budget; everything job-level is absorbed into outcomes.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), StoreError> {
        info!(worker_id = %self.worker_id, "worker started");
        let mut last_reap: Option<Instant> = None;

        while !shutdown.is_cancelled() {
            if last_reap.is_none_or(|at| at.elapsed() >= self.options.reap_interval) {
                self.sweep_orphans().await;
                last_reap = Some(Instant::now());
            }

            match self.claim_with_retry(&shutdown).await? {
                Some(job) => self.process(job).await,
                None => {
                    let sleep = jittered(self.options.poll_interval, self.options.poll_jitter);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn sweep_orphans(&self) {
        match self
            .store
            .reap_orphans(self.options.reap_after, self.clock.now())
            .await
        {
            Ok(reaped) if !reaped.is_empty() => {
                warn!(count = reaped.len(), "returned orphaned jobs to the queue")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "orphan sweep failed"),
        }
    }

    /// Claim the next ready job, retrying store-level failures with bounded
    /// exponential backoff. `Ok(None)` when the queue is empty or shutdown
    /// was requested mid-retry.
    async fn claim_with_retry(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<Job>, StoreError> {
        let mut failures = 0u32;
        loop {
            match self.store.claim_one(&self.worker_id, self.clock.now()).await {
                Ok(job) => return Ok(job),
                Err(e) if e.is_retryable() && failures + 1 < self.options.store_retry_limit => {
                    failures += 1;
                    let pause = store_retry_delay(failures);
                    warn!(error = %e, attempt = failures, ?pause, "store unavailable, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = shutdown.cancelled() => return Ok(None),
                    }
                }
                Err(e) => {
                    error!(error = %e, "giving up claiming after repeated store failures");
                    return Err(e);
                }
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, worker_id = %self.worker_id, attempt = job.attempts + 1))]
    async fn process(&self, job: Job) {
        debug!(command = %job.command, "executing");
        let outcome = self
            .executor
            .execute(&job.command, self.options.job_timeout)
            .await;

        let mut failures = 0u32;
        loop {
            match self
                .store
                .record_outcome(job.id, &self.worker_id, &outcome, self.clock.now())
                .await
            {
                Ok(JobState::Completed) => {
                    info!(outcome = outcome.label(), "job completed");
                    return;
                }
                Ok(JobState::FailedTransient) => {
                    warn!(outcome = outcome.label(), "job failed, retry scheduled");
                    return;
                }
                Ok(JobState::Dead) => {
                    warn!(outcome = outcome.label(), "retries exhausted, job moved to DLQ");
                    return;
                }
                Ok(state) => {
                    // record_outcome only yields terminal-or-retry states.
                    error!(%state, "unexpected post-outcome state");
                    return;
                }
                Err(StoreError::LostClaim { .. }) => {
                    warn!("claim was taken over (reaped?), dropping outcome");
                    return;
                }
                Err(e) if e.is_retryable() && failures + 1 < self.options.store_retry_limit => {
                    failures += 1;
                    let pause = store_retry_delay(failures);
                    warn!(error = %e, attempt = failures, ?pause, "recording outcome failed, backing off");
                    tokio::time::sleep(pause).await;
                }
                Err(e) => {
                    // The row stays in `processing`; the reaper will return
                    // it to the queue once the claim goes stale.
                    error!(error = %e, "could not record outcome, leaving job for the reaper");
                    return;
                }
            }
        }
    }
}

fn jittered(interval: StdDuration, jitter: f64) -> StdDuration {
    if jitter <= 0.0 {
        return interval;
    }
    let factor = rand::rng().random_range(1.0 - jitter..=1.0 + jitter);
    interval.mul_f64(factor.max(0.0))
}

fn store_retry_delay(failures: u32) -> StdDuration {
    let secs = 1u64 << failures.min(5);
    StdDuration::from_secs(secs.min(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let interval = StdDuration::from_secs(1);
        for _ in 0..100 {
            let sleep = jittered(interval, 0.25);
            assert!(sleep >= StdDuration::from_millis(750));
            assert!(sleep <= StdDuration::from_millis(1250));
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let interval = StdDuration::from_millis(1234);
        assert_eq!(jittered(interval, 0.0), interval);
    }

    #[test]
    fn store_retry_delay_grows_and_saturates() {
        assert_eq!(store_retry_delay(1), StdDuration::from_secs(2));
        assert_eq!(store_retry_delay(2), StdDuration::from_secs(4));
        assert_eq!(store_retry_delay(4), StdDuration::from_secs(16));
        assert_eq!(store_retry_delay(10), StdDuration::from_secs(30));
    }

    #[test]
    fn worker_ids_are_unique() {
        let a = generate_worker_id();
        let b = generate_worker_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&std::process::id().to_string()));
    }
}

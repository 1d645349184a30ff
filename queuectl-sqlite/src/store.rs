use anyhow::Context;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

use queuectl_core::core::backoff::BackoffPolicy;
use queuectl_core::core::job::{Job, JobFilter, JobState, NewJob};
use queuectl_core::core::outcome::{Disposition, Outcome};
use queuectl_core::core::store::{JobStore, StoreError};
use queuectl_core::core::{DateTime, Duration, Utc};

use crate::types::{datetime_to_ts, JobRow};

/// An implementation of the `JobStore` backed by SQLite.
///
/// Owns the backoff policy: the retry `run_at` is computed from the
/// post-increment attempt count read inside `record_outcome`'s own
/// transaction, so the transition stays atomic.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    backoff: BackoffPolicy,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, backoff: BackoffPolicy) -> Self {
        Self { pool, backoff }
    }

    /// Store with the default backoff policy (base 2, capped at one hour).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self::new(pool, BackoffPolicy::default())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Post-attempt transition, decided once and applied by both
/// `record_outcome` and the orphan reaper.
struct TransitionPlan {
    state: JobState,
    attempts: u32,
    run_at: Option<DateTime>,
}

impl TransitionPlan {
    fn for_attempt(
        outcome: &Outcome,
        attempts: u32,
        max_retries: u32,
        backoff: &BackoffPolicy,
        now: DateTime,
    ) -> Self {
        let attempts_after = attempts + 1;
        match Disposition::decide(outcome, attempts, max_retries) {
            Disposition::Succeed => Self {
                state: JobState::Completed,
                attempts: attempts_after,
                run_at: None,
            },
            Disposition::Retry => Self {
                state: JobState::FailedTransient,
                attempts: attempts_after,
                run_at: Some(now + backoff.delay(attempts_after)),
            },
            Disposition::Bury => Self {
                state: JobState::Dead,
                attempts: attempts_after,
                run_at: None,
            },
        }
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    #[instrument(skip_all, err, ret, fields(command = job.command(), priority = job.priority()))]
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let now = datetime_to_ts(Utc::now());

        sqlx::query(
            "INSERT INTO jobs (id, command, state, priority, max_retries, attempts,
                               run_at, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, 0, ?5, ?6, ?6)",
        )
        .bind(id.to_string())
        .bind(job.command())
        .bind(job.priority())
        .bind(job.max_retries() as i64)
        .bind(datetime_to_ts(job.scheduled_at()))
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to enqueue job")?;

        Ok(id)
    }

    #[instrument(skip_all, err, fields(worker_id = %worker_id))]
    async fn claim_one(&self, worker_id: &str, now: DateTime) -> Result<Option<Job>, StoreError> {
        // The single-statement guarded transition. Selecting and updating
        // in one statement is what makes two concurrent claims disjoint;
        // a read-then-write split here would hand the same job to both.
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE jobs
             SET state = 'processing', worker_id = ?1, claimed_at = ?2, updated_at = ?2
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE state IN ('pending', 'failed_transient') AND run_at <= ?2
                 ORDER BY priority DESC, run_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(worker_id)
        .bind(datetime_to_ts(now))
        .fetch_optional(&self.pool)
        .await
        .context("failed to claim a job")?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip_all, err, fields(job_id = %id, worker_id = %worker_id, outcome = outcome.label()))]
    async fn record_outcome(
        &self,
        id: Uuid,
        worker_id: &str,
        outcome: &Outcome,
        now: DateTime,
    ) -> Result<JobState, StoreError> {
        let id_text = id.to_string();

        let counters: Option<(i64, i64)> = sqlx::query_as(
            "SELECT attempts, max_retries FROM jobs
             WHERE id = ?1 AND state = 'processing' AND worker_id = ?2",
        )
        .bind(&id_text)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read job for outcome")?;

        let Some((attempts, max_retries)) = counters else {
            let exists: Option<(String,)> = sqlx::query_as("SELECT state FROM jobs WHERE id = ?1")
                .bind(&id_text)
                .fetch_optional(&self.pool)
                .await
                .context("failed to read job state")?;
            return Err(match exists {
                None => StoreError::NotFound(id),
                Some(_) => StoreError::LostClaim {
                    id,
                    worker_id: worker_id.to_string(),
                },
            });
        };

        let plan = TransitionPlan::for_attempt(
            outcome,
            attempts as u32,
            max_retries as u32,
            &self.backoff,
            now,
        );

        // Guarded on (state, worker_id, attempts): the lease cannot move
        // without changing one of these, so a stale read loses here instead
        // of clobbering someone else's transition. Two autocommit
        // statements rather than a read-then-write transaction, which under
        // a deferred snapshot would fail its lock upgrade whenever another
        // writer committed in between.
        let updated = sqlx::query(
            "UPDATE jobs
             SET state = ?1, attempts = ?2,
                 run_at = COALESCE(?3, run_at), updated_at = ?4,
                 last_exit_code = COALESCE(?5, last_exit_code),
                 stdout_tail = ?6, stderr_tail = ?7,
                 worker_id = NULL, claimed_at = NULL
             WHERE id = ?8 AND state = 'processing' AND worker_id = ?9 AND attempts = ?10",
        )
        .bind(plan.state.as_str())
        .bind(plan.attempts as i64)
        .bind(plan.run_at.map(datetime_to_ts))
        .bind(datetime_to_ts(now))
        .bind(outcome.exit_code())
        .bind(outcome.stdout_tail())
        .bind(outcome.stderr_tail())
        .bind(&id_text)
        .bind(worker_id)
        .bind(attempts)
        .execute(&self.pool)
        .await
        .context("failed to record outcome")?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::LostClaim {
                id,
                worker_id: worker_id.to_string(),
            });
        }

        Ok(plan.state)
    }

    #[instrument(skip_all, err, fields(job_id = %id))]
    async fn requeue(&self, id: Uuid, now: DateTime) -> Result<(), StoreError> {
        let id_text = id.to_string();
        let updated = sqlx::query(
            "UPDATE jobs
             SET state = 'pending', attempts = 0, run_at = ?1, updated_at = ?1,
                 last_exit_code = NULL, stdout_tail = NULL, stderr_tail = NULL,
                 worker_id = NULL, claimed_at = NULL
             WHERE id = ?2 AND state = 'dead'",
        )
        .bind(datetime_to_ts(now))
        .bind(&id_text)
        .execute(&self.pool)
        .await
        .context("failed to requeue job")?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let state: Option<(String,)> = sqlx::query_as("SELECT state FROM jobs WHERE id = ?1")
            .bind(&id_text)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read job state")?;
        match state {
            None => Err(StoreError::NotFound(id)),
            Some((state,)) => Err(StoreError::NotDead {
                id,
                state: state
                    .parse()
                    .map_err(|e: queuectl_core::core::job::ParseJobStateError| {
                        StoreError::InvariantViolation(e.to_string())
                    })?,
            }),
        }
    }

    #[instrument(skip_all, err, fields(job_id = %id))]
    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch job")?;
        row.map(Job::try_from)
            .transpose()?
            .ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip_all, err)]
    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        // LIMIT -1 is SQLite for "no limit".
        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        let rows = match filter.state {
            Some(state) => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT * FROM jobs WHERE state = ?1
                     ORDER BY created_at ASC, id ASC LIMIT ?2",
                )
                .bind(state.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, JobRow>(
                    "SELECT * FROM jobs ORDER BY created_at ASC, id ASC LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("failed to list jobs")?;

        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(skip_all, err, fields(threshold = %threshold))]
    async fn reap_orphans(
        &self,
        threshold: Duration,
        now: DateTime,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = datetime_to_ts(now - threshold);
        let candidates: Vec<(String, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, worker_id, claimed_at, attempts, max_retries FROM jobs
             WHERE state = 'processing' AND claimed_at <= ?1
             ORDER BY claimed_at ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to scan for orphans")?;

        let mut reaped = Vec::new();
        for (id_text, worker_id, claimed_at, attempts, max_retries) in candidates {
            let outcome = Outcome::SpawnFailed {
                message: format!("claim by worker '{worker_id}' expired; worker presumed dead"),
            };
            let plan = TransitionPlan::for_attempt(
                &outcome,
                attempts as u32,
                max_retries as u32,
                &self.backoff,
                now,
            );

            // Guarded on the stale (worker_id, claimed_at) pair: if the
            // worker recorded its outcome between our scan and this update,
            // the row no longer matches and is skipped.
            let updated = sqlx::query(
                "UPDATE jobs
                 SET state = ?1, attempts = ?2,
                     run_at = COALESCE(?3, run_at), updated_at = ?4,
                     stdout_tail = NULL, stderr_tail = ?5,
                     worker_id = NULL, claimed_at = NULL
                 WHERE id = ?6 AND state = 'processing'
                   AND worker_id = ?7 AND claimed_at = ?8",
            )
            .bind(plan.state.as_str())
            .bind(plan.attempts as i64)
            .bind(plan.run_at.map(datetime_to_ts))
            .bind(datetime_to_ts(now))
            .bind(outcome.stderr_tail())
            .bind(&id_text)
            .bind(&worker_id)
            .bind(claimed_at)
            .execute(&self.pool)
            .await
            .context("failed to reap orphan")?;

            if updated.rows_affected() == 1 {
                let id = id_text.parse::<Uuid>().map_err(|e| {
                    StoreError::InvariantViolation(format!("corrupt job id '{id_text}': {e}"))
                })?;
                reaped.push(id);
            }
        }

        Ok(reaped)
    }
}

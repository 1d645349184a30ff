use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::core::job::{Job, JobFilter, JobState, NewJob};
use crate::core::outcome::Outcome;
use crate::core::{DateTime, Duration};

/// Errors related to store operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// No job with that id.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// Requeue was asked for a job that is not in the dead-letter queue.
    #[error("job {id} is in state '{state}', only dead jobs can be requeued")]
    NotDead { id: Uuid, state: JobState },

    /// A guarded transition missed: the caller no longer owns the claim.
    #[error("worker '{worker_id}' no longer holds the claim on job {id}")]
    LostClaim { id: Uuid, worker_id: String },

    /// An illegal state transition was requested. Implementer bug; callers
    /// must not retry.
    #[error("state machine invariant violated: {0}")]
    InvariantViolation(String),

    /// The schema on disk is newer than this binary supports.
    #[error("store schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: i64, supported: i64 },

    /// Database or other backend error.
    #[error("store error: {0}")]
    Database(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether a worker may retry the operation after a pause. Only
    /// backend-level failures qualify; everything else is a definitive
    /// answer about the job.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// The persistence contract of queuectl.
///
/// A `JobStore` exclusively owns the authoritative job state: every state
/// transition is an atomic call here, and workers never mutate in-memory
/// copies. Implementations must make `claim_one` linearizable with respect
/// to concurrent `claim_one` and `record_outcome` calls.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically insert a new job in state `pending` with `attempts = 0`.
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError>;

    /// The atomic dequeue.
    ///
    /// In a single guarded round trip, selects the best ready job
    /// (`priority DESC, run_at ASC, id ASC` among `pending` and
    /// `failed_transient` rows with `run_at <= now`), transitions it to
    /// `processing` with this `worker_id` and `claimed_at = now`, and
    /// returns it. `None` when nothing is ready. A read-then-write
    /// implementation is forbidden: it lets two workers claim the same job.
    async fn claim_one(&self, worker_id: &str, now: DateTime) -> Result<Option<Job>, StoreError>;

    /// Record the outcome of an execution attempt and apply the resulting
    /// transition (`succeed`, `fail_retryable` or `fail_terminal`),
    /// incrementing `attempts`. Guarded by `worker_id`: if the caller no
    /// longer owns the claim the call fails with [`StoreError::LostClaim`]
    /// and the row is untouched. Returns the post-transition state.
    async fn record_outcome(
        &self,
        id: Uuid,
        worker_id: &str,
        outcome: &Outcome,
        now: DateTime,
    ) -> Result<JobState, StoreError>;

    /// `dead -> pending` with `attempts = 0` and `run_at = now`. Fails with
    /// [`StoreError::NotDead`] for any other current state.
    async fn requeue(&self, id: Uuid, now: DateTime) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Job, StoreError>;

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Return `processing` rows whose `claimed_at` is older than
    /// `threshold` to the retry machinery, as if the attempt had failed to
    /// spawn. Each row is transitioned through a guarded update keyed on
    /// its stale `(worker_id, claimed_at)` pair so a still-live worker
    /// cannot be raced. Returns the ids that were actually reaped.
    async fn reap_orphans(
        &self,
        threshold: Duration,
        now: DateTime,
    ) -> Result<Vec<Uuid>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_database_errors_are_retryable() {
        let id = Uuid::now_v7();
        assert!(StoreError::Database(anyhow::anyhow!("locked")).is_retryable());
        assert!(!StoreError::NotFound(id).is_retryable());
        assert!(!StoreError::NotDead {
            id,
            state: JobState::Pending
        }
        .is_retryable());
        assert!(!StoreError::LostClaim {
            id,
            worker_id: "w1".into()
        }
        .is_retryable());
        assert!(!StoreError::InvariantViolation("bad".into()).is_retryable());
        assert!(!StoreError::SchemaVersion {
            found: 9,
            supported: 1
        }
        .is_retryable());
    }

    #[test]
    fn error_messages_name_the_job() {
        let id = Uuid::now_v7();
        let msg = StoreError::NotFound(id).to_string();
        assert!(msg.contains(&id.to_string()));

        let msg = StoreError::NotDead {
            id,
            state: JobState::Completed,
        }
        .to_string();
        assert!(msg.contains("completed"));
    }
}

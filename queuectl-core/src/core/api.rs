//! The control surface consumed by the CLI: validated enqueue, listing,
//! inspection and DLQ requeue over any [`JobStore`].

use thiserror::Error;
use uuid::Uuid;

use crate::core::clock::Clock;
use crate::core::job::{Job, JobFilter, JobState, NewJob};
use crate::core::store::{JobStore, StoreError};
use crate::core::DateTime;

/// Default number of rows returned by `list`.
pub const DEFAULT_LIST_LIMIT: u32 = 20;

/// Error parsing a user-supplied schedule timestamp.
#[derive(Debug, Error)]
#[error("invalid --run-at '{input}': {reason} (expected RFC 3339 with an explicit offset, e.g. 2026-01-02T15:04:05Z)")]
pub struct InvalidRunAt {
    pub input: String,
    pub reason: String,
}

/// Parse an ISO-8601 / RFC 3339 timestamp with an explicit timezone.
///
/// Naive timestamps are rejected: a schedule that silently shifts with the
/// host timezone is worse than an error.
pub fn parse_run_at(input: &str) -> Result<DateTime, InvalidRunAt> {
    chrono::DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| InvalidRunAt {
            input: input.to_string(),
            reason: e.to_string(),
        })
}

/// Thin, validated facade over a store.
///
/// Owns the defaulting rules (priority 0, max_retries 3, run_at = now) so
/// that the CLI and any future surface agree on them.
pub struct QueueApi<S, C> {
    store: S,
    clock: C,
}

impl<S, C> QueueApi<S, C>
where
    S: JobStore,
    C: Clock,
{
    pub fn new(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueue a command. `run_at = None` means runnable immediately.
    pub async fn enqueue(
        &self,
        command: String,
        priority: i32,
        max_retries: u32,
        run_at: Option<DateTime>,
    ) -> Result<Uuid, StoreError> {
        let job = NewJob::new(command)
            .with_priority(priority)
            .with_max_retries(max_retries)
            .run_at(run_at.unwrap_or_else(|| self.clock.now()));
        self.store.enqueue(job).await
    }

    /// List jobs. `dlq` is shorthand for `state = dead` and wins over an
    /// explicit state filter, matching the CLI contract.
    pub async fn list(
        &self,
        state: Option<JobState>,
        dlq: bool,
        limit: Option<u32>,
    ) -> Result<Vec<Job>, StoreError> {
        let filter = JobFilter {
            state: if dlq { Some(JobState::Dead) } else { state },
            limit: Some(limit.unwrap_or(DEFAULT_LIST_LIMIT)),
        };
        self.store.list(filter).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        self.store.get(id).await
    }

    /// Move a dead job back to `pending` with a fresh retry budget.
    pub async fn requeue(&self, id: Uuid) -> Result<(), StoreError> {
        self.store.requeue(id, self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn accepts_utc_and_offset_timestamps() {
        let utc = parse_run_at("2026-08-02T10:00:00Z").unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2026, 8, 2, 10, 0, 0).unwrap());

        let offset = parse_run_at("2026-08-02T12:00:00+02:00").unwrap();
        assert_eq!(offset, utc);
    }

    #[test]
    fn rejects_naive_timestamps() {
        let err = parse_run_at("2026-08-02T10:00:00").unwrap_err();
        assert!(err.to_string().contains("2026-08-02T10:00:00"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_run_at("tomorrow").is_err());
        assert!(parse_run_at("").is_err());
    }
}

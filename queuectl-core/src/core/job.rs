use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::{DateTime, Utc};

/// Persistent lifecycle state of a job.
///
/// `Completed` and `Dead` are terminal; the only way out of `Dead` is an
/// explicit requeue. `Pending` and `FailedTransient` are both claimable once
/// their `run_at` has passed; the distinction exists so that listing can
/// tell "never ran" from "awaiting retry" without inspecting `attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    FailedTransient,
    Dead,
}

impl JobState {
    /// Stable string form used in storage and on the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::FailedTransient => "failed_transient",
            Self::Dead => "dead",
        }
    }

    /// Whether a job in this state can be claimed once `run_at` has passed.
    pub fn is_ready_state(&self) -> bool {
        matches!(self, Self::Pending | Self::FailedTransient)
    }

    /// Whether this state admits no further transitions except `requeue`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, thiserror::Error)]
#[error("unknown job state '{0}', expected one of: pending, processing, completed, failed_transient, dead")]
pub struct ParseJobStateError(String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed_transient" => Ok(Self::FailedTransient),
            "dead" => Ok(Self::Dead),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}

/// The sole persistent entity: one enqueued shell command and the full
/// record of its execution so far.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub state: JobState,
    pub priority: i32,
    pub max_retries: u32,
    pub attempts: u32,
    pub run_at: DateTime,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub last_exit_code: Option<i32>,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime>,
}

/// Parameters for enqueueing a job.
///
/// Builder pattern for configuring priority, retry budget and schedule.
///
/// # Examples
///
/// ```rust
/// use queuectl_core::core::job::NewJob;
/// use queuectl_core::core::Duration;
///
/// // Enqueue immediately with defaults (priority 0, max_retries 3)
/// let job = NewJob::new("echo hello");
///
/// // High priority, scheduled 5 minutes out
/// let job = NewJob::new("make backup")
///     .with_priority(10)
///     .in_duration(Duration::minutes(5));
/// ```
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) command: String,
    pub(crate) priority: i32,
    pub(crate) max_retries: u32,
    pub(crate) run_at: DateTime,
}

impl NewJob {
    /// Create enqueue parameters with default values: priority 0,
    /// max_retries 3, runnable immediately.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            priority: 0,
            max_retries: 3,
            run_at: Utc::now(),
        }
    }

    /// Set the job priority (higher values are claimed first).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the number of failed attempts allowed before the job is buried.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the earliest time a worker may claim the job.
    pub fn run_at(mut self, run_at: DateTime) -> Self {
        self.run_at = run_at;
        self
    }

    /// Schedule the job to run after a duration from now.
    pub fn in_duration(mut self, duration: chrono::Duration) -> Self {
        self.run_at = Utc::now() + duration;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn scheduled_at(&self) -> DateTime {
        self.run_at
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only return jobs in this state. `None` returns every state.
    pub state: Option<JobState>,
    /// Maximum number of rows returned. `None` means backend default.
    pub limit: Option<u32>,
}

impl JobFilter {
    pub fn with_state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrips_through_str() {
        for state in [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::FailedTransient,
            JobState::Dead,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }

    #[test]
    fn unknown_state_is_rejected() {
        assert!("failed".parse::<JobState>().is_err());
        assert!("".parse::<JobState>().is_err());
    }

    #[test]
    fn ready_and_terminal_partitions() {
        assert!(JobState::Pending.is_ready_state());
        assert!(JobState::FailedTransient.is_ready_state());
        assert!(!JobState::Processing.is_ready_state());
        assert!(!JobState::Dead.is_ready_state());

        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::FailedTransient.is_terminal());
    }

    #[test]
    fn new_job_defaults() {
        let before = Utc::now();
        let job = NewJob::new("true");
        let after = Utc::now();

        assert_eq!(job.command(), "true");
        assert_eq!(job.priority(), 0);
        assert_eq!(job.max_retries(), 3);
        assert!(job.scheduled_at() >= before);
        assert!(job.scheduled_at() <= after);
    }

    #[test]
    fn new_job_builder_chains() {
        let job = NewJob::new("false")
            .with_priority(-5)
            .with_max_retries(0)
            .in_duration(chrono::Duration::hours(2));

        assert_eq!(job.priority(), -5);
        assert_eq!(job.max_retries(), 0);
        let diff = (job.scheduled_at() - (Utc::now() + chrono::Duration::hours(2)))
            .num_seconds()
            .abs();
        assert!(diff < 2);
    }
}

use chrono::TimeZone;
use sqlx::FromRow;
use uuid::Uuid;

use queuectl_core::core::job::{Job, JobState};
use queuectl_core::core::store::StoreError;
use queuectl_core::core::{DateTime, Utc};

/// Raw `jobs` row. Timestamps are Unix-epoch milliseconds.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRow {
    pub(crate) id: String,
    pub(crate) command: String,
    pub(crate) state: String,
    pub(crate) priority: i64,
    pub(crate) max_retries: i64,
    pub(crate) attempts: i64,
    pub(crate) run_at: i64,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
    pub(crate) last_exit_code: Option<i64>,
    pub(crate) stdout_tail: Option<String>,
    pub(crate) stderr_tail: Option<String>,
    pub(crate) worker_id: Option<String>,
    pub(crate) claimed_at: Option<i64>,
}

pub(crate) fn datetime_to_ts(dt: DateTime) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ts_to_datetime(ts_ms: i64) -> Result<DateTime, StoreError> {
    Utc.timestamp_millis_opt(ts_ms).single().ok_or_else(|| {
        StoreError::InvariantViolation(format!("timestamp {ts_ms} out of range"))
    })
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row
            .id
            .parse::<Uuid>()
            .map_err(|e| StoreError::InvariantViolation(format!("corrupt job id '{}': {e}", row.id)))?;
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|e| StoreError::InvariantViolation(e.to_string()))?;
        Ok(Job {
            id,
            command: row.command,
            state,
            priority: row.priority as i32,
            max_retries: row.max_retries as u32,
            attempts: row.attempts as u32,
            run_at: ts_to_datetime(row.run_at)?,
            created_at: ts_to_datetime(row.created_at)?,
            updated_at: ts_to_datetime(row.updated_at)?,
            last_exit_code: row.last_exit_code.map(|c| c as i32),
            stdout_tail: row.stdout_tail,
            stderr_tail: row.stderr_tail,
            worker_id: row.worker_id,
            claimed_at: row.claimed_at.map(ts_to_datetime).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> JobRow {
        JobRow {
            id: Uuid::now_v7().to_string(),
            command: "true".into(),
            state: "pending".into(),
            priority: -3,
            max_retries: 3,
            attempts: 1,
            run_at: 1_700_000_000_000,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_500,
            last_exit_code: Some(1),
            stdout_tail: None,
            stderr_tail: Some("err".into()),
            worker_id: None,
            claimed_at: None,
        }
    }

    #[test]
    fn row_converts_to_job() {
        let job = Job::try_from(row()).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.priority, -3);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_exit_code, Some(1));
        assert_eq!(datetime_to_ts(job.run_at), 1_700_000_000_000);
    }

    #[test]
    fn corrupt_id_is_an_invariant_violation() {
        let mut bad = row();
        bad.id = "not-a-uuid".into();
        assert!(matches!(
            Job::try_from(bad),
            Err(StoreError::InvariantViolation(_))
        ));
    }

    #[test]
    fn corrupt_state_is_an_invariant_violation() {
        let mut bad = row();
        bad.state = "limbo".into();
        assert!(matches!(
            Job::try_from(bad),
            Err(StoreError::InvariantViolation(_))
        ));
    }

    #[test]
    fn timestamps_roundtrip_at_millisecond_precision() {
        let now = Utc.timestamp_millis_opt(1_700_000_123_456).unwrap();
        assert_eq!(ts_to_datetime(datetime_to_ts(now)).unwrap(), now);
    }
}

use serde::{Deserialize, Serialize};

/// Largest number of bytes retained from each of a child's output streams.
pub const TAIL_LIMIT: usize = 64 * 1024;

/// Result of one execution attempt, as observed by the executor.
///
/// The exit code is the only success/failure signal; stream contents are
/// captured for inspection, never parsed. `SpawnFailed` and `TimedOut`
/// travel the same retry path as a non-zero exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded {
        exit_code: i32,
        stdout_tail: String,
        stderr_tail: String,
    },
    FailedNonZero {
        exit_code: i32,
        stdout_tail: String,
        stderr_tail: String,
    },
    TimedOut {
        stdout_tail: String,
        stderr_tail: String,
    },
    SpawnFailed {
        message: String,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Succeeded { exit_code, .. } | Self::FailedNonZero { exit_code, .. } => {
                Some(*exit_code)
            }
            Self::TimedOut { .. } | Self::SpawnFailed { .. } => None,
        }
    }

    pub fn stdout_tail(&self) -> Option<&str> {
        match self {
            Self::Succeeded { stdout_tail, .. }
            | Self::FailedNonZero { stdout_tail, .. }
            | Self::TimedOut { stdout_tail, .. } => Some(stdout_tail),
            Self::SpawnFailed { .. } => None,
        }
    }

    /// Stderr tail, or the spawn error message for `SpawnFailed` so that a
    /// job that never launched still records why.
    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            Self::Succeeded { stderr_tail, .. }
            | Self::FailedNonZero { stderr_tail, .. }
            | Self::TimedOut { stderr_tail, .. } => Some(stderr_tail),
            Self::SpawnFailed { message } => Some(message),
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::FailedNonZero { .. } => "failed",
            Self::TimedOut { .. } => "timed_out",
            Self::SpawnFailed { .. } => "spawn_failed",
        }
    }
}

/// The state-machine decision for a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// `processing -> completed`
    Succeed,
    /// `processing -> failed_transient`, retry after backoff
    Retry,
    /// `processing -> dead`, retry budget exhausted
    Bury,
}

impl Disposition {
    /// Decide the transition for an attempt, given the pre-increment
    /// `attempts` counter. A job with `max_retries` failed attempts behind
    /// it dies on the next failure, so `attempts` never exceeds
    /// `max_retries + 1`.
    pub fn decide(outcome: &Outcome, attempts: u32, max_retries: u32) -> Self {
        if outcome.is_success() {
            Self::Succeed
        } else if attempts + 1 > max_retries {
            Self::Bury
        } else {
            Self::Retry
        }
    }
}

/// Bounded capture buffer that keeps only the trailing `limit` bytes
/// written into it.
#[derive(Debug)]
pub struct OutputTail {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(TAIL_LIMIT)
    }
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.limit {
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.limit..]);
            return;
        }
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.limit);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the buffer into a string, replacing any byte sequence cut
    /// mid-codepoint at the truncation boundary.
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

use chrono::Duration;

/// Exponential retry backoff: `delay(n) = base ^ n` seconds, capped.
///
/// `n` is the post-increment attempt count, so the first retry waits
/// `base ^ 1`. The policy is a pure function of the attempt number; the
/// optional multiplicative jitter is off by default because exact backoff
/// monotonicity is easier to reason about (and to test) than jittered
/// schedules.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Base of the exponential. Must be positive.
    pub base: f64,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Jitter fraction in `[0, 1)`: the delay is scaled by a uniform factor
    /// in `[1 - jitter, 1 + jitter]`. Zero disables jitter.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: 2.0,
            cap: Duration::hours(1),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: f64) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry following the `attempts`-th execution.
    ///
    /// `attempts` is the count *after* the failed attempt was recorded.
    pub fn delay(&self, attempts: u32) -> Duration {
        let cap_ms = self.cap.num_milliseconds().max(0) as f64;
        let raw_ms = self.base.powi(attempts as i32) * 1000.0;
        let mut ms = raw_ms.min(cap_ms);
        if self.jitter > 0.0 {
            ms *= jitter_factor(self.jitter);
            ms = ms.min(cap_ms);
        }
        Duration::milliseconds(ms.round() as i64)
    }
}

#[cfg(feature = "runner")]
fn jitter_factor(jitter: f64) -> f64 {
    use rand::Rng;
    rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
}

// Without the runner feature there is no rand dependency; jittered policies
// degrade to the deterministic schedule.
#[cfg(not(feature = "runner"))]
fn jitter_factor(_jitter: f64) -> f64 {
    1.0
}

//! Bounded retry policy shared by the websocket session, the execution
//! tracker and the HTTP caller.
//!
//! A [`RetryPolicy`] caps the number of attempts and describes the
//! delay between them. With `multiplier == 1.0` the delay is fixed;
//! otherwise it grows geometrically until it reaches `max_delay`.

use std::time::Duration;

/// Tunable parameters for a bounded retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Same delay between every attempt.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Delays to sleep between consecutive attempts (`max_attempts - 1` entries).
    pub fn delays(&self) -> Vec<Duration> {
        let mut out = Vec::new();
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..self.max_attempts {
            out.push(delay);
            delay = next_delay(delay, self);
        }
        out
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// Never shorter than `current` and clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let multiplier = policy.multiplier.max(1.0);
    let next_ms = (current.as_millis() as f64 * multiplier) as u64;
    Duration::from_millis(next_ms)
        .max(current)
        .min(policy.max_delay.max(current))
}

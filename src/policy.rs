//! Retry backoff policy shared by stream workers, the discovery loop, and
//! the forwarder.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`, with
//! jitter applied last. The base delay depends only on the attempt number;
//! jittered output never feeds back into later delays.

use std::time::Duration;

use rand::Rng;

/// How to randomize a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterPolicy {
    /// No randomization; delays are fully predictable.
    None,
    /// `delay/2 + random[0, delay/2]`, keeping at least half the base delay
    /// while desynchronizing concurrent retries.
    Equal,
}

impl JitterPolicy {
    fn apply(self, base: Duration) -> Duration {
        match self {
            JitterPolicy::None => base,
            JitterPolicy::Equal => {
                let half = base / 2;
                let extra = rand::rng().random_range(0.0..=1.0);
                half + Duration::from_secs_f64(half.as_secs_f64() * extra)
            }
        }
    }
}

/// Exponential retry backoff with a cap.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay for attempt 0.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
    /// Jitter applied to the clamped base delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given attempt number (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        };

        self.jitter.apply(base)
    }
}

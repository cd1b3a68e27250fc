//! Randomized-exponential backoff for the poll loop
//!
//! Grows the delay between empty or failed polls, resets to the floor on
//! the first success. The jitter factor is redrawn on every call so that
//! many listeners backing off at once do not stay in lockstep.

use std::time::Duration;

use rand::Rng;

/// Backoff strategy producing the next poll delay from the outcome of the
/// previous poll.
///
/// `next(succeeded)` must not be called concurrently with itself on the
/// same instance; the poll loop satisfies this by only ever calling it
/// from the single poll task.
#[derive(Debug, Clone)]
pub struct BackoffStrategy {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl BackoffStrategy {
    /// Create a new strategy. `min` must be >= 1ms and `max` must be >= `min`;
    /// callers are expected to have already validated this via
    /// [`crate::config::QueueListenerOptions::validate`].
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Current delay without advancing state (useful for observability).
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Compute and record the next delay.
    ///
    /// `succeeded`: resets to `min` and returns it.
    /// otherwise: multiplies the current delay by a fresh random factor in
    /// `(1.0, 2.0]` and clamps to `[min, max]`.
    pub fn next(&mut self, succeeded: bool) -> Duration {
        if succeeded {
            self.current = self.min;
            return self.current;
        }

        let factor = rand::thread_rng().gen_range(f64::EPSILON..=1.0) + 1.0;
        let grown = self.current.mul_f64(factor);
        self.current = grown.clamp(self.min, self.max);
        self.current
    }
}

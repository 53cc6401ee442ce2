//! Jittered exponential backoff.
//!
//! One value type serves the three places the dispatcher delays: the poll
//! scheduler's inter-round interval, the per-type error backoff, and the
//! retry delays of the Redis command wrapper.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff state. Each call to [`Backoff::next`] returns the
/// delay for the current attempt and advances the attempt counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    min_ms: u64,
    max_ms: u64,
    factor: f64,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    /// Backoff without jitter, growing from `min_ms` by `factor` per attempt
    /// and capped at `max_ms`.
    pub fn new(min_ms: u64, max_ms: u64, factor: f64) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
            factor: factor.max(1.0),
            jitter: false,
            attempt: 0,
        }
    }

    /// Backoff whose delays are drawn uniformly from `[min, current]`.
    pub fn jittered(min_ms: u64, max_ms: u64, factor: f64) -> Self {
        Self {
            jitter: true,
            ..Self::new(min_ms, max_ms, factor)
        }
    }

    /// Delay for the current attempt; advances the attempt counter.
    pub fn next(&mut self) -> Duration {
        let delay = self.for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Starts the next `next()` call over from the minimum delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn for_attempt(&self, attempt: u32) -> Duration {
        let min = self.min_ms as f64;
        let max = self.max_ms as f64;

        let mut ms = min * self.factor.powi(attempt as i32);
        if !ms.is_finite() || ms > max {
            ms = max;
        }

        if self.jitter && ms > min {
            ms = rand::thread_rng().gen_range(min..=ms);
        }

        Duration::from_millis(ms as u64)
    }
}

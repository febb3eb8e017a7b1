//! Feed retry delays
//!
//! After `n` consecutive failures the next attempt waits
//! `(1 + jitter) * base * 4^n`, capped. [`MAX_FAILURES`] consecutive failures
//! are surfaced to the caller instead.

use rand::Rng;
use std::time::Duration;

pub const MAX_FAILURES: u32 = 5;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Count a failure; true once too many happened in a row
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        self.failures >= MAX_FAILURES
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay before the next attempt
    pub fn delay(&self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with(jitter)
    }

    fn delay_with(&self, jitter: f64) -> Duration {
        let shift = (2 * self.failures).min(30);
        let millis = (1.0 + jitter) * self.base.as_millis() as f64 * (1u64 << shift) as f64;
        Duration::from_millis(millis as u64).min(self.cap)
    }
}

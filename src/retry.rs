//! Exponential backoff for store submits and queue publishes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Attempts actually made (never zero).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(20);
        let millis = self.base_delay_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. `on_retry` sees every retryable failure but the last.
    ///
    /// Returns the final result and the number of attempts made.
    pub fn run<T, E, F, R, L>(&self, mut op: F, retryable: R, mut on_retry: L) -> (Result<T, E>, u32)
    where
        F: FnMut() -> Result<T, E>,
        R: Fn(&E) -> bool,
        L: FnMut(u32, &E),
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return (Ok(v), attempt),
                Err(e) if attempt < attempts && retryable(&e) => {
                    on_retry(attempt, &e);
                    std::thread::sleep(self.delay_after(attempt));
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

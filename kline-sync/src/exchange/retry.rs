//! Bounded exponential backoff.
//!
//! [`Backoff`] is a small state machine: each failed attempt asks it for the
//! next delay, and it answers `None` once the attempt budget is spent. It never
//! sleeps itself; the caller does, through its injected clock.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Retry schedule shared by every call of one exchange client.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: true,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Same schedule with deterministic delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay after the `retry`-th failure (0-based): base × 2^retry, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Start a fresh attempt sequence.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            failures: 0,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        // equal jitter: half fixed, half random
        let half = delay / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(spread)
    }
}

/// Attempt counter for one logical call.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    /// Failed attempts recorded so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt. Returns the delay before the next attempt, or
    /// `None` when the attempt budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for(self.failures - 1);
        Some(self.policy.jittered(delay))
    }
}

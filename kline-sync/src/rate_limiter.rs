//! Token-bucket throttling for outbound exchange requests.
//!
//! One limiter is shared by every worker talking to the same exchange, so the
//! configured budget holds in aggregate rather than per worker.

use crate::config::RateLimitConfig;
use crate::errors::{Result, SyncError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Float slack when comparing token counts after a refill.
const TOKEN_EPSILON: f64 = 1e-9;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with capacity `C` refilled at `R` tokens per second.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
    /// Number of times a caller had to wait
    throttled: AtomicU64,
}

impl RateLimiter {
    /// Create a full bucket. Fails if capacity or refill rate are not positive.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(SyncError::config("rate limit capacity must be positive"));
        }
        if !(config.refill_per_sec.is_finite() && config.refill_per_sec > 0.0) {
            return Err(SyncError::config("rate limit refill rate must be positive"));
        }

        let capacity = f64::from(config.capacity);
        Ok(Self {
            capacity,
            refill_per_sec: config.refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            throttled: AtomicU64::new(0),
        })
    }

    /// Reject request weights the bucket could never satisfy.
    pub fn check_weight(&self, weight: u32) -> Result<()> {
        if weight == 0 || f64::from(weight) > self.capacity {
            return Err(SyncError::config(format!(
                "request weight {} must be between 1 and the bucket capacity {}",
                weight, self.capacity
            )));
        }
        Ok(())
    }

    /// Number of `acquire` calls that had to wait for tokens.
    pub fn throttled_count(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    /// Tokens currently available (after refilling up to now).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Wait until `weight` tokens can be taken, then take them.
    ///
    /// Weights are validated against the capacity when the client is built;
    /// anything larger is clamped so the call cannot wait forever.
    pub async fn acquire(&self, weight: u32) {
        let weight = f64::from(weight).min(self.capacity);

        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);

                if state.tokens + TOKEN_EPSILON >= weight {
                    state.tokens = (state.tokens - weight).max(0.0);
                    return;
                }

                let deficit = weight - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };

            self.throttled.fetch_add(1, Ordering::Relaxed);
            debug!("Rate limiter waiting {:?} for {} tokens", wait, weight);
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

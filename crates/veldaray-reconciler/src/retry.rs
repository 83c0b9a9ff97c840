//! Bounded exponential backoff policy.
//!
//! One policy object is applied uniformly around every fleet call the
//! reconciler makes, instead of each operation growing its own retry logic.

use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

/// Retry policy: attempt budget and backoff shape.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each subsequent retry.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Jitter fraction in `[0.0, 1.0]` added on top of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fast schedule for tests.
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            jitter: 0.0,
        }
    }

    /// Delay to sleep after the given failed attempt (1-based).
    /// Exponential doubling from `base_delay`, capped at `max_delay`,
    /// plus up to `jitter * delay` of time-seeded noise.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        if self.jitter <= 0.0 {
            return raw;
        }
        let jitter_budget = raw.mul_f64(self.jitter.min(1.0));
        let fraction = (pseudo_random(attempt) % 1000) as f64 / 1000.0;
        raw + jitter_budget.mul_f64(fraction)
    }
}

/// Cheap time-seeded noise source; good enough to decorrelate retries
/// across concurrent operations.
fn pseudo_random(salt: u32) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    salt.hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    hasher.finish()
}

//! Exponential backoff for transient send failures.
//!
//! The delay for attempt `k` (0-indexed) is `base * 2^k` plus up to 25%
//! jitter, capped at `max_delay`. Jitter is deterministic: it is derived by
//! hashing the notification id and attempt number, so a given retry always
//! lands at the same offset while different notifications spread out. That
//! keeps retry stampedes away without making test timing nondeterministic.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::types::NotificationId;

/// Default production base delay (60 s). Tests and latency-sensitive
/// deployments configure 1 s instead.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);

/// Hard cap on any single retry delay (1 hour).
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Maximum jitter, as a percentage of the exponential delay.
const JITTER_PERCENT: u64 = 25;

/// Backoff configuration.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any delay, jitter included.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base: DEFAULT_BASE_DELAY,
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

impl BackoffConfig {
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        BackoffConfig { base, max_delay }
    }

    /// Computes the delay before retry `attempt` (0-indexed) of the given
    /// notification.
    pub fn delay_for_attempt(&self, id: &NotificationId, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        // Shift saturates well past the cap; 2^20 * 1ms already exceeds an hour.
        let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(20));

        let jitter_ms = exp_ms / 100 * (jitter_bucket(id, attempt) as u64);
        let delay = Duration::from_millis(exp_ms.saturating_add(jitter_ms));
        delay.min(self.max_delay)
    }
}

/// Deterministic jitter bucket in `0..JITTER_PERCENT` for (id, attempt).
fn jitter_bucket(id: &NotificationId, attempt: u32) -> u8 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    (hasher.finish() % JITTER_PERCENT) as u8
}

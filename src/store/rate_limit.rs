//! Per-recipient sliding-window rate limiting.
//!
//! Counters live in hour-aligned buckets keyed by `(recipient,
//! window_start)`. Admission sums every bucket overlapping the trailing
//! hour, so a burst at :55 still counts against an admission at :05 of the
//! next hour.
//!
//! The `check`/`increment` pair is deliberately not atomic: concurrent
//! admissions can overshoot the limit by at most one message each, which the
//! contract tolerates. Old buckets are pruned by a janitor pass after a
//! retention horizon.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tokio::sync::Mutex;

use super::Result;
use crate::clock::Clock;
use crate::types::PhoneNumber;

/// Length of one rate-limit bucket.
const WINDOW: TimeDelta = TimeDelta::hours(1);

/// Sliding-window admission counters keyed by recipient.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Returns true if the recipient is under `limit_per_hour` messages in
    /// the trailing hour.
    async fn check(&self, recipient: &PhoneNumber, limit_per_hour: u32) -> Result<bool>;

    /// Records one admitted message in the current hour bucket, creating
    /// the bucket if absent.
    async fn increment(&self, recipient: &PhoneNumber) -> Result<()>;

    /// Seconds until the earliest window rollover that would admit the next
    /// message, or `None` if the recipient is not currently limited.
    async fn retry_after_seconds(
        &self,
        recipient: &PhoneNumber,
        limit_per_hour: u32,
    ) -> Result<Option<u64>>;

    /// Removes buckets whose window ended before `older_than`. Returns the
    /// number of buckets removed.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// In-memory [`RateLimitStore`].
pub struct MemoryRateLimitStore {
    windows: Mutex<HashMap<String, BTreeMap<DateTime<Utc>, u64>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryRateLimitStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryRateLimitStore {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn window_start(at: DateTime<Utc>) -> DateTime<Utc> {
        at.duration_trunc(WINDOW)
            .expect("hour truncation cannot fail for valid timestamps")
    }

    /// Sum of counts across buckets overlapping `[at - 1h, at]`.
    fn trailing_count(buckets: &BTreeMap<DateTime<Utc>, u64>, at: DateTime<Utc>) -> u64 {
        buckets
            .iter()
            .filter(|(start, _)| **start + WINDOW > at - WINDOW && **start <= at)
            .map(|(_, count)| *count)
            .sum()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn check(&self, recipient: &PhoneNumber, limit_per_hour: u32) -> Result<bool> {
        let now = self.clock.now();
        let windows = self.windows.lock().await;
        let count = windows
            .get(recipient.as_str())
            .map(|buckets| Self::trailing_count(buckets, now))
            .unwrap_or(0);
        Ok(count < u64::from(limit_per_hour))
    }

    async fn increment(&self, recipient: &PhoneNumber) -> Result<()> {
        let start = Self::window_start(self.clock.now());
        let mut windows = self.windows.lock().await;
        *windows
            .entry(recipient.as_str().to_string())
            .or_default()
            .entry(start)
            .or_insert(0) += 1;
        Ok(())
    }

    async fn retry_after_seconds(
        &self,
        recipient: &PhoneNumber,
        limit_per_hour: u32,
    ) -> Result<Option<u64>> {
        let now = self.clock.now();
        let windows = self.windows.lock().await;
        let Some(buckets) = windows.get(recipient.as_str()) else {
            return Ok(None);
        };

        if Self::trailing_count(buckets, now) < u64::from(limit_per_hour) {
            return Ok(None);
        }

        // Walk forward one rollover at a time: at each hour boundary the
        // oldest overlapping bucket drops out of the trailing window. Two
        // rollovers from now every current bucket has expired.
        let current = Self::window_start(now);
        for k in 1..=2 {
            let boundary = current + WINDOW * k;
            if Self::trailing_count(buckets, boundary) < u64::from(limit_per_hour) {
                let secs = (boundary - now).num_seconds().max(1) as u64;
                return Ok(Some(secs));
            }
        }
        let secs = ((current + WINDOW * 2) - now).num_seconds().max(1) as u64;
        Ok(Some(secs))
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut windows = self.windows.lock().await;
        let mut removed = 0;
        for buckets in windows.values_mut() {
            let before = buckets.len();
            buckets.retain(|start, _| *start + WINDOW >= older_than);
            removed += (before - buckets.len()) as u64;
        }
        windows.retain(|_, buckets| !buckets.is_empty());
        Ok(removed)
    }
}

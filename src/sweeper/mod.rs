//! Time-driven sweepers.
//!
//! Three periodic tasks share the same shape: sleep, wake, sweep, repeat,
//! until the shutdown token cancels.
//!
//! - [`RetryScheduler`] re-drives transiently failed (and rate-limited)
//!   notifications whose retry time has come.
//! - [`SchedulePromoter`] releases future-dated notifications.
//! - [`RateLimitJanitor`] prunes rate-limit windows past the retention
//!   horizon.
//!
//! The retry and schedule passes process items serially through the
//! processor's direct entry point. The serialization is deliberate:
//! concurrency belongs to the queue path, and a serial sweep cannot
//! stampede the provider when a backlog of retries comes due at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::clock::Clock;
use crate::processor::Processor;
use crate::store::{NotificationStore, RateLimitStore};

/// Upper bound on items handled per sweep tick.
const SWEEP_BATCH: usize = 100;

/// Periodically re-drives notifications that are due for a retry.
pub struct RetryScheduler {
    store: Arc<dyn NotificationStore>,
    processor: Arc<Processor>,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        processor: Arc<Processor>,
        interval: Duration,
    ) -> Self {
        RetryScheduler {
            store,
            processor,
            interval,
        }
    }

    /// Runs the sweep loop until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "retry scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "retry sweep failed");
                    }
                }
            }
        }
        info!("retry scheduler stopped");
    }

    /// One sweep: fetch due retries, oldest first, and process them serially.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> crate::store::Result<usize> {
        let due = self.store.find_due_retries(SWEEP_BATCH).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(due = due.len(), "processing due retries");

        let mut processed = 0;
        for notification in due {
            match self.processor.process_notification(notification.id).await {
                Ok(outcome) => {
                    debug!(notification = %notification.id, ?outcome, "retry processed");
                    processed += 1;
                }
                Err(e) => {
                    // Keep sweeping; the row stays due and the next tick
                    // picks it up again.
                    error!(notification = %notification.id, error = %e, "retry failed");
                }
            }
        }
        Ok(processed)
    }
}

/// Periodically releases scheduled notifications whose time has come.
pub struct SchedulePromoter {
    store: Arc<dyn NotificationStore>,
    processor: Arc<Processor>,
    interval: Duration,
}

impl SchedulePromoter {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        processor: Arc<Processor>,
        interval: Duration,
    ) -> Self {
        SchedulePromoter {
            store,
            processor,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "schedule promoter started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "schedule sweep failed");
                    }
                }
            }
        }
        info!("schedule promoter stopped");
    }

    /// One sweep: promote and process every due scheduled notification.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> crate::store::Result<usize> {
        let due = self.store.find_due_scheduled(SWEEP_BATCH).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(due = due.len(), "releasing scheduled notifications");

        let mut processed = 0;
        for notification in due {
            match self.processor.process_notification(notification.id).await {
                Ok(outcome) => {
                    debug!(notification = %notification.id, ?outcome, "scheduled item released");
                    processed += 1;
                }
                Err(e) => {
                    error!(notification = %notification.id, error = %e, "release failed");
                }
            }
        }
        Ok(processed)
    }
}

/// Periodically prunes rate-limit windows past the retention horizon.
pub struct RateLimitJanitor {
    rate_limits: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    retention: ChronoDuration,
}

impl RateLimitJanitor {
    pub fn new(
        rate_limits: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        retention: ChronoDuration,
    ) -> Self {
        RateLimitJanitor {
            rate_limits,
            clock,
            interval,
            retention,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "pruned rate-limit windows"),
                        Err(e) => error!(error = %e, "rate-limit prune failed"),
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> crate::store::Result<u64> {
        let horizon = self.clock.now() - self.retention;
        self.rate_limits.prune(horizon).await
    }
}

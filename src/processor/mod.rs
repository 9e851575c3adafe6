//! The message processor: the heart of the dispatch pipeline.
//!
//! A single entry point is exposed per driving path:
//!
//! - [`Processor::process_received`] for the worker pool, taking the raw
//!   queue body (a malformed body is a permanent failure, not a panic);
//! - [`Processor::process_notification`] for the sweepers, taking a
//!   notification id directly so retries and schedule promotion never
//!   construct synthetic queue messages.
//!
//! Both converge on the same dispatch procedure: claim the row (CAS to
//! `processing`), recheck the per-recipient rate limit, send, then persist
//! exactly one delivery-log row and one state transition per attempt.
//!
//! # At-least-once tolerance
//!
//! The queue may redeliver an item the relay has already handled. If the
//! row is already past the send (`sent`/`delivered`/`read`) or terminally
//! failed, processing settles immediately without touching the provider;
//! the queue-level dedup window and the notification-id dedup key cover
//! the narrow double-send races that remain.

pub mod backoff;

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::provider::{ProviderClient, ProviderError};
use crate::state::{DeliveryEvent, DeliveryState};
use crate::store::{NotificationStore, RateLimitStore, StatePatch, StoreError};
use crate::types::{NewDeliveryLog, Notification, NotificationId, WorkItem};

pub use backoff::BackoffConfig;

/// Fallback retry delay when the rate-limit store cannot name a rollover.
const RATE_LIMIT_FALLBACK_DELAY_SECS: i64 = 3600;

/// Processor tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    pub backoff: BackoffConfig,
    /// Per-recipient admission limit, rechecked before every send.
    pub recipient_limit_per_hour: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            backoff: BackoffConfig::default(),
            recipient_limit_per_hour: 10,
        }
    }
}

/// How processing of one item concluded.
///
/// Every variant is a *handled* outcome: the queue message should be
/// acknowledged. Only [`ProcessError`] leaves the message unacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The provider accepted the send.
    Sent,
    /// Transient failure; a retry is scheduled.
    Retrying { next_retry_at: DateTime<Utc> },
    /// Deferred by the per-recipient rate limit until the window rolls over.
    RateLimited { retry_at: DateTime<Utc> },
    /// Permanent failure (or retry budget exhausted).
    FailedPermanently,
    /// The notification was already past this point (duplicate delivery).
    AlreadySettled,
    /// The body was malformed or referenced an unknown notification.
    Discarded,
}

/// Internal failure while processing.
///
/// Store errors are infrastructure problems: the worker must NOT
/// acknowledge the queue message, so visibility expiry redelivers it.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for processor operations.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Drives one notification through a delivery attempt.
pub struct Processor {
    store: Arc<dyn NotificationStore>,
    rate_limits: Arc<dyn RateLimitStore>,
    provider: Arc<dyn ProviderClient>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        rate_limits: Arc<dyn RateLimitStore>,
        provider: Arc<dyn ProviderClient>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> Self {
        Processor {
            store,
            rate_limits,
            provider,
            clock,
            config,
        }
    }

    /// Processes a raw queue body. Entry point for the worker pool.
    pub async fn process_received(&self, body: &str) -> Result<ProcessOutcome> {
        let item: WorkItem = match serde_json::from_str(body) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "malformed work item, discarding");
                return Ok(ProcessOutcome::Discarded);
            }
        };
        self.process_item(&item).await
    }

    /// Processes a typed work item.
    #[instrument(skip(self, item), fields(notification = %item.notification_id, trace = %item.trace_id))]
    pub async fn process_item(&self, item: &WorkItem) -> Result<ProcessOutcome> {
        let Some(notification) = self.store.find_by_id(item.notification_id).await? else {
            warn!("work item references unknown notification, discarding");
            return Ok(ProcessOutcome::Discarded);
        };
        self.dispatch(notification).await
    }

    /// Processes a notification by id. Entry point for the sweepers: a
    /// scheduled row is promoted to queued and a failed or rate-limited row
    /// is re-queued before the attempt is made.
    #[instrument(skip(self), fields(notification = %id))]
    pub async fn process_notification(&self, id: NotificationId) -> Result<ProcessOutcome> {
        let Some(notification) = self.store.find_by_id(id).await? else {
            warn!("sweeper referenced unknown notification, discarding");
            return Ok(ProcessOutcome::Discarded);
        };

        let notification = match notification.state {
            DeliveryState::Scheduled => {
                debug!("promoting scheduled notification");
                self.store
                    .update_state(id, DeliveryEvent::Promote, StatePatch::default())
                    .await?
            }
            DeliveryState::Failed | DeliveryState::RateLimited => {
                if notification.next_retry_at.is_none() {
                    // Terminally failed; nothing to re-drive.
                    return Ok(ProcessOutcome::AlreadySettled);
                }
                self.store
                    .update_state(
                        id,
                        DeliveryEvent::Requeue,
                        StatePatch {
                            next_retry_at: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?
            }
            _ => notification,
        };

        self.dispatch(notification).await
    }

    /// The common dispatch procedure: claim, recheck rate limit, send,
    /// persist the outcome.
    async fn dispatch(&self, notification: Notification) -> Result<ProcessOutcome> {
        let id = notification.id;

        if notification.state.is_past_send() {
            debug!(state = %notification.state, "duplicate delivery for settled notification");
            return Ok(ProcessOutcome::AlreadySettled);
        }
        if notification.state == DeliveryState::Failed && notification.next_retry_at.is_none() {
            debug!("duplicate delivery for terminally failed notification");
            return Ok(ProcessOutcome::AlreadySettled);
        }

        // Claim the row. The CAS in the store makes this safe against a
        // concurrent worker; claiming a row another worker just finished
        // surfaces as an illegal transition and settles quietly.
        let notification = match self
            .store
            .update_state(
                id,
                DeliveryEvent::BeginProcessing,
                StatePatch {
                    next_retry_at: Some(None),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(n) => n,
            Err(StoreError::IllegalTransition(_)) => {
                debug!("claim lost, notification already settled");
                return Ok(ProcessOutcome::AlreadySettled);
            }
            Err(e) => return Err(e.into()),
        };

        // Recheck the per-recipient budget at send time: the item may have
        // sat queued or scheduled long enough for the window to fill up.
        if !self
            .rate_limits
            .check(&notification.recipient, self.config.recipient_limit_per_hour)
            .await?
        {
            return self.defer_rate_limited(&notification).await;
        }

        let attempt = notification.attempt_number + 1;
        let started = std::time::Instant::now();
        let result = self
            .provider
            .send(&notification.recipient, &notification.payload)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(sent) => {
                info!(
                    attempt,
                    latency_ms,
                    provider_message_id = %sent.provider_message_id,
                    "send accepted"
                );
                self.store
                    .append_log(
                        id,
                        NewDeliveryLog {
                            attempt,
                            state: Some(DeliveryState::Sent),
                            provider_message_id: Some(sent.provider_message_id.clone()),
                            latency_ms: Some(latency_ms),
                            response: Some(sent.raw_response),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store
                    .update_state(
                        id,
                        DeliveryEvent::SendSucceeded,
                        StatePatch {
                            sent_at: Some(self.clock.now()),
                            provider_message_id: Some(sent.provider_message_id),
                            increment_attempt: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(ProcessOutcome::Sent)
            }
            Err(error) if error.is_transient() && attempt < notification.max_attempts => {
                self.schedule_retry(&notification, attempt, latency_ms, &error)
                    .await
            }
            Err(error) => {
                self.fail_permanently(&notification, attempt, latency_ms, &error)
                    .await
            }
        }
    }

    async fn defer_rate_limited(&self, notification: &Notification) -> Result<ProcessOutcome> {
        let retry_after = self
            .rate_limits
            .retry_after_seconds(
                &notification.recipient,
                self.config.recipient_limit_per_hour,
            )
            .await?
            .map(|s| ChronoDuration::seconds(s as i64))
            .unwrap_or_else(|| ChronoDuration::seconds(RATE_LIMIT_FALLBACK_DELAY_SECS));
        let retry_at = self.clock.now() + retry_after;

        warn!(retry_at = %retry_at, "recipient over rate limit, deferring");

        self.store
            .append_log(
                notification.id,
                NewDeliveryLog {
                    attempt: notification.attempt_number,
                    state: Some(DeliveryState::RateLimited),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .update_state(
                notification.id,
                DeliveryEvent::RateLimitDeferred,
                StatePatch {
                    next_retry_at: Some(Some(retry_at)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(ProcessOutcome::RateLimited { retry_at })
    }

    async fn schedule_retry(
        &self,
        notification: &Notification,
        attempt: u32,
        latency_ms: u64,
        error: &ProviderError,
    ) -> Result<ProcessOutcome> {
        let delay = self
            .config
            .backoff
            .delay_for_attempt(&notification.id, notification.attempt_number);
        let next_retry_at = self.clock.now()
            + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::seconds(3600));

        warn!(
            attempt,
            error = %error,
            next_retry_at = %next_retry_at,
            "transient send failure, retry scheduled"
        );

        self.store
            .append_log(
                notification.id,
                NewDeliveryLog {
                    attempt,
                    state: Some(DeliveryState::Failed),
                    error_code: Some(error.log_code()),
                    error_message: Some(error.message.clone()),
                    latency_ms: Some(latency_ms),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .update_state(
                notification.id,
                DeliveryEvent::SendFailedRetriable,
                StatePatch {
                    next_retry_at: Some(Some(next_retry_at)),
                    increment_attempt: true,
                    ..Default::default()
                }
                .with_error(error.log_code(), error.message.clone()),
            )
            .await?;
        Ok(ProcessOutcome::Retrying { next_retry_at })
    }

    async fn fail_permanently(
        &self,
        notification: &Notification,
        attempt: u32,
        latency_ms: u64,
        error: &ProviderError,
    ) -> Result<ProcessOutcome> {
        warn!(attempt, error = %error, "permanent send failure");

        self.store
            .append_log(
                notification.id,
                NewDeliveryLog {
                    attempt,
                    state: Some(DeliveryState::Failed),
                    error_code: Some(error.log_code()),
                    error_message: Some(error.message.clone()),
                    latency_ms: Some(latency_ms),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .update_state(
                notification.id,
                DeliveryEvent::SendFailedPermanent,
                StatePatch {
                    failed_at: Some(self.clock.now()),
                    next_retry_at: Some(None),
                    increment_attempt: true,
                    ..Default::default()
                }
                .with_error(error.log_code(), error.message.clone()),
            )
            .await?;
        Ok(ProcessOutcome::FailedPermanently)
    }
}

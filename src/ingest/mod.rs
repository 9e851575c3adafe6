//! The ingestion service: converts an API request into a persisted
//! notification plus a queued work item.
//!
//! The request path is: validate, replay-check the idempotency key, admit
//! against the per-recipient rate limit, persist, count the admission, and
//! enqueue (immediate sends only; scheduled sends wait for the promoter).
//!
//! Persist-then-enqueue is not transactional across the two systems. A
//! crash between the two leaves a `queued` row with no queue message; the
//! startup reconciliation pass stamps such rows for the retry sweeper, so
//! delivery is still at-least-once.

pub mod request;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::queue::{PublishRequest, WorkQueue};
use crate::state::DeliveryState;
use crate::store::{NewNotification, NotificationStore, RateLimitStore, StoreError};
use crate::types::{NotificationId, TenantId, TraceId};

pub use request::{NotificationRequest, ValidatedNotification, ValidationError};

/// Ingestion tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct IngestionConfig {
    pub recipient_limit_per_hour: u32,
    pub default_max_attempts: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        IngestionConfig {
            recipient_limit_per_hour: 10,
            default_max_attempts: crate::types::notification::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Errors surfaced by the ingestion path.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The recipient is over their hourly budget. No row was created.
    #[error("recipient rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// The accepted notification: its id and initial state.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub id: NotificationId,
    pub state: DeliveryState,
    /// True when an `Idempotency-Key` replay returned the prior record.
    #[serde(skip)]
    pub replayed: bool,
}

/// Outcome of one entry on the bulk path.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BulkEntryOutcome {
    Accepted { id: NotificationId, state: DeliveryState },
    Rejected { error: String },
}

/// Validates, persists, and enqueues notifications.
pub struct IngestionService {
    store: Arc<dyn NotificationStore>,
    rate_limits: Arc<dyn RateLimitStore>,
    queue: Arc<dyn WorkQueue>,
    clock: Arc<dyn Clock>,
    config: IngestionConfig,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        rate_limits: Arc<dyn RateLimitStore>,
        queue: Arc<dyn WorkQueue>,
        clock: Arc<dyn Clock>,
        config: IngestionConfig,
    ) -> Self {
        IngestionService {
            store,
            rate_limits,
            queue,
            clock,
            config,
        }
    }

    /// Ingests a single notification request.
    #[instrument(skip(self, request), fields(tenant = %tenant))]
    pub async fn create_notification(
        &self,
        request: NotificationRequest,
        tenant: &TenantId,
        idempotency_key: Option<String>,
    ) -> Result<IngestOutcome, IngestError> {
        let validated = request.validate()?;

        // Replayed requests return the prior record: no new row, no rate
        // budget consumed.
        if let Some(key) = &idempotency_key
            && let Some(existing) = self.store.find_by_idempotency_key(tenant, key).await?
        {
            debug!(notification = %existing.id, "idempotency key replay");
            return Ok(IngestOutcome {
                id: existing.id,
                state: existing.state,
                replayed: true,
            });
        }

        if !self
            .rate_limits
            .check(&validated.recipient, self.config.recipient_limit_per_hour)
            .await?
        {
            let retry_after_seconds = self
                .rate_limits
                .retry_after_seconds(&validated.recipient, self.config.recipient_limit_per_hour)
                .await?
                .unwrap_or(3600);
            return Err(IngestError::RateLimited {
                retry_after_seconds,
            });
        }

        let now = self.clock.now();
        let state = initial_state(validated.scheduled_for, now);
        let id = NotificationId::generate();
        let trace_id = TraceId::generate();

        let created = match self
            .store
            .create(NewNotification {
                id,
                tenant_id: tenant.clone(),
                event_type: validated.event_type,
                recipient: validated.recipient.clone(),
                country_code: validated.country_code,
                payload: validated.payload,
                metadata: validated.metadata,
                priority: validated.priority,
                state,
                scheduled_for: validated.scheduled_for.filter(|_| state == DeliveryState::Scheduled),
                max_attempts: self.config.default_max_attempts,
                idempotency_key: idempotency_key.clone(),
                trace_id,
            })
            .await
        {
            Ok(row) => row,
            Err(StoreError::DuplicateIdempotencyKey(existing)) => {
                // Lost the race with a concurrent replay of the same key.
                let row = self
                    .store
                    .find_by_id(existing)
                    .await?
                    .ok_or(StoreError::NotFound)?;
                return Ok(IngestOutcome {
                    id: row.id,
                    state: row.state,
                    replayed: true,
                });
            }
            Err(e) => return Err(e.into()),
        };

        self.rate_limits.increment(&validated.recipient).await?;

        if created.state == DeliveryState::Queued {
            // Enqueue failure is not fatal: the row is persisted, and the
            // startup reconciliation pass re-drives queued rows that never
            // made it onto the queue.
            if let Err(e) = self
                .queue
                .publish(PublishRequest::for_item(created.work_item()))
                .await
            {
                warn!(notification = %created.id, error = %e, "enqueue failed after persist");
            }
        }

        info!(notification = %created.id, state = %created.state, trace = %trace_id, "notification accepted");
        Ok(IngestOutcome {
            id: created.id,
            state: created.state,
            replayed: false,
        })
    }

    /// Ingests up to 100 requests, returning a per-entry outcome.
    #[instrument(skip(self, requests), fields(tenant = %tenant, entries = requests.len()))]
    pub async fn create_bulk(
        &self,
        requests: Vec<NotificationRequest>,
        tenant: &TenantId,
    ) -> Result<Vec<BulkEntryOutcome>, IngestError> {
        if requests.is_empty() || requests.len() > 100 {
            return Err(ValidationError::new(
                "notifications",
                "must contain between 1 and 100 entries",
            )
            .into());
        }

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            match self.create_notification(request, tenant, None).await {
                Ok(outcome) => outcomes.push(BulkEntryOutcome::Accepted {
                    id: outcome.id,
                    state: outcome.state,
                }),
                Err(IngestError::Store(e)) => return Err(e.into()),
                Err(e) => outcomes.push(BulkEntryOutcome::Rejected {
                    error: e.to_string(),
                }),
            }
        }
        Ok(outcomes)
    }
}

/// Scheduled iff the requested time is still in the future.
fn initial_state(scheduled_for: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DeliveryState {
    match scheduled_for {
        Some(at) if at > now => DeliveryState::Scheduled,
        _ => DeliveryState::Queued,
    }
}

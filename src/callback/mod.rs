//! Inbound provider status callbacks.
//!
//! The provider posts batches of status updates (`sent`, `delivered`,
//! `read`, `failed`) referencing the provider message id assigned at send
//! time. The handler advances the delivery state machine monotonically and
//! appends one delivery-log row per applied status.
//!
//! Handling is idempotent best-effort: statuses for unknown message ids are
//! dropped, out-of-order statuses set their timestamps independently, and a
//! status the row has already advanced past is a no-op on the state. A
//! `failed` status is terminal — the outbound send was accepted, so the
//! failure is a downstream recipient issue and is never retried.

pub mod signature;

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::state::DeliveryEvent;
use crate::store::{NotificationStore, StatePatch, StoreError};
use crate::types::{NewDeliveryLog, ProviderMessageId};

pub use signature::{sign_payload, verify_signature};

/// Top-level callback payload shape.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    #[serde(default)]
    pub entry: Vec<CallbackEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackEntry {
    #[serde(default)]
    pub changes: Vec<CallbackChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackChange {
    pub value: CallbackValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackValue {
    /// Status updates for messages this relay sent.
    #[serde(default)]
    pub statuses: Vec<StatusEntry>,
    /// Inbound user messages. Conversational messaging is out of scope;
    /// these are counted and dropped.
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// One status update.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusEntry {
    /// The provider message id (`wamid...`).
    pub id: String,
    pub status: CallbackStatus,
    /// Epoch seconds, as a string, per the provider's wire format.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub errors: Vec<CallbackErrorDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Sent,
    Delivered,
    Read,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackErrorDetail {
    pub code: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Outcome counts for one callback batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CallbackSummary {
    /// Statuses applied to a notification.
    pub applied: usize,
    /// Statuses dropped: unknown message id, unknown status value, or a
    /// transition the state machine no longer admits.
    pub dropped: usize,
}

/// Applies provider status callbacks to the store.
pub struct CallbackHandler {
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
}

impl CallbackHandler {
    pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>) -> Self {
        CallbackHandler { store, clock }
    }

    /// Processes one callback payload.
    #[instrument(skip(self, payload))]
    pub async fn handle(&self, payload: CallbackPayload) -> Result<CallbackSummary, StoreError> {
        let mut summary = CallbackSummary::default();

        for entry in payload.entry {
            for change in entry.changes {
                if !change.value.messages.is_empty() {
                    debug!(
                        count = change.value.messages.len(),
                        "ignoring inbound user messages"
                    );
                }
                for status in change.value.statuses {
                    match self.apply_status(&status).await? {
                        true => summary.applied += 1,
                        false => summary.dropped += 1,
                    }
                }
            }
        }

        info!(applied = summary.applied, dropped = summary.dropped, "callback batch handled");
        Ok(summary)
    }

    /// Applies a single status entry. Returns false when it was dropped.
    async fn apply_status(&self, status: &StatusEntry) -> Result<bool, StoreError> {
        let provider_message_id = ProviderMessageId::new(&status.id);

        let Some(notification) = self
            .store
            .find_by_provider_message_id(&provider_message_id)
            .await?
        else {
            debug!(provider_message_id = %provider_message_id, "status for unknown message, dropping");
            return Ok(false);
        };

        let at = self.status_time(status);
        let (event, patch) = match status.status {
            CallbackStatus::Sent => (
                DeliveryEvent::ProviderSent,
                StatePatch {
                    sent_at: Some(at),
                    ..Default::default()
                },
            ),
            CallbackStatus::Delivered => (
                DeliveryEvent::ProviderDelivered,
                StatePatch {
                    delivered_at: Some(at),
                    ..Default::default()
                },
            ),
            CallbackStatus::Read => (
                DeliveryEvent::ProviderRead,
                StatePatch {
                    read_at: Some(at),
                    ..Default::default()
                },
            ),
            CallbackStatus::Failed => {
                let mut patch = StatePatch {
                    failed_at: Some(at),
                    next_retry_at: Some(None),
                    ..Default::default()
                };
                if let Some(detail) = status.errors.first() {
                    patch = patch.with_error(
                        detail.code.map_or_else(|| "unknown".into(), |c| c.to_string()),
                        detail
                            .message
                            .clone()
                            .or_else(|| detail.title.clone())
                            .unwrap_or_else(|| "delivery failed".into()),
                    );
                }
                (DeliveryEvent::ProviderFailed, patch)
            }
            CallbackStatus::Unknown => {
                warn!(provider_message_id = %provider_message_id, "unrecognized status value, dropping");
                return Ok(false);
            }
        };

        let error = patch.error.clone();
        let updated = match self.store.update_state(notification.id, event, patch).await {
            Ok(row) => row,
            Err(StoreError::IllegalTransition(t)) => {
                // Best-effort: e.g. a `failed` callback arriving after a
                // read receipt. Nothing to advance.
                debug!(notification = %notification.id, %t, "callback transition not admitted, dropping");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        self.store
            .append_log(
                notification.id,
                NewDeliveryLog {
                    attempt: updated.attempt_number,
                    state: Some(updated.state),
                    provider_message_id: Some(provider_message_id),
                    error_code: error.as_ref().map(|(code, _)| code.clone()),
                    error_message: error.map(|(_, message)| message),
                    ..Default::default()
                },
            )
            .await?;

        Ok(true)
    }

    /// Provider timestamps are epoch seconds in a string; fall back to the
    /// local clock when absent or unparseable.
    fn status_time(&self, status: &StatusEntry) -> DateTime<Utc> {
        status
            .timestamp
            .as_deref()
            .and_then(|t| t.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(|| self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeliveryState;
    use crate::store::{MemoryNotificationStore, StatePatch};
    use crate::test_utils::{new_notification, test_clock};
    use crate::types::NotificationId;

    fn status_payload(entries: Vec<StatusEntry>) -> CallbackPayload {
        CallbackPayload {
            entry: vec![CallbackEntry {
                changes: vec![CallbackChange {
                    value: CallbackValue {
                        statuses: entries,
                        messages: vec![],
                    },
                }],
            }],
        }
    }

    fn status(id: &str, status: CallbackStatus, epoch: i64) -> StatusEntry {
        StatusEntry {
            id: id.to_string(),
            status,
            timestamp: Some(epoch.to_string()),
            errors: vec![],
        }
    }

    async fn seed_sent(
        store: &MemoryNotificationStore,
        wamid: &str,
    ) -> NotificationId {
        let new = new_notification("order.placed", "+14155552671");
        let id = new.id;
        store.create(new).await.unwrap();
        store
            .update_state(id, DeliveryEvent::BeginProcessing, StatePatch::default())
            .await
            .unwrap();
        store
            .update_state(
                id,
                DeliveryEvent::SendSucceeded,
                StatePatch {
                    provider_message_id: Some(ProviderMessageId::new(wamid)),
                    increment_attempt: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn delivered_then_read_advances_state() {
        let clock = test_clock();
        let store = Arc::new(MemoryNotificationStore::new(clock.clone()));
        let handler = CallbackHandler::new(store.clone(), clock.clone());
        let id = seed_sent(&store, "wamid.X").await;

        let summary = handler
            .handle(status_payload(vec![
                status("wamid.X", CallbackStatus::Delivered, 1_740_000_000),
                status("wamid.X", CallbackStatus::Read, 1_740_000_060),
            ]))
            .await
            .unwrap();
        assert_eq!(summary, CallbackSummary { applied: 2, dropped: 0 });

        let row = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.state, DeliveryState::Read);
        assert!(row.delivered_at.unwrap() <= row.read_at.unwrap());
    }

    #[tokio::test]
    async fn out_of_order_callbacks_keep_state_monotonic() {
        let clock = test_clock();
        let store = Arc::new(MemoryNotificationStore::new(clock.clone()));
        let handler = CallbackHandler::new(store.clone(), clock.clone());
        let id = seed_sent(&store, "wamid.X").await;

        // read arrives before delivered
        handler
            .handle(status_payload(vec![status(
                "wamid.X",
                CallbackStatus::Read,
                1_740_000_060,
            )]))
            .await
            .unwrap();
        handler
            .handle(status_payload(vec![status(
                "wamid.X",
                CallbackStatus::Delivered,
                1_740_000_000,
            )]))
            .await
            .unwrap();

        let row = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.state, DeliveryState::Read, "state must not move backward");
        // both timestamps set independently, consistent with provider times
        assert_eq!(row.delivered_at.unwrap().timestamp(), 1_740_000_000);
        assert_eq!(row.read_at.unwrap().timestamp(), 1_740_000_060);
    }

    #[tokio::test]
    async fn unknown_message_id_is_dropped() {
        let clock = test_clock();
        let store = Arc::new(MemoryNotificationStore::new(clock.clone()));
        let handler = CallbackHandler::new(store.clone(), clock.clone());

        let summary = handler
            .handle(status_payload(vec![status(
                "wamid.nobody",
                CallbackStatus::Delivered,
                1_740_000_000,
            )]))
            .await
            .unwrap();
        assert_eq!(summary, CallbackSummary { applied: 0, dropped: 1 });
    }

    #[tokio::test]
    async fn failed_callback_is_terminal_with_error_detail() {
        let clock = test_clock();
        let store = Arc::new(MemoryNotificationStore::new(clock.clone()));
        let handler = CallbackHandler::new(store.clone(), clock.clone());
        let id = seed_sent(&store, "wamid.X").await;

        let mut entry = status("wamid.X", CallbackStatus::Failed, 1_740_000_000);
        entry.errors = vec![CallbackErrorDetail {
            code: Some(131_053),
            title: Some("Media upload error".into()),
            message: None,
        }];

        handler.handle(status_payload(vec![entry])).await.unwrap();

        let row = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.state, DeliveryState::Failed);
        assert!(row.failed_at.is_some());
        assert!(row.next_retry_at.is_none(), "callback failures never retry");
        assert_eq!(row.last_error_code.as_deref(), Some("131053"));
    }

    #[tokio::test]
    async fn repeated_status_appends_at_most_one_log_row_each() {
        let clock = test_clock();
        let store = Arc::new(MemoryNotificationStore::new(clock.clone()));
        let handler = CallbackHandler::new(store.clone(), clock.clone());
        let id = seed_sent(&store, "wamid.X").await;

        let payload = || status_payload(vec![status("wamid.X", CallbackStatus::Delivered, 1_740_000_000)]);
        handler.handle(payload()).await.unwrap();
        let logs_after_first = store.logs_for(id, 10).await.unwrap().len();
        handler.handle(payload()).await.unwrap();
        let logs_after_second = store.logs_for(id, 10).await.unwrap().len();

        assert!(logs_after_second <= logs_after_first + 1);
    }

    #[tokio::test]
    async fn payload_parses_provider_wire_format() {
        let json = serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "1234567890",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "statuses": [{
                            "id": "wamid.X",
                            "status": "delivered",
                            "timestamp": "1740000000",
                            "recipient_id": "14155552671"
                        }]
                    }
                }]
            }]
        });
        let payload: CallbackPayload = serde_json::from_value(json).unwrap();
        let statuses = &payload.entry[0].changes[0].value.statuses;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, CallbackStatus::Delivered);
    }
}

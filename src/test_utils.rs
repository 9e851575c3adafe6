//! Shared test fixtures.
//!
//! Only compiled for tests. Provides a frozen clock, notification builders,
//! and a scripted provider client whose outcomes are queued up front.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::Mutex;

use crate::clock::FixedClock;
use crate::provider::{ProviderClient, ProviderError, SendResult};
use crate::state::DeliveryState;
use crate::store::NewNotification;
use crate::types::{
    MessagePayload, NotificationId, PhoneNumber, Priority, ProviderMessageId, TenantId, TraceId,
    WorkItem,
};

/// A clock frozen at 2025-03-01 12:30:00 UTC.
///
/// Half past the hour, so rate-limit tests exercise both bucket halves.
pub fn test_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap(),
    ))
}

/// A minimal queued text notification for tenant `acme`.
pub fn new_notification(event_type: &str, phone: &str) -> NewNotification {
    NewNotification {
        id: NotificationId::generate(),
        tenant_id: TenantId::new("acme"),
        event_type: event_type.to_string(),
        recipient: PhoneNumber::parse(phone).unwrap(),
        country_code: None,
        payload: MessagePayload::Text {
            body: "test message".into(),
        },
        metadata: serde_json::Map::new(),
        priority: Priority::Normal,
        state: DeliveryState::Queued,
        scheduled_for: None,
        max_attempts: 5,
        idempotency_key: None,
        trace_id: TraceId::generate(),
    }
}

/// A work item addressed to `phone`.
pub fn work_item(phone: &str) -> WorkItem {
    WorkItem {
        notification_id: NotificationId::generate(),
        tenant_id: TenantId::new("acme"),
        trace_id: TraceId::generate(),
        recipient: PhoneNumber::parse(phone).unwrap(),
        payload: MessagePayload::Text {
            body: "test message".into(),
        },
        priority: Priority::Normal,
        attempt_number: 0,
        max_attempts: 5,
    }
}

/// A provider client whose responses are scripted.
///
/// Outcomes queue in FIFO order; once the script runs dry every further
/// send succeeds with a generated `wamid.auto-N` id.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<SendResult, ProviderError>>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        ScriptedProvider {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// Queues a successful send returning `wamid`.
    pub async fn push_ok(&self, wamid: &str) {
        self.script.lock().await.push_back(Ok(SendResult {
            provider_message_id: ProviderMessageId::new(wamid),
            raw_response: json!({ "messages": [{ "id": wamid }] }),
        }));
    }

    /// Queues a failure.
    pub async fn push_err(&self, error: ProviderError) {
        self.script.lock().await.push_back(Err(error));
    }

    /// Number of send calls observed.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn send(
        &self,
        _recipient: &PhoneNumber,
        _payload: &MessagePayload,
    ) -> Result<SendResult, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.script.lock().await.pop_front() {
            Some(outcome) => outcome,
            None => {
                let wamid = format!("wamid.auto-{call}");
                Ok(SendResult {
                    provider_message_id: ProviderMessageId::new(&wamid),
                    raw_response: json!({ "messages": [{ "id": wamid }] }),
                })
            }
        }
    }
}

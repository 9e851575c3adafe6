//! The notification entity, its payload variants, and the queue work item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::DeliveryState;
use crate::types::ids::{NotificationId, ProviderMessageId, TenantId, TraceId};
use crate::types::phone::{CountryCode, PhoneNumber};

/// Maximum length of a free-text message body.
pub const MAX_TEXT_LENGTH: usize = 4096;

/// Default attempt cap for a notification.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delivery priority. Affects dequeue order, not rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// The kind of a template parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateParameterKind {
    Text,
    Currency,
    DateTime,
}

/// A positional parameter substituted into an approved template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateParameter {
    #[serde(rename = "type")]
    pub kind: TemplateParameterKind,
    pub value: String,
}

/// A reference to an approved message template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    /// Two-character language code (e.g., `en`).
    pub language: String,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
}

/// The message content: exactly one of an approved template reference or a
/// bounded free-text body.
///
/// Serialized as a discriminated record so the queue payload stays typed
/// end to end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Template(TemplateRef),
    Text { body: String },
}

impl MessagePayload {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::Template(_) => "template",
            MessagePayload::Text { .. } => "text",
        }
    }
}

/// A persisted notification row.
///
/// Timestamps are monotonic once set; `provider_message_id` is set at most
/// once and never cleared. Both invariants are enforced by the store, not
/// by this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub recipient: PhoneNumber,
    pub country_code: Option<CountryCode>,
    pub payload: MessagePayload,
    /// Opaque client metadata; stored but never interpreted.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub priority: Priority,
    pub state: DeliveryState,
    pub provider_message_id: Option<ProviderMessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub trace_id: TraceId,
}

impl Notification {
    /// Returns true when another attempt may still be made.
    pub fn has_retry_budget(&self) -> bool {
        self.attempt_number < self.max_attempts
    }

    /// Builds the queue work item for this notification.
    pub fn work_item(&self) -> WorkItem {
        WorkItem {
            notification_id: self.id,
            tenant_id: self.tenant_id.clone(),
            trace_id: self.trace_id,
            recipient: self.recipient.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            attempt_number: self.attempt_number,
            max_attempts: self.max_attempts,
        }
    }
}

/// An append-only audit row recording one delivery attempt or one applied
/// provider status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub notification_id: NotificationId,
    /// Attempt ordinal; 0 for rows driven by provider callbacks.
    pub attempt: u32,
    pub state: DeliveryState,
    pub provider_message_id: Option<ProviderMessageId>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Outbound round-trip latency; absent for callback-driven rows.
    pub latency_ms: Option<u64>,
    /// Raw provider response snapshot.
    pub response: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new delivery-log row; the store stamps `created_at`.
#[derive(Debug, Clone, Default)]
pub struct NewDeliveryLog {
    pub attempt: u32,
    pub state: Option<DeliveryState>,
    pub provider_message_id: Option<ProviderMessageId>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub latency_ms: Option<u64>,
    pub response: Option<Value>,
}

/// The payload carried on the work queue.
///
/// Self-contained: a worker can send without a store read, and the attempt
/// bookkeeping survives queue redelivery. The notification id doubles as
/// the queue deduplication id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub notification_id: NotificationId,
    pub tenant_id: TenantId,
    pub trace_id: TraceId,
    pub recipient: PhoneNumber,
    pub payload: MessagePayload,
    #[serde(default)]
    pub priority: Priority,
    pub attempt_number: u32,
    pub max_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_as_discriminated_record() {
        let template = MessagePayload::Template(TemplateRef {
            name: "order_confirmation".into(),
            language: "en".into(),
            parameters: vec![TemplateParameter {
                kind: TemplateParameterKind::Text,
                value: "ORD-1234".into(),
            }],
        });
        let json = serde_json::to_value(&template).unwrap();
        assert_eq!(json["type"], "template");
        assert_eq!(json["name"], "order_confirmation");
        assert_eq!(json["parameters"][0]["type"], "text");

        let text = MessagePayload::Text {
            body: "your order shipped".into(),
        };
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["body"], "your order shipped");
    }

    #[test]
    fn payload_roundtrips() {
        let payload = MessagePayload::Text {
            body: "hello".into(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let parsed: MessagePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload, parsed);
    }

    #[test]
    fn priority_orders_low_to_high() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn priority_default_is_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
        let json = serde_json::to_string(&Priority::Normal).unwrap();
        assert_eq!(json, "\"normal\"");
    }

    #[test]
    fn work_item_roundtrips_through_json() {
        let item = WorkItem {
            notification_id: NotificationId::generate(),
            tenant_id: TenantId::new("acme"),
            trace_id: TraceId::generate(),
            recipient: PhoneNumber::parse("+14155552671").unwrap(),
            payload: MessagePayload::Text { body: "hi".into() },
            priority: Priority::High,
            attempt_number: 2,
            max_attempts: 5,
        };
        let json = serde_json::to_string(&item).unwrap();
        let parsed: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.notification_id, item.notification_id);
        assert_eq!(parsed.attempt_number, 2);
        assert_eq!(parsed.priority, Priority::High);
    }
}

//! Core domain types for the notification relay.

pub mod ids;
pub mod notification;
pub mod phone;

pub use ids::{NotificationId, ProviderMessageId, TenantId, TraceId};
pub use notification::{
    DeliveryLogEntry, MessagePayload, NewDeliveryLog, Notification, Priority, TemplateParameter,
    TemplateParameterKind, TemplateRef, WorkItem,
};
pub use phone::{CountryCode, PhoneNumber};

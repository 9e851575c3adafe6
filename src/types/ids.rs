//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! TraceId where a NotificationId is expected) and make the code more
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when parsing an invalid notification id.
#[derive(Debug, Clone, Error)]
#[error("invalid notification id: {0}")]
pub struct InvalidNotificationId(String);

/// The unique identifier of a notification.
///
/// Also serves as the queue deduplication id and the provider-side
/// idempotency anchor, so it must be stable for the lifetime of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(Uuid);

impl NotificationId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        NotificationId(Uuid::new_v4())
    }

    /// Parses a string representation, validating UUID shape.
    pub fn parse(s: &str) -> Result<Self, InvalidNotificationId> {
        Uuid::parse_str(s)
            .map(NotificationId)
            .map_err(|_| InvalidNotificationId(s.chars().take(40).collect()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant identifier.
///
/// Distinct from the API key that authenticates as the tenant: keys rotate,
/// tenant ids do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(s: impl Into<String>) -> Self {
        TenantId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trace id that flows from ingestion through the queue payload, the
/// processor, and the delivery logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(Uuid);

impl TraceId {
    pub fn generate() -> Self {
        TraceId(Uuid::new_v4())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The provider-assigned message id (e.g., `wamid.HBgL...`).
///
/// Assigned after the first successful send, set at most once, and used to
/// correlate inbound status callbacks with the originating notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderMessageId(String);

impl ProviderMessageId {
    pub fn new(s: impl Into<String>) -> Self {
        ProviderMessageId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProviderMessageId {
    fn from(s: String) -> Self {
        ProviderMessageId(s)
    }
}

//! Outbound messaging-API client.
//!
//! The relay speaks to the WhatsApp Business (Graph) API through the
//! [`ProviderClient`] trait; [`WhatsAppClient`] is the production
//! implementation. The client performs exactly one bounded attempt per
//! call — retry policy belongs to the processor, not the transport.

pub mod client;
pub mod error;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{MessagePayload, PhoneNumber, ProviderMessageId};

pub use client::{ProviderSettings, WhatsAppClient};
pub use error::{ProviderError, ProviderErrorKind};

/// The outcome of a successful send.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub provider_message_id: ProviderMessageId,
    /// Raw response snapshot, persisted into the delivery log.
    pub raw_response: Value,
}

/// Sends one message to the provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Sends `payload` to `recipient`. One attempt, bounded by the client's
    /// timeout; errors are pre-classified as transient or permanent.
    async fn send(
        &self,
        recipient: &PhoneNumber,
        payload: &MessagePayload,
    ) -> Result<SendResult, ProviderError>;
}

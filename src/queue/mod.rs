//! Work queue adapter.
//!
//! Abstracts a durable queue with visibility-timeout semantics: published
//! items become invisible while a worker holds them, reappear if the worker
//! dies without acknowledging, and are routed to a dead-letter buffer after
//! too many redeliveries. The relay requires at-least-once delivery and
//! per-message deduplication by dedup id; everything else is best-effort.
//!
//! Bodies cross the queue as serialized JSON, not typed values: an external
//! queue cannot carry Rust types, and the processor must treat a malformed
//! body as a permanent failure rather than a panic.

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::WorkItem;

pub use memory::InMemoryQueue;

/// Maximum entries accepted by [`WorkQueue::publish_batch`].
pub const MAX_BATCH_SIZE: usize = 10;

/// Queue-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueMessageId(pub String);

impl fmt::Display for QueueMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Single-use handle identifying one delivery of one message.
///
/// Invalidated when the visibility timeout expires; an acknowledge or
/// extension with a stale handle fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A publish request: the work item plus its queue metadata.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub item: WorkItem,
    /// Deduplication id; duplicates inside the dedup window are dropped.
    pub dedup_id: String,
    /// Ordering group (the recipient). Best-effort on non-FIFO queues.
    pub group_id: String,
}

impl PublishRequest {
    /// Builds the canonical request for a work item: dedup by notification
    /// id, grouped by recipient.
    pub fn for_item(item: WorkItem) -> Self {
        let dedup_id = item.notification_id.to_string();
        let group_id = item.recipient.as_str().to_string();
        PublishRequest {
            item,
            dedup_id,
            group_id,
        }
    }
}

/// One received delivery.
#[derive(Debug, Clone)]
pub struct ReceivedItem {
    pub message_id: QueueMessageId,
    pub receipt: ReceiptHandle,
    /// Serialized [`WorkItem`] JSON.
    pub body: String,
    /// How many times this message has been delivered, this one included.
    pub receive_count: u32,
}

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("batch of {0} exceeds the maximum of {MAX_BATCH_SIZE}")]
    BatchTooLarge(usize),

    #[error("failed to serialize work item: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The receipt handle does not match an in-flight delivery. Usually the
    /// visibility timeout expired and the message was redelivered.
    #[error("unknown or expired receipt handle: {0}")]
    UnknownReceipt(ReceiptHandle),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// A durable queue with visibility-timeout semantics.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publishes one item. Returns the queue message id; publishing a
    /// duplicate dedup id within the dedup window returns the original
    /// message's id without enqueueing.
    async fn publish(&self, request: PublishRequest) -> Result<QueueMessageId>;

    /// Publishes up to [`MAX_BATCH_SIZE`] items.
    async fn publish_batch(&self, requests: Vec<PublishRequest>) -> Result<Vec<QueueMessageId>>;

    /// Receives up to `max_count` items, long-polling up to `wait` when the
    /// queue is empty. Received items stay invisible for `visibility`.
    async fn receive(
        &self,
        max_count: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<ReceivedItem>>;

    /// Deletes a delivered message. The receipt must still be live.
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<()>;

    /// Resets the delivery's visibility deadline to now + `visibility`.
    async fn extend_visibility(&self, receipt: &ReceiptHandle, visibility: Duration) -> Result<()>;
}

//! In-process work queue with visibility-timeout semantics.
//!
//! Backs single-process deployments and tests; an SQS-class queue binds to
//! the same [`WorkQueue`] trait. Semantics provided:
//!
//! - at-least-once delivery: unacknowledged messages reappear after their
//!   visibility deadline, with an incremented receive count;
//! - deduplication by dedup id over a configurable window;
//! - dead-letter routing once the receive count exceeds the redrive cap;
//! - priority ordering (high first), FIFO within a priority level;
//! - long-poll receive that wakes on publish and on visibility expiry.
//!
//! Deadlines use `tokio::time::Instant`, so tests can drive redelivery with
//! a paused runtime instead of sleeping.

use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    MAX_BATCH_SIZE, PublishRequest, QueueError, QueueMessageId, ReceiptHandle, ReceivedItem,
    Result, WorkQueue,
};
use crate::types::Priority;

/// Default deduplication window, mirroring the 5-minute window of
/// SQS-class queues.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Default redrive cap: a message received more than this many times goes
/// to the dead-letter buffer.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 3;

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: QueueMessageId,
    body: String,
    group_id: String,
    priority: Priority,
    sequence: u64,
    receive_count: u32,
}

/// Heap entry ordering: higher priority first, then FIFO by sequence.
struct ReadyEntry(StoredMessage);

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.sequence == other.0.sequence
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher priority wins, and within a
        // priority the lower sequence number must surface first.
        match self.0.priority.cmp(&other.0.priority) {
            std::cmp::Ordering::Equal => other.0.sequence.cmp(&self.0.sequence),
            ordering => ordering,
        }
    }
}

struct Inflight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Default)]
struct Inner {
    ready: BinaryHeap<ReadyEntry>,
    inflight: HashMap<ReceiptHandle, Inflight>,
    dedup: HashMap<String, (Instant, QueueMessageId)>,
    dead: Vec<StoredMessage>,
    next_sequence: u64,
}

/// In-memory [`WorkQueue`] implementation.
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    dedup_window: Duration,
    max_receive_count: u32,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW, DEFAULT_MAX_RECEIVE_COUNT)
    }
}

impl InMemoryQueue {
    pub fn new(dedup_window: Duration, max_receive_count: u32) -> Self {
        InMemoryQueue {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            dedup_window,
            max_receive_count,
        }
    }

    /// Number of messages waiting or in flight. Used by the health surface.
    pub async fn depth(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.ready.len() + inner.inflight.len()
    }

    /// Bodies currently parked in the dead-letter buffer.
    pub async fn dead_letters(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.dead.iter().map(|m| m.body.clone()).collect()
    }

    /// Moves expired in-flight messages back to the ready heap.
    fn reclaim_expired(&self, inner: &mut Inner, now: Instant) {
        let expired: Vec<ReceiptHandle> = inner
            .inflight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(entry) = inner.inflight.remove(&receipt) {
                trace!(
                    message_id = %entry.message.message_id,
                    group = %entry.message.group_id,
                    receive_count = entry.message.receive_count,
                    "visibility expired, requeueing"
                );
                inner.ready.push(ReadyEntry(entry.message));
            }
        }
    }

    fn publish_locked(&self, inner: &mut Inner, request: PublishRequest, now: Instant) -> Result<QueueMessageId> {
        // Expire old dedup entries before consulting the window.
        let window = self.dedup_window;
        inner
            .dedup
            .retain(|_, (inserted, _)| now.duration_since(*inserted) < window);

        if let Some((_, original)) = inner.dedup.get(&request.dedup_id) {
            debug!(
                dedup_id = %request.dedup_id,
                message_id = %original,
                "duplicate publish suppressed by dedup window"
            );
            return Ok(original.clone());
        }

        let body = serde_json::to_string(&request.item)?;
        let message_id = QueueMessageId(Uuid::new_v4().to_string());
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        inner
            .dedup
            .insert(request.dedup_id, (now, message_id.clone()));
        inner.ready.push(ReadyEntry(StoredMessage {
            message_id: message_id.clone(),
            body,
            group_id: request.group_id,
            priority: request.item.priority,
            sequence,
            receive_count: 0,
        }));

        Ok(message_id)
    }

    /// Earliest in-flight visibility deadline, if any.
    fn next_expiry(inner: &Inner) -> Option<Instant> {
        inner.inflight.values().map(|e| e.visible_at).min()
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn publish(&self, request: PublishRequest) -> Result<QueueMessageId> {
        let now = Instant::now();
        let id = {
            let mut inner = self.inner.lock().await;
            self.publish_locked(&mut inner, request, now)?
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn publish_batch(&self, requests: Vec<PublishRequest>) -> Result<Vec<QueueMessageId>> {
        if requests.len() > MAX_BATCH_SIZE {
            return Err(QueueError::BatchTooLarge(requests.len()));
        }
        let now = Instant::now();
        let ids = {
            let mut inner = self.inner.lock().await;
            requests
                .into_iter()
                .map(|r| self.publish_locked(&mut inner, r, now))
                .collect::<Result<Vec<_>>>()?
        };
        self.notify.notify_waiters();
        Ok(ids)
    }

    async fn receive(
        &self,
        max_count: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<ReceivedItem>> {
        let deadline = Instant::now() + wait;

        loop {
            let (items, next_expiry) = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                self.reclaim_expired(&mut inner, now);

                let mut items = Vec::new();
                while items.len() < max_count {
                    let Some(ReadyEntry(mut message)) = inner.ready.pop() else {
                        break;
                    };
                    message.receive_count += 1;

                    if message.receive_count > self.max_receive_count {
                        warn!(
                            message_id = %message.message_id,
                            receive_count = message.receive_count,
                            "redrive cap exceeded, routing to dead-letter buffer"
                        );
                        inner.dead.push(message);
                        continue;
                    }

                    let receipt = ReceiptHandle(Uuid::new_v4().to_string());
                    items.push(ReceivedItem {
                        message_id: message.message_id.clone(),
                        receipt: receipt.clone(),
                        body: message.body.clone(),
                        receive_count: message.receive_count,
                    });
                    inner.inflight.insert(
                        receipt,
                        Inflight {
                            message,
                            visible_at: now + visibility,
                        },
                    );
                }

                (items, Self::next_expiry(&inner))
            };

            if !items.is_empty() {
                return Ok(items);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            // Sleep until something can change: a publish, the long-poll
            // deadline, or the earliest visibility expiry.
            let wake_at = next_expiry.map_or(deadline, |e| e.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.inflight.remove(receipt) {
            Some(entry) => {
                trace!(message_id = %entry.message.message_id, "acknowledged");
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(receipt.clone())),
        }
    }

    async fn extend_visibility(&self, receipt: &ReceiptHandle, visibility: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.inflight.get_mut(receipt) {
            Some(entry) => {
                entry.visible_at = Instant::now() + visibility;
                Ok(())
            }
            None => Err(QueueError::UnknownReceipt(receipt.clone())),
        }
    }
}

//! The delivery state machine.
//!
//! Every state change in the system funnels through [`apply`], so the legal
//! transition set is enforced in exactly one place. Stores call it under
//! their write lock, which gives compare-and-set semantics: a transition is
//! only committed if the row's current state admits it.
//!
//! ```text
//!           scheduled ──(due)──▶ queued
//!                                 │
//!                                 ▼
//!                             processing
//!                ┌───────────────┼──────────────┐
//!          (send ok)       (transient)     (permanent)
//!                ▼               ▼              ▼
//!              sent       failed/rate_limited  failed
//!                │               │
//!                │               └─(sweeper)──▶ queued
//!                ▼
//!            delivered ──(read receipt)──▶ read
//! ```
//!
//! Provider callbacks advance the forward path (sent -> delivered -> read)
//! monotonically: a callback for a state the row has already passed is a
//! no-op, never an error, because the provider delivers them out of order.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The delivery state of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Accepted with a future `scheduled_for`; not yet released.
    Scheduled,
    /// Persisted and enqueued (or awaiting re-queue), ready for a worker.
    Queued,
    /// A worker owns the item and is talking to the provider.
    Processing,
    /// The provider accepted the outbound send.
    Sent,
    /// The provider reported delivery to the recipient's device.
    Delivered,
    /// The recipient read the message. Terminal.
    Read,
    /// The send failed. Terminal unless `next_retry_at` is set.
    Failed,
    /// Deferred by the per-recipient rate limit; retried at window rollover.
    RateLimited,
}

impl DeliveryState {
    /// Returns true for states in which the outbound send already succeeded.
    ///
    /// A duplicate work item for a notification in one of these states must
    /// be acknowledged without resending.
    pub fn is_past_send(&self) -> bool {
        matches!(
            self,
            DeliveryState::Sent | DeliveryState::Delivered | DeliveryState::Read
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryState::Scheduled => "scheduled",
            DeliveryState::Queued => "queued",
            DeliveryState::Processing => "processing",
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
            DeliveryState::Failed => "failed",
            DeliveryState::RateLimited => "rate_limited",
        };
        write!(f, "{}", s)
    }
}

/// An event that drives a delivery state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A scheduled notification became due (promoter).
    Promote,
    /// A failed or rate-limited notification is being re-driven (sweeper).
    Requeue,
    /// A worker claimed the item for processing.
    BeginProcessing,
    /// The provider accepted the send.
    SendSucceeded,
    /// The send failed transiently and retry budget remains.
    SendFailedRetriable,
    /// The send failed permanently (or the retry budget is exhausted).
    SendFailedPermanent,
    /// The per-recipient rate limit deferred the send.
    RateLimitDeferred,
    /// Provider callback: message accepted (`sent`).
    ProviderSent,
    /// Provider callback: message delivered to the device.
    ProviderDelivered,
    /// Provider callback: message read by the recipient.
    ProviderRead,
    /// Provider callback: downstream delivery failed. Terminal, no retry.
    ProviderFailed,
}

impl fmt::Display for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error returned when an event is not legal in the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition: {event} from {from}")]
pub struct IllegalTransition {
    pub from: DeliveryState,
    pub event: DeliveryEvent,
}

/// Computes the next state for `event` applied in state `current`.
///
/// Returns the (possibly unchanged) next state, or [`IllegalTransition`] if
/// the event is not admissible. An unchanged result is how idempotent paths
/// are expressed: re-claiming an item already in `processing`, or applying a
/// callback the row has already advanced past.
pub fn apply(
    current: DeliveryState,
    event: DeliveryEvent,
) -> Result<DeliveryState, IllegalTransition> {
    use DeliveryEvent as E;
    use DeliveryState as S;

    let next = match (current, event) {
        (S::Scheduled, E::Promote) => S::Queued,

        // Sweeper re-drive of transiently failed or rate-limited items.
        (S::Failed | S::RateLimited, E::Requeue) => S::Queued,

        // A worker claims the item. Queued is the normal path; Failed,
        // RateLimited and Scheduled are accepted so the sweepers can drive
        // the processor directly; Processing is the at-least-once takeover.
        (S::Queued | S::Failed | S::RateLimited | S::Scheduled, E::BeginProcessing) => {
            S::Processing
        }
        (S::Processing, E::BeginProcessing) => S::Processing,

        (S::Processing, E::SendSucceeded) => S::Sent,
        (S::Processing, E::SendFailedRetriable) => S::Failed,
        (S::Processing, E::SendFailedPermanent) => S::Failed,
        (S::Processing, E::RateLimitDeferred) => S::RateLimited,

        // Forward path driven by provider callbacks, monotonic: an event for
        // a milestone the row already passed leaves the state unchanged.
        (S::Sent, E::ProviderSent) => S::Sent,
        (S::Sent, E::ProviderDelivered) => S::Delivered,
        (S::Sent, E::ProviderRead) => S::Read,
        (S::Delivered, E::ProviderSent) => S::Delivered,
        (S::Delivered, E::ProviderDelivered) => S::Delivered,
        (S::Delivered, E::ProviderRead) => S::Read,
        (S::Read, E::ProviderSent | E::ProviderDelivered | E::ProviderRead) => S::Read,

        // Downstream failure reported after the send was accepted.
        (S::Sent | S::Delivered, E::ProviderFailed) => S::Failed,

        (from, event) => return Err(IllegalTransition { from, event }),
    };

    Ok(next)
}

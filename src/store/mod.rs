//! Persistence interfaces and their in-process implementations.
//!
//! The relational store is an external collaborator; the relay talks to it
//! through the [`NotificationStore`] and [`RateLimitStore`] traits. Every
//! component receives its stores by constructor injection so tests can
//! substitute the in-memory implementations deterministically.
//!
//! The in-memory implementations are not mere stubs: they enforce the same
//! atomicity contract a SQL implementation must provide (compare-and-set
//! state transitions, atomic window upserts) and back single-process
//! deployments.

pub mod notifications;
pub mod rate_limit;

use thiserror::Error;

use crate::state::IllegalTransition;
use crate::types::NotificationId;

pub use notifications::{
    ListFilter, MemoryNotificationStore, NewNotification, NotificationStore, Page, StatePatch,
    TenantStats,
};
pub use rate_limit::{MemoryRateLimitStore, RateLimitStore};

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced notification does not exist.
    #[error("notification not found")]
    NotFound,

    /// The requested state transition is not legal from the current state.
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// A notification with the same idempotency key already exists.
    #[error("duplicate idempotency key (existing notification {0})")]
    DuplicateIdempotencyKey(NotificationId),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

//! Notification store: durable record of each notification plus its
//! append-only delivery log.
//!
//! All mutators are atomic and check the state-machine predicate
//! ([`crate::state::apply`]) before writing, so an illegal transition can
//! never be committed regardless of interleaving. The in-memory
//! implementation takes a single write lock per mutation, which makes every
//! transition linearizable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Result, StoreError};
use crate::clock::Clock;
use crate::state::{self, DeliveryEvent, DeliveryState};
use crate::types::{
    DeliveryLogEntry, MessagePayload, NewDeliveryLog, Notification, NotificationId, Priority,
    ProviderMessageId, TenantId, TraceId,
};
use crate::types::phone::{CountryCode, PhoneNumber};

/// Fields for a new notification row.
///
/// The caller generates the id and trace id; the store stamps the
/// creation timestamps and zeroes the attempt counter.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub id: NotificationId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub recipient: PhoneNumber,
    pub country_code: Option<CountryCode>,
    pub payload: MessagePayload,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub priority: Priority,
    /// Initial state: `Queued`, or `Scheduled` when `scheduled_for` is set.
    pub state: DeliveryState,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: u32,
    pub idempotency_key: Option<String>,
    pub trace_id: TraceId,
}

/// Field updates applied together with a state transition.
///
/// Timestamps are monotonic: a patch can set an unset timestamp or move it
/// forward, never backward. `provider_message_id` is set at most once.
/// `next_retry_at` uses double-option semantics: `None` leaves it alone,
/// `Some(None)` clears it, `Some(Some(t))` sets it.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<ProviderMessageId>,
    /// `(code, message)` of the most recent error.
    pub error: Option<(String, String)>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    /// Bump the attempt counter as part of the same atomic write. This is
    /// how §"one attempt, one transition" composes: the processor never
    /// needs a separate increment call that could interleave.
    pub increment_attempt: bool,
}

impl StatePatch {
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some((code.into(), message.into()));
        self
    }
}

/// Filters for tenant-scoped listing.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<DeliveryState>,
    pub event_type: Option<String>,
}

/// Pagination; `page` is 1-based.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Page { page: 1, limit: 20 }
    }
}

/// Aggregate delivery statistics for a tenant over a date range.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TenantStats {
    pub total: u64,
    pub by_state: HashMap<String, u64>,
    /// Mean outbound latency across logged attempts, if any were recorded.
    pub average_latency_ms: Option<f64>,
}

/// Durable record of notifications and their delivery logs.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persists a new notification.
    ///
    /// Fails with [`StoreError::DuplicateIdempotencyKey`] if the tenant has
    /// already created a row under the same idempotency key.
    async fn create(&self, new: NewNotification) -> Result<Notification>;

    async fn find_by_id(&self, id: NotificationId) -> Result<Option<Notification>>;

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &ProviderMessageId,
    ) -> Result<Option<Notification>>;

    async fn find_by_idempotency_key(
        &self,
        tenant: &TenantId,
        key: &str,
    ) -> Result<Option<Notification>>;

    /// Applies `event` to the notification's state and writes `patch`
    /// atomically. Rejects transitions the state machine does not admit.
    async fn update_state(
        &self,
        id: NotificationId,
        event: DeliveryEvent,
        patch: StatePatch,
    ) -> Result<Notification>;

    /// Appends one delivery-log row.
    async fn append_log(&self, id: NotificationId, log: NewDeliveryLog) -> Result<()>;

    /// Returns the most recent log rows for a notification, newest first.
    async fn logs_for(&self, id: NotificationId, limit: usize) -> Result<Vec<DeliveryLogEntry>>;

    /// Notifications due for a retry: retry time reached and attempt budget
    /// remaining, ordered by `next_retry_at` ascending.
    async fn find_due_retries(&self, limit: usize) -> Result<Vec<Notification>>;

    /// Scheduled notifications whose release time has passed, ordered by
    /// `scheduled_for` ascending.
    async fn find_due_scheduled(&self, limit: usize) -> Result<Vec<Notification>>;

    /// Tenant-scoped listing for the analytics surface; newest first.
    /// Returns the page plus the total match count.
    async fn list_by_tenant(
        &self,
        tenant: &TenantId,
        filter: ListFilter,
        page: Page,
    ) -> Result<(Vec<Notification>, u64)>;

    /// Aggregate counts and latency over a creation-date range.
    async fn stats(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TenantStats>;

    /// Startup reconciliation: stamps `next_retry_at = now` on queued rows
    /// that have none, so rows whose enqueue was lost (crash between persist
    /// and publish) are re-driven by the retry sweeper. Returns the number
    /// of rows stamped.
    async fn reconcile_startup(&self) -> Result<u64>;
}

// ─── In-memory implementation ────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    rows: HashMap<NotificationId, Notification>,
    logs: HashMap<NotificationId, Vec<DeliveryLogEntry>>,
    idempotency: HashMap<(TenantId, String), NotificationId>,
    by_provider_id: HashMap<ProviderMessageId, NotificationId>,
}

/// In-memory [`NotificationStore`] with full CAS semantics.
pub struct MemoryNotificationStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryNotificationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryNotificationStore {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }
}

/// Moves a timestamp forward, never backward; an unset value is always set.
fn advance(slot: &mut Option<DateTime<Utc>>, value: Option<DateTime<Utc>>) {
    if let Some(v) = value {
        match slot {
            Some(existing) if *existing >= v => {}
            _ => *slot = Some(v),
        }
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, new: NewNotification) -> Result<Notification> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;

        if let Some(key) = &new.idempotency_key {
            let lookup = (new.tenant_id.clone(), key.clone());
            if let Some(existing) = inner.idempotency.get(&lookup) {
                return Err(StoreError::DuplicateIdempotencyKey(*existing));
            }
            inner.idempotency.insert(lookup, new.id);
        }

        let row = Notification {
            id: new.id,
            tenant_id: new.tenant_id,
            event_type: new.event_type,
            recipient: new.recipient,
            country_code: new.country_code,
            payload: new.payload,
            metadata: new.metadata,
            priority: new.priority,
            state: new.state,
            provider_message_id: None,
            created_at: now,
            updated_at: now,
            scheduled_for: new.scheduled_for,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            attempt_number: 0,
            max_attempts: new.max_attempts,
            next_retry_at: None,
            last_error_code: None,
            last_error_message: None,
            idempotency_key: new.idempotency_key,
            trace_id: new.trace_id,
        };

        inner.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_by_id(&self, id: NotificationId) -> Result<Option<Notification>> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &ProviderMessageId,
    ) -> Result<Option<Notification>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_provider_id
            .get(provider_message_id)
            .and_then(|id| inner.rows.get(id))
            .cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        tenant: &TenantId,
        key: &str,
    ) -> Result<Option<Notification>> {
        let inner = self.inner.read().await;
        Ok(inner
            .idempotency
            .get(&(tenant.clone(), key.to_string()))
            .and_then(|id| inner.rows.get(id))
            .cloned())
    }

    async fn update_state(
        &self,
        id: NotificationId,
        event: DeliveryEvent,
        patch: StatePatch,
    ) -> Result<Notification> {
        let now = self.clock.now();
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let row = inner.rows.get_mut(&id).ok_or(StoreError::NotFound)?;

        // CAS: the transition is checked against the current state under
        // the write lock, so no interleaving can commit an illegal write.
        row.state = state::apply(row.state, event)?;

        advance(&mut row.sent_at, patch.sent_at);
        advance(&mut row.delivered_at, patch.delivered_at);
        advance(&mut row.read_at, patch.read_at);
        advance(&mut row.failed_at, patch.failed_at);

        if let Some(pmid) = patch.provider_message_id {
            // Set at most once, never cleared.
            if row.provider_message_id.is_none() {
                row.provider_message_id = Some(pmid.clone());
                inner
                    .by_provider_id
                    .entry(pmid)
                    .or_insert(id);
            }
        }

        if let Some((code, message)) = patch.error {
            row.last_error_code = Some(code);
            row.last_error_message = Some(message);
        }

        if let Some(next_retry_at) = patch.next_retry_at {
            row.next_retry_at = next_retry_at;
        }

        if patch.increment_attempt {
            row.attempt_number += 1;
        }

        row.updated_at = now;
        Ok(row.clone())
    }

    async fn append_log(&self, id: NotificationId, log: NewDeliveryLog) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        if !inner.rows.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        let entry = DeliveryLogEntry {
            notification_id: id,
            attempt: log.attempt,
            state: log.state.unwrap_or(DeliveryState::Queued),
            provider_message_id: log.provider_message_id,
            error_code: log.error_code,
            error_message: log.error_message,
            latency_ms: log.latency_ms,
            response: log.response,
            created_at: now,
        };
        inner.logs.entry(id).or_default().push(entry);
        Ok(())
    }

    async fn logs_for(&self, id: NotificationId, limit: usize) -> Result<Vec<DeliveryLogEntry>> {
        let inner = self.inner.read().await;
        let mut logs = inner.logs.get(&id).cloned().unwrap_or_default();
        logs.reverse();
        logs.truncate(limit);
        Ok(logs)
    }

    async fn find_due_retries(&self, limit: usize) -> Result<Vec<Notification>> {
        let now = self.clock.now();
        let inner = self.inner.read().await;
        let mut due: Vec<Notification> = inner
            .rows
            .values()
            .filter(|n| {
                matches!(
                    n.state,
                    DeliveryState::Failed | DeliveryState::RateLimited | DeliveryState::Queued
                ) && n.next_retry_at.is_some_and(|t| t <= now)
                    && n.attempt_number < n.max_attempts
            })
            .cloned()
            .collect();
        due.sort_by_key(|n| n.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_due_scheduled(&self, limit: usize) -> Result<Vec<Notification>> {
        let now = self.clock.now();
        let inner = self.inner.read().await;
        let mut due: Vec<Notification> = inner
            .rows
            .values()
            .filter(|n| {
                n.state == DeliveryState::Scheduled && n.scheduled_for.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|n| n.scheduled_for);
        due.truncate(limit);
        Ok(due)
    }

    async fn list_by_tenant(
        &self,
        tenant: &TenantId,
        filter: ListFilter,
        page: Page,
    ) -> Result<(Vec<Notification>, u64)> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Notification> = inner
            .rows
            .values()
            .filter(|n| &n.tenant_id == tenant)
            .filter(|n| filter.state.is_none_or(|s| n.state == s))
            .filter(|n| {
                filter
                    .event_type
                    .as_deref()
                    .is_none_or(|e| n.event_type == e)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matches.len() as u64;
        let limit = page.limit.max(1);
        let start = (page.page.max(1) - 1) * limit;
        let items = matches.into_iter().skip(start).take(limit).collect();
        Ok((items, total))
    }

    async fn stats(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TenantStats> {
        let inner = self.inner.read().await;
        let mut stats = TenantStats::default();
        let mut latency_sum: u64 = 0;
        let mut latency_count: u64 = 0;

        for n in inner.rows.values() {
            if &n.tenant_id != tenant || n.created_at < from || n.created_at > to {
                continue;
            }
            stats.total += 1;
            *stats.by_state.entry(n.state.to_string()).or_default() += 1;

            for log in inner.logs.get(&n.id).into_iter().flatten() {
                if let Some(ms) = log.latency_ms {
                    latency_sum += ms;
                    latency_count += 1;
                }
            }
        }

        if latency_count > 0 {
            stats.average_latency_ms = Some(latency_sum as f64 / latency_count as f64);
        }
        Ok(stats)
    }

    async fn reconcile_startup(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let mut stamped = 0;
        for row in inner.rows.values_mut() {
            if row.state == DeliveryState::Queued && row.next_retry_at.is_none() {
                row.next_retry_at = Some(now);
                row.updated_at = now;
                stamped += 1;
            }
        }
        Ok(stamped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::test_utils::{new_notification, test_clock};
    use chrono::Duration;

    fn store_with_clock() -> (MemoryNotificationStore, Arc<FixedClock>) {
        let clock = test_clock();
        let store = MemoryNotificationStore::new(clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn create_then_find() {
        let (store, _) = store_with_clock();
        let new = new_notification("order.placed", "+14155552671");
        let id = new.id;

        let created = store.create(new).await.unwrap();
        assert_eq!(created.state, DeliveryState::Queued);
        assert_eq!(created.attempt_number, 0);

        let found = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(found.id, id);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let (store, _) = store_with_clock();
        let mut first = new_notification("order.placed", "+14155552671");
        first.idempotency_key = Some("req-1".into());
        let first_id = first.id;
        store.create(first).await.unwrap();

        let mut second = new_notification("order.placed", "+14155552671");
        second.idempotency_key = Some("req-1".into());
        let err = store.create(second).await.unwrap_err();
        match err {
            StoreError::DuplicateIdempotencyKey(existing) => assert_eq!(existing, first_id),
            other => panic!("unexpected error: {other}"),
        }

        let found = store
            .find_by_idempotency_key(&TenantId::new("acme"), "req-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first_id);
    }

    #[tokio::test]
    async fn update_state_rejects_illegal_transition() {
        let (store, _) = store_with_clock();
        let new = new_notification("order.placed", "+14155552671");
        let id = new.id;
        store.create(new).await.unwrap();

        // queued -> sent without processing is illegal
        let err = store
            .update_state(id, DeliveryEvent::SendSucceeded, StatePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition(_)));

        // and the row is untouched
        let row = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.state, DeliveryState::Queued);
    }

    #[tokio::test]
    async fn provider_message_id_is_set_at_most_once() {
        let (store, clock) = store_with_clock();
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
                    sent_at: Some(clock.now()),
                    provider_message_id: Some(ProviderMessageId::new("wamid.first")),
                    increment_attempt: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // A later patch with a different id must not overwrite it.
        let row = store
            .update_state(
                id,
                DeliveryEvent::ProviderDelivered,
                StatePatch {
                    delivered_at: Some(clock.now()),
                    provider_message_id: Some(ProviderMessageId::new("wamid.second")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            row.provider_message_id,
            Some(ProviderMessageId::new("wamid.first"))
        );

        // Lookup goes through the original id.
        let found = store
            .find_by_provider_message_id(&ProviderMessageId::new("wamid.first"))
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn timestamps_never_move_backward() {
        let (store, clock) = store_with_clock();
        let new = new_notification("order.placed", "+14155552671");
        let id = new.id;
        store.create(new).await.unwrap();
        store
            .update_state(id, DeliveryEvent::BeginProcessing, StatePatch::default())
            .await
            .unwrap();

        let later = clock.now() + Duration::seconds(30);
        let earlier = clock.now() + Duration::seconds(10);

        store
            .update_state(
                id,
                DeliveryEvent::SendSucceeded,
                StatePatch {
                    sent_at: Some(later),
                    provider_message_id: Some(ProviderMessageId::new("wamid.x")),
                    increment_attempt: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let row = store
            .update_state(
                id,
                DeliveryEvent::ProviderSent,
                StatePatch {
                    sent_at: Some(earlier),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(row.sent_at, Some(later));
    }

    #[tokio::test]
    async fn due_retries_are_ordered_and_budget_checked() {
        let (store, clock) = store_with_clock();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let new = new_notification("order.placed", "+14155552671");
            ids.push(new.id);
            store.create(new).await.unwrap();
            store
                .update_state(ids[ids.len() - 1], DeliveryEvent::BeginProcessing, StatePatch::default())
                .await
                .unwrap();
        }

        // Fail each with staggered retry times; the middle one exhausts its budget.
        for (i, id) in ids.iter().enumerate() {
            let mut patch = StatePatch {
                next_retry_at: Some(Some(clock.now() - Duration::seconds(30 - i as i64 * 10))),
                increment_attempt: true,
                ..Default::default()
            };
            if i == 1 {
                patch.next_retry_at = Some(None);
            }
            store
                .update_state(*id, DeliveryEvent::SendFailedRetriable, patch)
                .await
                .unwrap();
        }

        let due = store.find_due_retries(10).await.unwrap();
        assert_eq!(due.len(), 2);
        // Oldest retry time first
        assert_eq!(due[0].id, ids[0]);
        assert_eq!(due[1].id, ids[2]);
    }

    #[tokio::test]
    async fn due_retries_skip_future_times() {
        let (store, clock) = store_with_clock();
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
                DeliveryEvent::SendFailedRetriable,
                StatePatch {
                    next_retry_at: Some(Some(clock.now() + Duration::seconds(60))),
                    increment_attempt: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(store.find_due_retries(10).await.unwrap().is_empty());
        clock.advance(Duration::seconds(61));
        assert_eq!(store.find_due_retries(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn due_scheduled_released_by_time() {
        let (store, clock) = store_with_clock();
        let mut new = new_notification("reminder", "+14155552671");
        new.state = DeliveryState::Scheduled;
        new.scheduled_for = Some(clock.now() + Duration::minutes(2));
        let id = new.id;
        store.create(new).await.unwrap();

        assert!(store.find_due_scheduled(10).await.unwrap().is_empty());
        clock.advance(Duration::minutes(3));
        let due = store.find_due_scheduled(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
    }

    #[tokio::test]
    async fn reconcile_stamps_orphaned_queued_rows() {
        let (store, _) = store_with_clock();
        let new = new_notification("order.placed", "+14155552671");
        let id = new.id;
        store.create(new).await.unwrap();

        let stamped = store.reconcile_startup().await.unwrap();
        assert_eq!(stamped, 1);

        // Now the retry sweeper will pick it up.
        let due = store.find_due_retries(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);

        // Idempotent: a second pass finds nothing to stamp.
        assert_eq!(store.reconcile_startup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_by_tenant_filters_and_paginates() {
        let (store, _) = store_with_clock();
        for i in 0..5 {
            let mut new = new_notification(
                if i % 2 == 0 { "order.placed" } else { "order.shipped" },
                "+14155552671",
            );
            new.tenant_id = TenantId::new("acme");
            store.create(new).await.unwrap();
        }
        let mut other = new_notification("order.placed", "+14155552671");
        other.tenant_id = TenantId::new("globex");
        store.create(other).await.unwrap();

        let (items, total) = store
            .list_by_tenant(
                &TenantId::new("acme"),
                ListFilter {
                    event_type: Some("order.placed".into()),
                    ..Default::default()
                },
                Page { page: 1, limit: 2 },
            )
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|n| n.event_type == "order.placed"));
    }

    #[tokio::test]
    async fn logs_are_append_only_and_newest_first() {
        let (store, _) = store_with_clock();
        let new = new_notification("order.placed", "+14155552671");
        let id = new.id;
        store.create(new).await.unwrap();

        for attempt in 1..=3 {
            store
                .append_log(
                    id,
                    NewDeliveryLog {
                        attempt,
                        state: Some(DeliveryState::Failed),
                        error_code: Some("503".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let logs = store.logs_for(id, 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].attempt, 3);
        assert_eq!(logs[1].attempt, 2);
    }
}

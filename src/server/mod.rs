//! HTTP surface of the relay.
//!
//! # Endpoints
//!
//! - `POST /v1/notifications` - accept a notification (API-key auth)
//! - `POST /v1/notifications/bulk` - accept up to 100 notifications
//! - `GET  /v1/notifications/{id}/status` - tenant-scoped delivery status
//! - `GET  /v1/analytics/stats` - aggregate counts and latency
//! - `GET  /v1/analytics/notifications` - paginated listing
//! - `GET  /v1/webhooks/provider` - subscription challenge echo
//! - `POST /v1/webhooks/provider` - provider status callbacks
//! - `GET  /health`, `GET /v1/health` - liveness and dependency health

pub mod analytics;
pub mod auth;
pub mod error;
pub mod health;
pub mod notifications;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::callback::CallbackHandler;
use crate::clock::Clock;
use crate::ingest::IngestionService;
use crate::queue::InMemoryQueue;
use crate::store::NotificationStore;
use crate::types::TenantId;

pub use error::ApiError;

/// Shared application state, passed to handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    ingestion: IngestionService,
    callbacks: CallbackHandler,
    store: Arc<dyn NotificationStore>,
    /// Held for the health surface; queue publishing goes through the
    /// ingestion service.
    queue: Arc<InMemoryQueue>,
    clock: Arc<dyn Clock>,
    api_keys: HashMap<String, TenantId>,
    webhook_verify_token: String,
    webhook_app_secret: Option<Vec<u8>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ingestion: IngestionService,
        callbacks: CallbackHandler,
        store: Arc<dyn NotificationStore>,
        queue: Arc<InMemoryQueue>,
        clock: Arc<dyn Clock>,
        api_keys: HashMap<String, TenantId>,
        webhook_verify_token: impl Into<String>,
        webhook_app_secret: Option<Vec<u8>>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                ingestion,
                callbacks,
                store,
                queue,
                clock,
                api_keys,
                webhook_verify_token: webhook_verify_token.into(),
                webhook_app_secret,
            }),
        }
    }

    pub fn ingestion(&self) -> &IngestionService {
        &self.inner.ingestion
    }

    pub fn callbacks(&self) -> &CallbackHandler {
        &self.inner.callbacks
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.inner.store
    }

    pub fn queue(&self) -> &Arc<InMemoryQueue> {
        &self.inner.queue
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn api_keys(&self) -> &HashMap<String, TenantId> {
        &self.inner.api_keys
    }

    pub fn webhook_verify_token(&self) -> &str {
        &self.inner.webhook_verify_token
    }

    pub fn webhook_app_secret(&self) -> Option<&[u8]> {
        self.inner.webhook_app_secret.as_deref()
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/notifications", post(notifications::create_handler))
        .route(
            "/v1/notifications/bulk",
            post(notifications::create_bulk_handler),
        )
        .route(
            "/v1/notifications/{id}/status",
            get(notifications::status_handler),
        )
        .route("/v1/analytics/stats", get(analytics::stats_handler))
        .route(
            "/v1/analytics/notifications",
            get(analytics::list_handler),
        )
        .route(
            "/v1/webhooks/provider",
            get(webhook::verify_handler).post(webhook::callback_handler),
        )
        .route("/health", get(health::liveness_handler))
        .route("/v1/health", get(health::health_handler))
        .with_state(state)
}

#[cfg(test)]
pub mod test_support {
    //! Builders for handler tests.

    use super::*;
    use crate::clock::FixedClock;
    use crate::ingest::IngestionConfig;
    use crate::store::{MemoryNotificationStore, MemoryRateLimitStore};
    use crate::test_utils::test_clock;

    pub struct TestApp {
        pub state: AppState,
        pub store: Arc<MemoryNotificationStore>,
        pub queue: Arc<InMemoryQueue>,
        pub clock: Arc<FixedClock>,
    }

    /// An app with one API key (`test-key` -> tenant `acme`) and webhook
    /// verify token `verify-me`.
    pub fn test_app() -> TestApp {
        test_app_with_secret(None)
    }

    pub fn test_app_with_secret(webhook_app_secret: Option<Vec<u8>>) -> TestApp {
        let clock = test_clock();
        let store = Arc::new(MemoryNotificationStore::new(clock.clone()));
        let rate_limits = Arc::new(MemoryRateLimitStore::new(clock.clone()));
        let queue = Arc::new(InMemoryQueue::default());

        let ingestion = IngestionService::new(
            store.clone(),
            rate_limits,
            queue.clone(),
            clock.clone(),
            IngestionConfig::default(),
        );
        let callbacks = CallbackHandler::new(store.clone(), clock.clone());

        let mut api_keys = HashMap::new();
        api_keys.insert("test-key".to_string(), TenantId::new("acme"));
        api_keys.insert("other-key".to_string(), TenantId::new("globex"));

        let state = AppState::new(
            ingestion,
            callbacks,
            store.clone(),
            queue.clone(),
            clock.clone(),
            api_keys,
            "verify-me",
            webhook_app_secret,
        );
        TestApp {
            state,
            store,
            queue,
            clock,
        }
    }
}

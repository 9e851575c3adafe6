//! End-to-end pipeline scenarios: ingestion through terminal outcome,
//! against the in-process stores and queue, a scripted provider, and a
//! frozen clock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use notify_relay::callback::CallbackHandler;
use notify_relay::clock::{Clock, FixedClock};
use notify_relay::ingest::{IngestionConfig, IngestionService};
use notify_relay::processor::{BackoffConfig, Processor, ProcessorConfig};
use notify_relay::provider::{ProviderClient, ProviderError, SendResult};
use notify_relay::queue::{InMemoryQueue, WorkQueue};
use notify_relay::server::{AppState, build_router};
use notify_relay::state::DeliveryState;
use notify_relay::store::{
    MemoryNotificationStore, MemoryRateLimitStore, NotificationStore, RateLimitStore,
};
use notify_relay::sweeper::{RetryScheduler, SchedulePromoter};
use notify_relay::types::{
    MessagePayload, NotificationId, PhoneNumber, ProviderMessageId, TenantId,
};
use notify_relay::worker::{WorkerPool, WorkerPoolConfig};

/// Provider stub whose outcomes are scripted up front; succeeds with a
/// generated id once the script runs dry.
struct StubProvider {
    script: Mutex<VecDeque<Result<SendResult, ProviderError>>>,
    calls: std::sync::atomic::AtomicU32,
}

impl StubProvider {
    fn new() -> Self {
        StubProvider {
            script: Mutex::new(VecDeque::new()),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    async fn push_ok(&self, wamid: &str) {
        self.script.lock().await.push_back(Ok(SendResult {
            provider_message_id: ProviderMessageId::new(wamid),
            raw_response: json!({ "messages": [{ "id": wamid }] }),
        }));
    }

    async fn push_err(&self, error: ProviderError) {
        self.script.lock().await.push_back(Err(error));
    }

    fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for StubProvider {
    async fn send(
        &self,
        _recipient: &PhoneNumber,
        _payload: &MessagePayload,
    ) -> Result<SendResult, ProviderError> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        match self.script.lock().await.pop_front() {
            Some(outcome) => outcome,
            None => {
                let wamid = format!("wamid.auto-{call}");
                Ok(SendResult {
                    provider_message_id: ProviderMessageId::new(&wamid),
                    raw_response: json!({ "messages": [{ "id": wamid }] }),
                })
            }
        }
    }
}

struct Pipeline {
    clock: Arc<FixedClock>,
    store: Arc<MemoryNotificationStore>,
    rate_limits: Arc<MemoryRateLimitStore>,
    queue: Arc<InMemoryQueue>,
    provider: Arc<StubProvider>,
    processor: Arc<Processor>,
    state: AppState,
}

fn pipeline() -> Pipeline {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap(),
    ));
    let store = Arc::new(MemoryNotificationStore::new(clock.clone()));
    let rate_limits = Arc::new(MemoryRateLimitStore::new(clock.clone()));
    let queue = Arc::new(InMemoryQueue::default());
    let provider = Arc::new(StubProvider::new());

    let processor = Arc::new(Processor::new(
        store.clone(),
        rate_limits.clone(),
        provider.clone(),
        clock.clone(),
        ProcessorConfig {
            // Test profile: 1 s backoff baseline.
            backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(3600)),
            recipient_limit_per_hour: 10,
        },
    ));

    let ingestion = IngestionService::new(
        store.clone(),
        rate_limits.clone(),
        queue.clone(),
        clock.clone(),
        IngestionConfig::default(),
    );
    let callbacks = CallbackHandler::new(store.clone(), clock.clone());

    let mut api_keys = std::collections::HashMap::new();
    api_keys.insert("test-key".to_string(), TenantId::new("acme"));

    let state = AppState::new(
        ingestion,
        callbacks,
        store.clone(),
        queue.clone(),
        clock.clone(),
        api_keys,
        "verify-me",
        None,
    );

    Pipeline {
        clock,
        store,
        rate_limits,
        queue,
        provider,
        processor,
        state,
    }
}

fn post_notification(body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/notifications")
        .header("content-type", "application/json")
        .header("x-api-key", "test-key")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Drains the queue through the processor, the way the worker pool would.
async fn drain_queue(p: &Pipeline) {
    loop {
        let items = p
            .queue
            .receive(10, Duration::ZERO, Duration::from_secs(30))
            .await
            .unwrap();
        if items.is_empty() {
            break;
        }
        for item in items {
            p.processor.process_received(&item.body).await.unwrap();
            p.queue.acknowledge(&item.receipt).await.unwrap();
        }
    }
}

// ─── S1: happy path ───

#[tokio::test]
async fn s1_happy_path_post_to_sent() {
    let p = pipeline();
    p.provider.push_ok("wamid.X").await;

    let response = build_router(p.state.clone())
        .oneshot(post_notification(&json!({
            "event_type": "order.placed",
            "recipient": { "phone_number": "+14155552671" },
            "template": { "name": "order_confirmation", "language": "en" }
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = json_body(response).await;
    assert_eq!(body["status"], "queued");
    let id = NotificationId::parse(body["id"].as_str().unwrap()).unwrap();

    drain_queue(&p).await;

    let row = p.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, DeliveryState::Sent);
    assert_eq!(row.provider_message_id.unwrap().as_str(), "wamid.X");
    assert_eq!(row.attempt_number, 1);

    let logs = p.store.logs_for(id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].state, DeliveryState::Sent);
    assert_eq!(logs[0].attempt, 1);
}

// ─── S2: transient then success ───

#[tokio::test]
async fn s2_transient_failure_then_success() {
    let p = pipeline();
    p.provider
        .push_err(ProviderError::classify(503, None, "service unavailable"))
        .await;
    p.provider.push_ok("wamid.Y").await;

    let response = build_router(p.state.clone())
        .oneshot(post_notification(&json!({
            "event_type": "order.placed",
            "recipient": { "phone_number": "+14155552671" },
            "template": { "name": "order_confirmation", "language": "en" }
        })))
        .await
        .unwrap();
    let id = NotificationId::parse(json_body(response).await["id"].as_str().unwrap()).unwrap();

    drain_queue(&p).await;

    // First attempt failed transiently; the retry delay respects the 1 s
    // test baseline and the 25% jitter ceiling.
    let row = p.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, DeliveryState::Failed);
    let delay = row.next_retry_at.unwrap() - p.clock.now();
    assert!(delay >= chrono::Duration::seconds(1));
    assert!(delay <= chrono::Duration::milliseconds(1250));

    // The retry sweeper re-drives it once due.
    let scheduler = RetryScheduler::new(p.store.clone(), p.processor.clone(), Duration::from_secs(60));
    assert_eq!(scheduler.tick().await.unwrap(), 0, "not due yet");
    p.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(scheduler.tick().await.unwrap(), 1);

    let row = p.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, DeliveryState::Sent);
    assert_eq!(row.attempt_number, 2);

    let logs = p.store.logs_for(id, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    // Newest first: sent (attempt 2), then failed (attempt 1, code 503).
    assert_eq!(logs[0].state, DeliveryState::Sent);
    assert_eq!(logs[0].attempt, 2);
    assert_eq!(logs[1].state, DeliveryState::Failed);
    assert_eq!(logs[1].attempt, 1);
    assert_eq!(logs[1].error_code.as_deref(), Some("503"));
}

// ─── S3: permanent failure ───

#[tokio::test]
async fn s3_permanent_provider_code_is_terminal() {
    let p = pipeline();
    p.provider
        .push_err(ProviderError::classify(400, Some(131026), "invalid phone"))
        .await;

    let response = build_router(p.state.clone())
        .oneshot(post_notification(&json!({
            "event_type": "order.placed",
            "recipient": { "phone_number": "+14155552671" },
            "message": { "text": "hello" }
        })))
        .await
        .unwrap();
    let id = NotificationId::parse(json_body(response).await["id"].as_str().unwrap()).unwrap();

    drain_queue(&p).await;

    let row = p.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, DeliveryState::Failed);
    assert!(row.failed_at.is_some());
    assert!(row.next_retry_at.is_none());
    assert_eq!(p.store.logs_for(id, 10).await.unwrap().len(), 1);
}

// ─── S4: rate limited at ingestion ───

#[tokio::test]
async fn s4_eleventh_message_in_hour_is_rejected() {
    let p = pipeline();
    let phone = PhoneNumber::parse("+14155552671").unwrap();
    for _ in 0..10 {
        p.rate_limits.increment(&phone).await.unwrap();
    }

    let response = build_router(p.state.clone())
        .oneshot(post_notification(&json!({
            "event_type": "order.placed",
            "recipient": { "phone_number": "+14155552671" },
            "message": { "text": "one too many" }
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));

    let body = json_body(response).await;
    assert!(body["retry_after_seconds"].as_u64().unwrap() > 0);

    // No notification row was created.
    let (_, total) = p
        .store
        .list_by_tenant(
            &TenantId::new("acme"),
            Default::default(),
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(total, 0);
}

// ─── S5: scheduled delivery ───

#[tokio::test]
async fn s5_scheduled_notification_promotes_and_sends() {
    let p = pipeline();
    p.provider.push_ok("wamid.S").await;

    let scheduled_for = (p.clock.now() + chrono::Duration::minutes(2)).to_rfc3339();
    let response = build_router(p.state.clone())
        .oneshot(post_notification(&json!({
            "event_type": "appointment.reminder",
            "recipient": { "phone_number": "+14155552671" },
            "message": { "text": "see you at 3pm" },
            "scheduled_for": scheduled_for
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["status"], "scheduled");
    let id = NotificationId::parse(body["id"].as_str().unwrap()).unwrap();

    // Nothing on the queue, nothing due yet.
    assert_eq!(p.queue.depth().await, 0);
    let promoter =
        SchedulePromoter::new(p.store.clone(), p.processor.clone(), Duration::from_secs(30));
    assert_eq!(promoter.tick().await.unwrap(), 0);

    // Two minutes later the promoter releases it through queued ->
    // processing -> sent.
    p.clock.advance(chrono::Duration::minutes(2));
    assert_eq!(promoter.tick().await.unwrap(), 1);

    let row = p.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, DeliveryState::Sent);
    assert_eq!(row.provider_message_id.unwrap().as_str(), "wamid.S");
}

// ─── S6: out-of-order callbacks ───

#[tokio::test]
async fn s6_read_before_delivered_stays_monotonic() {
    let p = pipeline();
    p.provider.push_ok("wamid.C").await;

    let response = build_router(p.state.clone())
        .oneshot(post_notification(&json!({
            "event_type": "order.placed",
            "recipient": { "phone_number": "+14155552671" },
            "message": { "text": "hello" }
        })))
        .await
        .unwrap();
    let id = NotificationId::parse(json_body(response).await["id"].as_str().unwrap()).unwrap();
    drain_queue(&p).await;

    // Provider reports read before delivered.
    for (status, timestamp) in [("read", 1_740_000_120), ("delivered", 1_740_000_060)] {
        let callback = json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "statuses": [{
                            "id": "wamid.C",
                            "status": status,
                            "timestamp": timestamp.to_string()
                        }]
                    }
                }]
            }]
        });
        let request = Request::builder()
            .method("POST")
            .uri("/v1/webhooks/provider")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&callback).unwrap()))
            .unwrap();
        let response = build_router(p.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let row = p.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.state, DeliveryState::Read, "state never moves backward");
    let delivered_at = row.delivered_at.unwrap();
    let read_at = row.read_at.unwrap();
    assert_eq!(delivered_at.timestamp(), 1_740_000_060);
    assert_eq!(read_at.timestamp(), 1_740_000_120);
    assert!(delivered_at <= read_at);
}

// ─── Worker pool end to end ───

#[tokio::test]
async fn worker_pool_drains_ingested_notifications() {
    let p = pipeline();

    let mut ids = Vec::new();
    for i in 0..3 {
        let response = build_router(p.state.clone())
            .oneshot(post_notification(&json!({
                "event_type": "order.placed",
                // Distinct recipients keep the rate limiter out of the way.
                "recipient": { "phone_number": format!("+1415555267{i}") },
                "message": { "text": "hello" }
            })))
            .await
            .unwrap();
        ids.push(
            NotificationId::parse(json_body(response).await["id"].as_str().unwrap()).unwrap(),
        );
    }

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(
        p.queue.clone(),
        p.processor.clone(),
        WorkerPoolConfig {
            concurrency: 4,
            receive_wait: Duration::from_millis(50),
            visibility: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        },
    );
    let handle = tokio::spawn(pool.run(shutdown.clone()));

    for _ in 0..100 {
        let mut all_sent = true;
        for id in &ids {
            let row = p.store.find_by_id(*id).await.unwrap().unwrap();
            all_sent &= row.state == DeliveryState::Sent;
        }
        if all_sent {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for id in &ids {
        let row = p.store.find_by_id(*id).await.unwrap().unwrap();
        assert_eq!(row.state, DeliveryState::Sent);
    }
    assert_eq!(p.provider.calls(), 3);
    assert_eq!(p.queue.depth().await, 0);

    shutdown.cancel();
    handle.await.unwrap();
}

// ─── Idempotency across the wire ───

#[tokio::test]
async fn replayed_idempotency_key_yields_one_terminal_notification() {
    let p = pipeline();
    p.provider.push_ok("wamid.I").await;

    let body = json!({
        "event_type": "order.placed",
        "recipient": { "phone_number": "+14155552671" },
        "message": { "text": "hello" }
    });

    let mut ids = Vec::new();
    for _ in 0..3 {
        let mut request = post_notification(&body);
        request
            .headers_mut()
            .insert("idempotency-key", "replay-1".parse().unwrap());
        let response = build_router(p.state.clone()).oneshot(request).await.unwrap();
        ids.push(json_body(response).await["id"].as_str().unwrap().to_string());
    }
    assert!(ids.windows(2).all(|w| w[0] == w[1]));

    drain_queue(&p).await;
    assert_eq!(p.provider.calls(), 1, "exactly one terminal send");
}

//! notify-relay - Main entry point.
//!
//! This binary hosts the whole dispatch pipeline in one tokio runtime: the
//! ingestion HTTP server, the worker pool, the retry scheduler, the
//! schedule promoter, the rate-limit janitor, and the inbound callback
//! handler.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notify_relay::callback::CallbackHandler;
use notify_relay::clock::SystemClock;
use notify_relay::config::Config;
use notify_relay::ingest::{IngestionConfig, IngestionService};
use notify_relay::processor::{BackoffConfig, Processor, ProcessorConfig, backoff};
use notify_relay::provider::WhatsAppClient;
use notify_relay::queue::InMemoryQueue;
use notify_relay::server::{AppState, build_router};
use notify_relay::store::{
    MemoryNotificationStore, MemoryRateLimitStore, NotificationStore,
};
use notify_relay::sweeper::{RateLimitJanitor, RetryScheduler, SchedulePromoter};
use notify_relay::worker::{WorkerPool, WorkerPoolConfig};

/// Prune cadence for the rate-limit janitor.
const JANITOR_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notify_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        listen = %config.listen_addr,
        concurrency = config.worker_concurrency,
        "starting notify-relay"
    );

    // Shared infrastructure. The stores and queue are in-process; SQL and
    // SQS-class implementations plug into the same traits.
    let clock = Arc::new(SystemClock);
    let store: Arc<dyn NotificationStore> =
        Arc::new(MemoryNotificationStore::new(clock.clone()));
    let rate_limits = Arc::new(MemoryRateLimitStore::new(clock.clone()));
    let queue = Arc::new(InMemoryQueue::default());

    let provider = match WhatsAppClient::new(&config.provider) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!(error = %e, "failed to build provider client");
            std::process::exit(1);
        }
    };

    let processor = Arc::new(Processor::new(
        store.clone(),
        rate_limits.clone(),
        provider,
        clock.clone(),
        ProcessorConfig {
            backoff: BackoffConfig::new(config.retry_base_delay, backoff::MAX_RETRY_DELAY),
            recipient_limit_per_hour: config.recipient_limit_per_hour,
        },
    ));

    let ingestion = IngestionService::new(
        store.clone(),
        rate_limits.clone(),
        queue.clone(),
        clock.clone(),
        IngestionConfig {
            recipient_limit_per_hour: config.recipient_limit_per_hour,
            default_max_attempts: config.max_attempts,
        },
    );
    let callbacks = CallbackHandler::new(store.clone(), clock.clone());

    // Startup reconciliation: queued rows that never made it onto the
    // queue (crash between persist and publish) become due retries.
    match store.reconcile_startup().await {
        Ok(0) => {}
        Ok(stamped) => tracing::info!(stamped, "reconciled orphaned queued notifications"),
        Err(e) => tracing::error!(error = %e, "startup reconciliation failed"),
    }

    let shutdown = CancellationToken::new();

    // Background tasks.
    let pool = WorkerPool::new(
        queue.clone(),
        processor.clone(),
        WorkerPoolConfig {
            concurrency: config.worker_concurrency,
            receive_wait: Duration::from_secs(20),
            visibility: config.visibility_timeout,
            shutdown_grace: config.shutdown_grace,
        },
    );
    let pool_handle = tokio::spawn(pool.run(shutdown.clone()));

    let retries = RetryScheduler::new(
        store.clone(),
        processor.clone(),
        config.retry_sweep_interval,
    );
    let retry_handle = tokio::spawn(retries.run(shutdown.clone()));

    let promoter = SchedulePromoter::new(
        store.clone(),
        processor.clone(),
        config.scheduled_sweep_interval,
    );
    let promoter_handle = tokio::spawn(promoter.run(shutdown.clone()));

    let janitor = RateLimitJanitor::new(
        rate_limits.clone(),
        clock.clone(),
        JANITOR_INTERVAL,
        chrono::Duration::days(config.rate_limit_retention_days),
    );
    let janitor_handle = tokio::spawn(janitor.run(shutdown.clone()));

    // HTTP server.
    let app_state = AppState::new(
        ingestion,
        callbacks,
        store,
        queue,
        clock,
        config.api_keys.clone(),
        config.webhook_verify_token.clone(),
        config.webhook_app_secret.clone(),
    );
    let app = build_router(app_state);

    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %config.listen_addr, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!("listening on {}", config.listen_addr);

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_shutdown.cancelled().await;
        });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "server failed");
        }
    });

    // Run until SIGINT, then drain everything.
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    for (name, handle) in [
        ("http server", server_handle),
        ("worker pool", pool_handle),
        ("retry scheduler", retry_handle),
        ("schedule promoter", promoter_handle),
        ("rate-limit janitor", janitor_handle),
    ] {
        if let Err(e) = handle.await {
            tracing::warn!(task = name, error = %e, "background task panicked");
        }
    }
    tracing::info!("notify-relay stopped");
}

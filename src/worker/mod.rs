//! The worker pool: a cooperative consumer of the work queue.
//!
//! The pool long-polls the queue with `max_count` bounded by the free
//! concurrency slots and spawns one task per received item. Each task runs
//! the processor and acknowledges the message when the processor reaches a
//! handled outcome; internal errors leave the message unacked so the queue
//! redelivers it after the visibility timeout and eventually dead-letters it.
//!
//! # Slow handlers
//!
//! A task that is still processing when 70% of the visibility timeout has
//! elapsed extends the message's visibility, and keeps extending it on the
//! same cadence. This stops a slow provider call from causing a concurrent
//! redelivery.
//!
//! # Shutdown
//!
//! On cancellation the pool stops receiving, waits up to the grace period
//! for in-flight tasks, then aborts the rest. Unacked items redeliver.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::processor::Processor;
use crate::queue::{ReceivedItem, WorkQueue};

/// Fraction of the visibility timeout after which a still-running handler
/// extends visibility.
const HEARTBEAT_FRACTION: f64 = 0.7;

/// Worker pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent in-flight items (also the receive batch bound).
    pub concurrency: usize,
    /// Long-poll duration for an empty queue.
    pub receive_wait: Duration,
    /// Visibility timeout requested on receive.
    pub visibility: Duration,
    /// How long shutdown waits for in-flight items.
    pub shutdown_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            concurrency: 10,
            receive_wait: Duration::from_secs(20),
            visibility: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Concurrent consumer that drives the processor from the queue.
pub struct WorkerPool {
    queue: Arc<dyn WorkQueue>,
    processor: Arc<Processor>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        processor: Arc<Processor>,
        config: WorkerPoolConfig,
    ) -> Self {
        WorkerPool {
            queue,
            processor,
            config,
        }
    }

    /// Runs the receive loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(concurrency = self.config.concurrency, "worker pool started");
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            // Block receives while every slot is busy.
            while tasks.len() >= self.config.concurrency {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tasks.join_next() => {}
                }
            }
            if shutdown.is_cancelled() {
                break;
            }

            let free_slots = self.config.concurrency - tasks.len();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.queue.receive(
                    free_slots,
                    self.config.receive_wait,
                    self.config.visibility,
                ) => match received {
                    Ok(items) => {
                        for item in items {
                            let queue = Arc::clone(&self.queue);
                            let processor = Arc::clone(&self.processor);
                            let visibility = self.config.visibility;
                            tasks.spawn(async move {
                                handle_item(queue, processor, item, visibility).await;
                            });
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "receive failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        // Graceful drain: let in-flight items finish, then cut them loose.
        info!(in_flight = tasks.len(), "worker pool draining");
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("shutdown grace expired, aborting in-flight items");
            tasks.abort_all();
        }
        info!("worker pool stopped");
    }
}

/// Processes one received item, heartbeating visibility while it runs.
async fn handle_item(
    queue: Arc<dyn WorkQueue>,
    processor: Arc<Processor>,
    item: ReceivedItem,
    visibility: Duration,
) {
    let heartbeat_after = visibility.mul_f64(HEARTBEAT_FRACTION);
    let process = processor.process_received(&item.body);
    tokio::pin!(process);

    let result = loop {
        tokio::select! {
            result = &mut process => break result,
            _ = tokio::time::sleep(heartbeat_after) => {
                debug!(message_id = %item.message_id, "extending visibility for slow handler");
                if let Err(e) = queue.extend_visibility(&item.receipt, visibility).await {
                    warn!(message_id = %item.message_id, error = %e, "visibility extension failed");
                }
            }
        }
    };

    match result {
        Ok(outcome) => {
            debug!(message_id = %item.message_id, ?outcome, "item handled");
            if let Err(e) = queue.acknowledge(&item.receipt).await {
                warn!(message_id = %item.message_id, error = %e, "acknowledge failed");
            }
        }
        Err(e) => {
            // Internal failure: leave unacked so visibility expiry
            // redelivers, and the queue dead-letters after the cap.
            error!(message_id = %item.message_id, error = %e, "processing failed, not acknowledging");
        }
    }
}

//! Queue consumer and worker pool.
//!
//! Claims messages while a worker slot is free, resolves the device token and
//! runs the delivery pipeline on a spawned task. Each task settles its own
//! message; a task that panics is settled here by dead-lettering its message.
//!
//! On shutdown, tasks still running after the drain timeout are aborted. A
//! task that had already decided its settlement gets that settlement applied
//! again; any other aborted task is requeued. A task aborted while its gateway
//! call is in flight may therefore be delivered twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::types::QueueMessage;
use herald_engine::{DeliveryPipeline, PipelineError};

use crate::owner::DeviceDirectory;
use crate::queue::{ClaimedMessage, MessageQueue};

const WORKER_PANICKED: &str = "delivery task panicked";

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub worker_pool_size: usize,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&AppConfig> for ConsumerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            worker_pool_size: config.worker_pool_size.max(1),
            poll_interval: Duration::from_millis(config.queue_poll_interval_ms),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        }
    }
}

/// What to do with a claimed message once its task is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    DeadLetter(String),
}

/// A running task's message and the settlement it committed to, if any.
struct InFlight {
    message: ClaimedMessage,
    committed: Arc<Mutex<Option<Settlement>>>,
}

pub struct Consumer {
    queue: Arc<dyn MessageQueue>,
    directory: Arc<dyn DeviceDirectory>,
    pipeline: Arc<DeliveryPipeline>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        directory: Arc<dyn DeviceDirectory>,
        pipeline: Arc<DeliveryPipeline>,
        config: ConsumerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            directory,
            pipeline,
            config,
            shutdown,
        }
    }

    /// Consume until the shutdown token fires, then drain in-flight work.
    pub async fn run(self) {
        let slots = Arc::new(Semaphore::new(self.config.worker_pool_size));
        let mut workers = JoinSet::new();
        let mut in_flight: HashMap<Id, InFlight> = HashMap::new();

        tracing::info!(
            workers = self.config.worker_pool_size,
            "Consumer started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(joined) = workers.join_next_with_id(), if !workers.is_empty() => {
                    self.reap(joined, &mut in_flight).await;
                }

                slot = slots.clone().acquire_owned() => {
                    let Ok(slot) = slot else { break };

                    match self.queue.claim().await {
                        Ok(Some(message)) => {
                            let queue = self.queue.clone();
                            let directory = self.directory.clone();
                            let pipeline = self.pipeline.clone();
                            let poll_interval = self.config.poll_interval;
                            let task_message = message.clone();
                            let committed = Arc::new(Mutex::new(None));
                            let task_committed = committed.clone();

                            let handle = workers.spawn(async move {
                                let _slot = slot;
                                let settlement = handle_message(
                                    directory.as_ref(),
                                    pipeline.as_ref(),
                                    poll_interval,
                                    &task_message,
                                )
                                .await;
                                *task_committed.lock() = Some(settlement.clone());
                                settle(queue.as_ref(), &task_message, settlement).await;
                            });
                            in_flight.insert(handle.id(), InFlight { message, committed });
                        }
                        Ok(None) => {
                            drop(slot);
                            self.idle().await;
                        }
                        Err(e) => {
                            drop(slot);
                            tracing::error!(error = %e, "Failed to claim message");
                            self.idle().await;
                        }
                    }
                }
            }
        }

        self.drain(workers, in_flight).await;
        tracing::info!("Consumer stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn reap(
        &self,
        joined: Result<(Id, ()), JoinError>,
        in_flight: &mut HashMap<Id, InFlight>,
    ) {
        match joined {
            Ok((id, ())) => {
                in_flight.remove(&id);
            }
            Err(e) => {
                let Some(InFlight { message, committed }) = in_flight.remove(&e.id()) else {
                    return;
                };
                let committed = committed.lock().take();
                let settlement = if e.is_panic() {
                    tracing::error!(message_id = %message.id, "Delivery task panicked");
                    Settlement::DeadLetter(WORKER_PANICKED.to_string())
                } else if let Some(settlement) = committed {
                    tracing::warn!(
                        message_id = %message.id,
                        settlement = ?settlement,
                        "Task aborted while settling, applying its settlement again"
                    );
                    settlement
                } else {
                    Settlement::Requeue
                };
                settle(self.queue.as_ref(), &message, settlement).await;
            }
        }
    }

    async fn drain(&self, mut workers: JoinSet<()>, mut in_flight: HashMap<Id, InFlight>) {
        if workers.is_empty() {
            return;
        }
        tracing::info!(in_flight = workers.len(), "Draining in-flight deliveries");

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            match tokio::time::timeout_at(deadline, workers.join_next_with_id()).await {
                Ok(Some(joined)) => self.reap(joined, &mut in_flight).await,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        tracing::warn!(
            remaining = workers.len(),
            "Shutdown timeout elapsed, aborting remaining deliveries"
        );
        workers.abort_all();
        while let Some(joined) = workers.join_next_with_id().await {
            self.reap(joined, &mut in_flight).await;
        }
    }
}

/// Decode, resolve and deliver one claimed message.
pub async fn handle_message(
    directory: &dyn DeviceDirectory,
    pipeline: &DeliveryPipeline,
    retry_pause: Duration,
    message: &ClaimedMessage,
) -> Settlement {
    let parsed = match QueueMessage::from_slice(message.payload.as_bytes()) {
        Ok(parsed) => parsed,
        Err(e) => {
            // A message carrying a request id is answered, not discarded.
            if let Some(request_id) = salvage_request_id(&message.payload) {
                pipeline.reject(&request_id, &e);
                return Settlement::Ack;
            }
            tracing::warn!(message_id = %message.id, error = %e, "Discarding malformed payload");
            return Settlement::DeadLetter(format!("malformed payload: {}", e));
        }
    };

    let device_token = match directory.resolve(&parsed.user_id).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(
                request_id = %parsed.request_id,
                error = %e,
                "Device lookup failed, returning message to queue"
            );
            tokio::time::sleep(retry_pause).await;
            return Settlement::Requeue;
        }
    };

    let request = parsed.into_request(device_token);
    match pipeline.deliver(&request).await {
        Ok(report) => {
            tracing::debug!(
                request_id = %report.request_id,
                status = %report.status,
                "Message settled"
            );
            Settlement::Ack
        }
        Err(PipelineError::ShuttingDown { request_id, attempt }) => {
            tracing::info!(%request_id, attempt, "Delivery interrupted, requeueing");
            Settlement::Requeue
        }
    }
}

/// The `request_id` of a JSON object that failed typed decoding.
fn salvage_request_id(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value
        .get("request_id")?
        .as_str()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

async fn settle(queue: &dyn MessageQueue, message: &ClaimedMessage, settlement: Settlement) {
    let result = match &settlement {
        Settlement::Ack => queue.ack(message).await,
        Settlement::Requeue => queue.requeue(message).await,
        Settlement::DeadLetter(reason) => queue.dead_letter(message, reason).await,
    };

    // The message stays in the processing set and is recovered on restart.
    if let Err(e) = result {
        tracing::error!(
            message_id = %message.id,
            settlement = ?settlement,
            error = %e,
            "Failed to settle message"
        );
    }
}

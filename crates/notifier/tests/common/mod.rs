//! Shared fakes for the notifier integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;
use herald_common::types::{NotificationContent, StatusReport, TokenInvalidation};
use herald_engine::{
    BreakerConfig, CircuitBreaker, DeliveryOutcome, DeliveryPipeline, GatewayClient, RetryPolicy,
    StatusReporter, StatusSink, TripPolicy,
};
use herald_notifier::consumer::{Consumer, ConsumerConfig};
use herald_notifier::owner::DeviceDirectory;
use herald_notifier::queue::{ClaimedMessage, MessageQueue};

/// Device token that makes [`FakeGateway`] panic.
pub const PANIC_TOKEN: &str = "boom";

// ============================================================
// Queue
// ============================================================

pub struct MemoryQueue {
    ready: Mutex<VecDeque<ClaimedMessage>>,
    pub acked: Mutex<Vec<String>>,
    pub requeued: Mutex<Vec<String>>,
    pub dead: Mutex<Vec<(String, String)>>,
    healthy: AtomicBool,
    slow_acks: AtomicUsize,
    acks_started: AtomicUsize,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: Mutex::new(VecDeque::new()),
            acked: Mutex::new(Vec::new()),
            requeued: Mutex::new(Vec::new()),
            dead: Mutex::new(Vec::new()),
            healthy: AtomicBool::new(true),
            slow_acks: AtomicUsize::new(0),
            acks_started: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, id: &str, payload: impl Into<String>) {
        self.ready
            .lock()
            .push_back(ClaimedMessage::detached(id, payload));
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make the next `count` acks hang long enough to outlast any drain.
    pub fn stall_acks(&self, count: usize) {
        self.slow_acks.store(count, Ordering::SeqCst);
    }

    pub fn acks_started(&self) -> usize {
        self.acks_started.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().clone()
    }

    pub fn requeued(&self) -> Vec<String> {
        self.requeued.lock().clone()
    }

    pub fn dead(&self) -> Vec<(String, String)> {
        self.dead.lock().clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn claim(&self) -> Result<Option<ClaimedMessage>, AppError> {
        Ok(self.ready.lock().pop_front())
    }

    async fn ack(&self, message: &ClaimedMessage) -> Result<(), AppError> {
        self.acks_started.fetch_add(1, Ordering::SeqCst);
        let stalled = self
            .slow_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if stalled {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.acked.lock().push(message.id.clone());
        Ok(())
    }

    async fn requeue(&self, message: &ClaimedMessage) -> Result<(), AppError> {
        self.requeued.lock().push(message.id.clone());
        self.ready.lock().push_back(message.clone());
        Ok(())
    }

    async fn dead_letter(&self, message: &ClaimedMessage, reason: &str) -> Result<(), AppError> {
        self.dead
            .lock()
            .push((message.id.clone(), reason.to_string()));
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

// ============================================================
// Directory, gateway, sink
// ============================================================

#[derive(Default)]
pub struct FakeDirectory {
    tokens: Mutex<HashMap<String, String>>,
    unreachable: AtomicBool,
}

impl FakeDirectory {
    pub fn with_user(user_id: &str, token: &str) -> Arc<Self> {
        let directory = Self::default();
        directory
            .tokens
            .lock()
            .insert(user_id.to_string(), token.to_string());
        Arc::new(directory)
    }

    pub fn unreachable() -> Arc<Self> {
        let directory = Self::default();
        directory.unreachable.store(true, Ordering::SeqCst);
        Arc::new(directory)
    }
}

#[async_trait]
impl DeviceDirectory for FakeDirectory {
    async fn resolve(&self, user_id: &str) -> Result<Option<String>, AppError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AppError::Internal("directory unreachable".to_string()));
        }
        Ok(self.tokens.lock().get(user_id).cloned())
    }
}

/// Answers with a fixed outcome per token, `Delivered` for unknown tokens.
#[derive(Default)]
pub struct FakeGateway {
    outcomes: Mutex<HashMap<String, DeliveryOutcome>>,
    calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answering(token: &str, outcome: DeliveryOutcome) -> Arc<Self> {
        let gateway = Self::default();
        gateway.outcomes.lock().insert(token.to_string(), outcome);
        Arc::new(gateway)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayClient for FakeGateway {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn send(&self, device_token: &str, _content: &NotificationContent) -> DeliveryOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if device_token == PANIC_TOKEN {
            panic!("gateway exploded");
        }
        self.outcomes
            .lock()
            .get(device_token)
            .cloned()
            .unwrap_or(DeliveryOutcome::Delivered)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<StatusReport>>,
    pub invalidations: Mutex<Vec<TokenInvalidation>>,
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn send_status(&self, report: &StatusReport) -> Result<(), AppError> {
        self.reports.lock().push(report.clone());
        Ok(())
    }

    async fn invalidate_token(&self, invalidation: &TokenInvalidation) -> Result<(), AppError> {
        self.invalidations.lock().push(invalidation.clone());
        Ok(())
    }
}

// ============================================================
// Harness
// ============================================================

pub fn push_payload(request_id: &str, user_id: &str) -> String {
    json!({
        "notification_type": "push",
        "user_id": user_id,
        "template_code": "welcome",
        "variables": {"title": "Hello", "body": "World"},
        "request_id": request_id,
        "priority": 1
    })
    .to_string()
}

pub fn quick_retries(max_attempts: u32, base_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(base_ms),
        multiplier: 2.0,
        max_delay: None,
        jitter: 0.0,
    }
}

pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub directory: Arc<FakeDirectory>,
    pub gateway: Arc<FakeGateway>,
    pub sink: Arc<RecordingSink>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub shutdown: CancellationToken,
    reporter_task: JoinHandle<()>,
}

impl Harness {
    pub fn new(
        queue: Arc<MemoryQueue>,
        directory: Arc<FakeDirectory>,
        gateway: Arc<FakeGateway>,
        policy: RetryPolicy,
    ) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let (reporter, reporter_task) = StatusReporter::spawn(sink.clone(), 64);
        let shutdown = CancellationToken::new();
        let breaker = Arc::new(CircuitBreaker::new(
            "fake",
            BreakerConfig {
                trip: TripPolicy::ConsecutiveFailures { threshold: 1000 },
                ..BreakerConfig::default()
            },
        ));
        let pipeline = Arc::new(DeliveryPipeline::new(
            gateway.clone(),
            breaker,
            policy,
            reporter,
            shutdown.clone(),
        ));

        Self {
            queue,
            directory,
            gateway,
            sink,
            pipeline,
            shutdown,
            reporter_task,
        }
    }

    pub fn spawn_consumer(&self, workers: usize) -> JoinHandle<()> {
        self.spawn_consumer_with(ConsumerConfig {
            worker_pool_size: workers,
            poll_interval: Duration::from_millis(5),
            shutdown_timeout: Duration::from_secs(2),
        })
    }

    pub fn spawn_consumer_with(&self, config: ConsumerConfig) -> JoinHandle<()> {
        let consumer = Consumer::new(
            self.queue.clone(),
            self.directory.clone(),
            self.pipeline.clone(),
            config,
            self.shutdown.clone(),
        );
        tokio::spawn(consumer.run())
    }

    /// Stop the consumer and wait for every report to reach the sink.
    pub async fn stop(self, consumer: JoinHandle<()>) -> (Arc<MemoryQueue>, Arc<RecordingSink>) {
        self.shutdown.cancel();
        consumer.await.unwrap();
        drop(self.pipeline);
        self.reporter_task.await.unwrap();
        (self.queue, self.sink)
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

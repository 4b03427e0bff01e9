//! Status reporter: non-blocking dispatch of terminal reports.
//!
//! The pipeline hands reports to a [`ReporterHandle`], which pushes them onto a
//! bounded channel drained by a background task. Sink calls that fail with a
//! retryable error are retried locally with backoff; every final failure is
//! logged. Enqueueing never waits:
//! when the channel is full a detached task waits for capacity instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use herald_common::error::AppError;
use herald_common::types::{StatusReport, TokenInvalidation};

use crate::retry::{RetryContext, RetryDecision, RetryPolicy};

/// Maximum sink calls in flight at once.
const MAX_CONCURRENT_SINK_CALLS: usize = 16;

/// Owning service endpoints the reporter talks to.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn send_status(&self, report: &StatusReport) -> Result<(), AppError>;

    async fn invalidate_token(&self, invalidation: &TokenInvalidation) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
enum ReporterCommand {
    Status(StatusReport),
    InvalidateToken(TokenInvalidation),
}

impl ReporterCommand {
    fn describe(&self) -> String {
        match self {
            ReporterCommand::Status(report) => format!("status report for {}", report.request_id),
            ReporterCommand::InvalidateToken(inv) => {
                format!("token invalidation for user {}", inv.user_id)
            }
        }
    }
}

/// Cheap, cloneable entry point used by the pipeline.
#[derive(Clone)]
pub struct ReporterHandle {
    tx: mpsc::Sender<ReporterCommand>,
}

impl ReporterHandle {
    /// Queue a terminal status report.
    pub fn report(&self, report: StatusReport) {
        self.dispatch(ReporterCommand::Status(report));
    }

    /// Queue a request to clear the user's stored device token.
    pub fn invalidate_token(&self, user_id: &str) {
        self.dispatch(ReporterCommand::InvalidateToken(TokenInvalidation::for_user(
            user_id,
        )));
    }

    fn dispatch(&self, command: ReporterCommand) {
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                tracing::debug!("Reporter queue full, deferring enqueue");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = tx.send(command).await {
                        tracing::error!(
                            command = %e.0.describe(),
                            "Reporter stopped before deferred command could be queued"
                        );
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                tracing::error!(
                    command = %command.describe(),
                    "Reporter stopped, command dropped"
                );
            }
        }
    }
}

/// Background task owning the sink.
pub struct StatusReporter;

impl StatusReporter {
    /// Retry policy for sink calls: 3 attempts, 200ms doubling.
    pub fn default_sink_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Some(Duration::from_secs(5)),
            jitter: 0.0,
        }
    }

    pub fn spawn(sink: Arc<dyn StatusSink>, capacity: usize) -> (ReporterHandle, JoinHandle<()>) {
        Self::spawn_with_policy(sink, capacity, Self::default_sink_policy())
    }

    /// Start the reporter. The task exits once every handle is dropped and
    /// the queue has drained.
    pub fn spawn_with_policy(
        sink: Arc<dyn StatusSink>,
        capacity: usize,
        policy: RetryPolicy,
    ) -> (ReporterHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(Self::run(sink, rx, policy));
        (ReporterHandle { tx }, task)
    }

    async fn run(
        sink: Arc<dyn StatusSink>,
        mut rx: mpsc::Receiver<ReporterCommand>,
        policy: RetryPolicy,
    ) {
        let limit = Arc::new(Semaphore::new(MAX_CONCURRENT_SINK_CALLS));
        let mut in_flight = JoinSet::new();

        while let Some(command) = rx.recv().await {
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            let sink = sink.clone();
            let policy = policy.clone();
            in_flight.spawn(async move {
                Self::deliver(sink.as_ref(), &command, &policy).await;
                drop(permit);
            });

            // Reap finished calls so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        tracing::info!("Status reporter drained");
    }

    async fn deliver(sink: &dyn StatusSink, command: &ReporterCommand, policy: &RetryPolicy) {
        let mut ctx = RetryContext::new(command.describe());

        loop {
            let result = match command {
                ReporterCommand::Status(report) => sink.send_status(report).await,
                ReporterCommand::InvalidateToken(inv) => sink.invalidate_token(inv).await,
            };

            let error = match result {
                Ok(()) => {
                    tracing::debug!(command = %ctx.request_id, "Reporter call succeeded");
                    return;
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                tracing::error!(
                    command = %ctx.request_id,
                    attempts = ctx.attempt_number,
                    error = %error,
                    "Reporter call refused by owning service"
                );
                return;
            }

            match policy.decide(&ctx) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        command = %ctx.request_id,
                        attempt = ctx.attempt_number,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Reporter call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    ctx.advance(delay);
                }
                RetryDecision::Exhausted => {
                    tracing::error!(
                        command = %ctx.request_id,
                        attempts = ctx.attempt_number,
                        error = %error,
                        "Reporter call failed permanently"
                    );
                    return;
                }
            }
        }
    }
}

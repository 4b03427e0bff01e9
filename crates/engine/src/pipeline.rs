//! Delivery pipeline: drives one request from dequeue to terminal status.
//!
//! Order of checks per attempt: shutdown, then circuit breaker, then gateway.
//! A short-circuited call is a transient failure and consumes an attempt, so
//! the retry policy cannot tell it apart from a real gateway failure.
//!
//! Every terminal path hands exactly one [`StatusReport`] to the reporter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use herald_common::types::{NotificationRequest, StatusReport};

use crate::breaker::CircuitBreaker;
use crate::gateway::{DeliveryOutcome, GatewayClient};
use crate::reporter::ReporterHandle;
use crate::retry::{RetryContext, RetryDecision, RetryPolicy};

pub const NO_DEVICE_TOKEN: &str = "no device token";
pub const MAX_RETRY_REACHED: &str = "maximum retry reached";
const CIRCUIT_OPEN: &str = "circuit open";

/// Non-terminal exits of [`DeliveryPipeline::deliver`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Shutdown was requested before the next attempt could start. No status
    /// has been reported; the message should go back on the queue.
    #[error("shutdown requested before attempt {attempt} of request {request_id}")]
    ShuttingDown { request_id: String, attempt: u32 },
}

/// Process-wide delivery counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    delivered: AtomicU64,
    rejected_input: AtomicU64,
    permanently_rejected: AtomicU64,
    exhausted: AtomicU64,
    retries: AtomicU64,
    short_circuited: AtomicU64,
    interrupted: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub rejected_input: u64,
    pub permanently_rejected: u64,
    pub exhausted: u64,
    pub retries: u64,
    pub short_circuited: u64,
    pub interrupted: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            rejected_input: self.rejected_input.load(Ordering::Relaxed),
            permanently_rejected: self.permanently_rejected.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Orchestrates gateway calls through the breaker and retry policy.
pub struct DeliveryPipeline {
    gateway: Arc<dyn GatewayClient>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    reporter: ReporterHandle,
    shutdown: CancellationToken,
    stats: Arc<PipelineStats>,
}

impl DeliveryPipeline {
    pub fn new(
        gateway: Arc<dyn GatewayClient>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
        reporter: ReporterHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            breaker,
            policy,
            reporter,
            shutdown,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Terminal `failed` status for a request that cannot be delivered as
    /// given. No gateway call is made.
    pub fn reject(&self, request_id: &str, error: &dyn std::fmt::Display) -> StatusReport {
        tracing::warn!(request_id, error = %error, "Rejecting malformed request");
        PipelineStats::bump(&self.stats.rejected_input);
        self.finish(StatusReport::failed(
            request_id,
            format!("invalid request: {}", error),
        ))
    }

    /// Deliver one request and return its terminal status.
    ///
    /// The returned report has already been handed to the reporter.
    pub async fn deliver(
        &self,
        request: &NotificationRequest,
    ) -> Result<StatusReport, PipelineError> {
        if let Err(e) = request.validate() {
            return Ok(self.reject(&request.request_id, &e));
        }

        let Some(device_token) = request.device_token() else {
            tracing::info!(request_id = %request.request_id, "No device token, skipping gateway");
            PipelineStats::bump(&self.stats.rejected_input);
            return Ok(self.finish(StatusReport::failed(&request.request_id, NO_DEVICE_TOKEN)));
        };

        let content = request.content();
        let mut ctx = RetryContext::new(&request.request_id);

        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!(
                    request_id = %ctx.request_id,
                    attempt = ctx.attempt_number,
                    "Shutdown requested, abandoning before next attempt"
                );
                PipelineStats::bump(&self.stats.interrupted);
                return Err(PipelineError::ShuttingDown {
                    request_id: ctx.request_id,
                    attempt: ctx.attempt_number,
                });
            }

            let outcome = match self.breaker.try_acquire() {
                Ok(permit) => {
                    let outcome = self.gateway.send(device_token, &content).await;
                    permit.record(&outcome);
                    outcome
                }
                Err(_) => {
                    PipelineStats::bump(&self.stats.short_circuited);
                    DeliveryOutcome::transient(CIRCUIT_OPEN)
                }
            };

            let reason = match outcome {
                DeliveryOutcome::Delivered => {
                    tracing::info!(
                        request_id = %ctx.request_id,
                        attempts = ctx.attempt_number,
                        gateway = self.gateway.name(),
                        "Notification delivered"
                    );
                    PipelineStats::bump(&self.stats.delivered);
                    return Ok(self.finish(StatusReport::delivered(&ctx.request_id)));
                }
                DeliveryOutcome::PermanentRejection {
                    reason,
                    invalidate_token,
                } => {
                    PipelineStats::bump(&self.stats.permanently_rejected);
                    if invalidate_token {
                        tracing::info!(
                            request_id = %ctx.request_id,
                            user_id = %request.user_id,
                            reason = %reason,
                            "Device token rejected, requesting invalidation"
                        );
                        self.reporter.invalidate_token(&request.user_id);
                    } else {
                        tracing::info!(
                            request_id = %ctx.request_id,
                            reason = %reason,
                            "Message rejected by gateway"
                        );
                    }
                    return Ok(self.finish(StatusReport::failed(&ctx.request_id, reason)));
                }
                DeliveryOutcome::TransientFailure { reason } => reason,
                // Gateways never own the retry budget; treat it like any
                // other transient answer.
                DeliveryOutcome::Exhausted => "gateway reported exhaustion".to_string(),
            };

            match self.policy.decide(&ctx) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        attempt = ctx.attempt_number,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient failure, scheduling retry"
                    );
                    PipelineStats::bump(&self.stats.retries);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {}
                    }
                    ctx.advance(delay);
                }
                RetryDecision::Exhausted => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        attempts = ctx.attempt_number,
                        last_reason = %reason,
                        "Retries exhausted"
                    );
                    PipelineStats::bump(&self.stats.exhausted);
                    return Ok(self.finish(StatusReport::failed(&ctx.request_id, MAX_RETRY_REACHED)));
                }
            }
        }
    }

    fn finish(&self, report: StatusReport) -> StatusReport {
        self.reporter.report(report.clone());
        report
    }
}

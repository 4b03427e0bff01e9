//! Push delivery engine.
//!
//! - [`breaker`]: per-gateway circuit breaker
//! - [`retry`]: exponential backoff policy
//! - [`pipeline`]: the per-request delivery state machine
//! - [`reporter`]: non-blocking terminal status dispatch
//! - [`gateway`]: the push provider boundary

pub mod breaker;
pub mod gateway;
pub mod pipeline;
pub mod reporter;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, TripPolicy};
pub use gateway::{DeliveryOutcome, GatewayClient};
pub use pipeline::{DeliveryPipeline, PipelineError, PipelineStats, StatsSnapshot};
pub use reporter::{ReporterHandle, StatusReporter, StatusSink};
pub use retry::{RetryContext, RetryDecision, RetryPolicy};

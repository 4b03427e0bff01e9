//! Health check endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use herald_engine::{BreakerState, CircuitBreaker, PipelineStats};

use crate::queue::MessageQueue;

#[derive(Clone)]
pub struct HealthState {
    pub queue: Arc<dyn MessageQueue>,
    pub breaker: Arc<CircuitBreaker>,
    pub stats: Arc<PipelineStats>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
}

/// Degraded when Redis does not answer or the gateway breaker is open.
async fn health_check(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let redis = state.queue.ping().await;
    let breaker = state.breaker.state();
    let healthy = redis && !matches!(breaker, BreakerState::Open { .. });

    Json(json!({
        "success": healthy,
        "message": if healthy { "ok" } else { "degraded" },
        "service": "herald-notifier",
        "version": env!("CARGO_PKG_VERSION"),
        "meta": {
            "redis": redis,
            "breaker": breaker.label(),
            "breaker_opened": state.breaker.opened_count(),
            "breaker_rejected": state.breaker.rejected_count(),
        },
        "stats": state.stats.snapshot(),
    }))
}

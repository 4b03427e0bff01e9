//! Gateway client boundary.
//!
//! A gateway wraps one push provider. Provider-specific error codes are
//! classified into [`DeliveryOutcome`] inside the implementation; the
//! pipeline never sees raw provider errors.

use async_trait::async_trait;

use herald_common::types::NotificationContent;

/// Result of one delivery attempt, or of the whole attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Retryable failure: network, 5xx, deadline expiry, open circuit.
    TransientFailure { reason: String },
    /// The provider refused the request for good. `invalidate_token` is set
    /// only when the device token itself is dead (e.g. not registered).
    PermanentRejection {
        reason: String,
        invalidate_token: bool,
    },
    /// Retry budget used up. Only produced by the pipeline.
    Exhausted,
}

impl DeliveryOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        DeliveryOutcome::TransientFailure {
            reason: reason.into(),
        }
    }

    /// The device token is no longer valid and should be cleared.
    pub fn permanent(reason: impl Into<String>) -> Self {
        DeliveryOutcome::PermanentRejection {
            reason: reason.into(),
            invalidate_token: true,
        }
    }

    /// The message was refused but the token may still be good.
    pub fn rejected_payload(reason: impl Into<String>) -> Self {
        DeliveryOutcome::PermanentRejection {
            reason: reason.into(),
            invalidate_token: false,
        }
    }

    /// Whether the gateway itself misbehaved. Permanent rejections are a
    /// healthy gateway answering "no", so they count as breaker successes.
    pub fn is_gateway_failure(&self) -> bool {
        matches!(self, DeliveryOutcome::TransientFailure { .. })
    }
}

/// External push provider.
///
/// Implementations must carry their own call deadline and map its expiry to
/// [`DeliveryOutcome::TransientFailure`]. Errors that cannot be classified
/// must also default to a transient failure.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Short provider name used in logs and breaker identification.
    fn name(&self) -> &'static str;

    async fn send(&self, device_token: &str, content: &NotificationContent) -> DeliveryOutcome;
}

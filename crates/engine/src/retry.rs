//! Retry policy: exponential backoff for transient gateway failures.
//!
//! `delay(n) = base_delay * multiplier^(n-1)`, optionally capped and jittered.
//! The policy only decides; the pipeline owns the waiting.

use std::time::Duration;

use rand::Rng;

use herald_common::config::AppConfig;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total gateway calls allowed per request (>= 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Option<Duration>,
    /// Randomizes each delay by +/- this fraction (0.0 disables jitter)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 3.0,
            max_delay: None,
            jitter: 0.0,
        }
    }
}

impl From<&AppConfig> for RetryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            multiplier: config.retry_multiplier,
            max_delay: config.retry_max_delay_ms.map(Duration::from_millis),
            jitter: config.retry_jitter.clamp(0.0, 1.0),
        }
    }
}

/// Per-request retry bookkeeping. Lives for one attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    /// 1-based number of the attempt in progress
    pub attempt_number: u32,
    pub request_id: String,
    /// Delay chosen before the current attempt (zero for the first)
    pub next_delay: Duration,
}

impl RetryContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            attempt_number: 1,
            request_id: request_id.into(),
            next_delay: Duration::ZERO,
        }
    }

    /// Move to the next attempt after `delay`.
    pub fn advance(&mut self, delay: Duration) {
        self.attempt_number += 1;
        self.next_delay = delay;
    }
}

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted,
}

impl RetryPolicy {
    /// Decide after attempt `ctx.attempt_number` failed transiently.
    pub fn decide(&self, ctx: &RetryContext) -> RetryDecision {
        if ctx.attempt_number < self.max_attempts {
            RetryDecision::RetryAfter(self.delay_for(ctx.attempt_number))
        } else {
            RetryDecision::Exhausted
        }
    }

    /// Delay that follows attempt `n` (1-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_jitter(n, jitter)
    }

    /// Deterministic delay with an explicit jitter sample in `[-1.0, 1.0]`.
    pub fn delay_with_jitter(&self, n: u32, jitter_sample: f64) -> Duration {
        let exponent = n.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        if let Some(max) = self.max_delay {
            nanos = nanos.min(max.as_nanos() as f64);
        }
        if self.jitter > 0.0 {
            nanos *= 1.0 + self.jitter * jitter_sample.clamp(-1.0, 1.0);
        }
        if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            return Duration::MAX;
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: None,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_exponential_delays() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(10));
        assert_eq!(p.delay_for(2), Duration::from_millis(20));
        assert_eq!(p.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_decide_until_exhausted() {
        let p = policy();
        let mut ctx = RetryContext::new("req-1");
        assert_eq!(
            p.decide(&ctx),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        ctx.advance(Duration::from_millis(10));
        assert_eq!(
            p.decide(&ctx),
            RetryDecision::RetryAfter(Duration::from_millis(20))
        );
        ctx.advance(Duration::from_millis(20));
        assert_eq!(ctx.attempt_number, 3);
        assert_eq!(p.decide(&ctx), RetryDecision::Exhausted);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let p = RetryPolicy {
            max_attempts: 1,
            ..policy()
        };
        assert_eq!(p.decide(&RetryContext::new("r")), RetryDecision::Exhausted);
    }

    #[test]
    fn test_max_delay_caps() {
        let p = RetryPolicy {
            max_delay: Some(Duration::from_millis(25)),
            ..policy()
        };
        assert_eq!(p.delay_for(2), Duration::from_millis(20));
        assert_eq!(p.delay_for(3), Duration::from_millis(25));
        assert_eq!(p.delay_for(30), Duration::from_millis(25));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..policy()
        };
        assert_eq!(p.delay_with_jitter(1, -1.0), Duration::from_millis(5));
        assert_eq!(p.delay_with_jitter(1, 1.0), Duration::from_millis(15));
        for _ in 0..100 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(30));
        }
    }

    #[test]
    fn test_huge_attempt_does_not_panic() {
        let p = RetryPolicy {
            multiplier: 10.0,
            ..policy()
        };
        assert_eq!(p.delay_for(u32::MAX), Duration::MAX);
    }
}

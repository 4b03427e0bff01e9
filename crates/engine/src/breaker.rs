//! Circuit breaker guarding a single gateway target.
//!
//! One breaker lives for the whole process per gateway. Every attempt first
//! asks [`CircuitBreaker::try_acquire`] for a [`CallPermit`]; the permit must be
//! consumed with [`CallPermit::record`] once the gateway answers, so each call
//! result is reported exactly once.
//!
//! All transitions happen under one mutex, so concurrent failure reports
//! cannot lose updates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use herald_common::config::AppConfig;

use crate::gateway::DeliveryOutcome;

/// Upper bound on a single open period, whatever the configuration says.
const MAX_OPEN_DURATION: Duration = Duration::from_secs(30 * 24 * 3600);

/// Used only if even the capped deadline does not fit the clock.
const MIN_FALLBACK_OPEN: Duration = Duration::from_secs(1);

/// When a closed breaker should open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripPolicy {
    /// Open after this many consecutive failures inside the window.
    ConsecutiveFailures { threshold: u32 },
    /// Open when the failure ratio inside the window reaches `rate`, once at
    /// least `min_calls` results have been seen.
    FailureRate { rate: f64, min_calls: u32 },
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub trip: TripPolicy,
    /// Sliding window over which results are counted
    pub window: Duration,
    /// Time spent open before a probe is allowed
    pub cooldown: Duration,
    /// Growth factor applied to the cooldown when a probe fails (1.0 = fixed)
    pub cooldown_multiplier: f64,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            trip: TripPolicy::ConsecutiveFailures { threshold: 3 },
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(10),
            cooldown_multiplier: 1.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl From<&AppConfig> for BreakerConfig {
    fn from(config: &AppConfig) -> Self {
        let trip = match config.breaker_failure_rate {
            Some(rate) => TripPolicy::FailureRate {
                rate,
                min_calls: config.breaker_min_calls,
            },
            None => TripPolicy::ConsecutiveFailures {
                threshold: config.breaker_failure_threshold,
            },
        };
        Self {
            trip,
            window: Duration::from_secs(config.breaker_window_secs),
            cooldown: Duration::from_millis(config.breaker_cooldown_ms),
            cooldown_multiplier: config.breaker_cooldown_multiplier.max(1.0),
            max_cooldown: Duration::from_millis(config.breaker_max_cooldown_ms),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

impl BreakerState {
    pub fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortCircuit;

struct Inner {
    state: BreakerState,
    /// (when, was_failure) for results seen while closed
    results: VecDeque<(Instant, bool)>,
    probe_in_flight: bool,
    current_cooldown: Duration,
}

/// Process-wide breaker for one gateway target.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    opened_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                results: VecDeque::new(),
                probe_in_flight: false,
                current_cooldown: cooldown,
            }),
            opened_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, with an elapsed cooldown already reflected as half-open.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.promote_if_cooled(&mut inner, Instant::now());
        inner.state
    }

    /// Times the breaker has opened since start-up.
    pub fn opened_count(&self) -> u64 {
        self.opened_count.load(Ordering::Relaxed)
    }

    /// Calls short-circuited since start-up.
    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    /// Ask permission for one gateway call.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, ShortCircuit> {
        let mut inner = self.inner.lock();
        self.promote_if_cooled(&mut inner, Instant::now());

        match inner.state {
            BreakerState::Closed => Ok(CallPermit::new(self, false)),
            BreakerState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                tracing::debug!(breaker = %self.name, "Admitting half-open probe");
                Ok(CallPermit::new(self, true))
            }
            BreakerState::HalfOpen | BreakerState::Open { .. } => {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                Err(ShortCircuit)
            }
        }
    }

    /// Force the breaker closed and forget recorded history.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.results.clear();
        inner.probe_in_flight = false;
        inner.current_cooldown = self.config.cooldown;
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn promote_if_cooled(&self, inner: &mut Inner, now: Instant) {
        if let BreakerState::Open { until } = inner.state
            && now >= until
        {
            inner.state = BreakerState::HalfOpen;
            inner.probe_in_flight = false;
            tracing::info!(breaker = %self.name, "Circuit breaker half-open, probe allowed");
        }
    }

    fn record(&self, probe: bool, failure: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                if failure {
                    let grown = Duration::try_from_secs_f64(
                        inner.current_cooldown.as_secs_f64() * self.config.cooldown_multiplier,
                    )
                    .unwrap_or(Duration::MAX)
                    .min(self.config.max_cooldown);
                    inner.current_cooldown = grown;
                    self.open(&mut inner, now);
                    tracing::warn!(
                        breaker = %self.name,
                        cooldown_ms = grown.as_millis() as u64,
                        "Circuit breaker re-opened, probe failed"
                    );
                } else {
                    inner.state = BreakerState::Closed;
                    inner.results.clear();
                    inner.current_cooldown = self.config.cooldown;
                    tracing::info!(breaker = %self.name, "Circuit breaker closed, gateway recovered");
                }
            }
            BreakerState::Closed => {
                inner.results.push_back((now, failure));
                self.prune(&mut inner, now);
                if failure && self.should_trip(&inner) {
                    let failures = inner.results.iter().filter(|(_, f)| *f).count();
                    self.open(&mut inner, now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures,
                        "Circuit breaker opened, too many gateway failures"
                    );
                }
            }
            // Late results from calls admitted before the breaker moved on.
            BreakerState::HalfOpen | BreakerState::Open { .. } => {}
        }
    }

    /// Abandoned probe (permit dropped without a result): treat as failed.
    fn abandon(&self, probe: bool) {
        if probe {
            self.record(true, true);
        }
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        let cooldown = inner.current_cooldown.min(MAX_OPEN_DURATION);
        inner.state = BreakerState::Open {
            until: now.checked_add(cooldown).unwrap_or(now + MIN_FALLBACK_OPEN),
        };
        inner.results.clear();
        inner.probe_in_flight = false;
        self.opened_count.fetch_add(1, Ordering::Relaxed);
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some((at, _)) = inner.results.front() {
            if now.duration_since(*at) > self.config.window {
                inner.results.pop_front();
            } else {
                break;
            }
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        match self.config.trip {
            TripPolicy::ConsecutiveFailures { threshold } => {
                let streak = inner
                    .results
                    .iter()
                    .rev()
                    .take_while(|(_, failure)| *failure)
                    .count();
                streak >= threshold as usize
            }
            TripPolicy::FailureRate { rate, min_calls } => {
                let total = inner.results.len();
                if total < min_calls.max(1) as usize {
                    return false;
                }
                let failures = inner.results.iter().filter(|(_, f)| *f).count();
                failures as f64 / total as f64 >= rate
            }
        }
    }
}

/// Permission for exactly one gateway call.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    recorded: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            recorded: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Report the raw gateway result.
    pub fn record(mut self, outcome: &DeliveryOutcome) {
        self.recorded = true;
        self.breaker.record(self.probe, outcome.is_gateway_failure());
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.abandon(self.probe);
        }
    }
}

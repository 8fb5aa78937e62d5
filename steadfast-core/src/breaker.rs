//! Circuit Breaker — per-backend call gate
//!
//! ```text
//!            failure_count >= failure_threshold
//!   CLOSED ─────────────────────────────────────► OPEN
//!     ▲                                          │  ▲
//!     │ success_count >= success_threshold       │  │ any probe failure
//!     │                                          ▼  │
//!     └──────────────────────────────────── HALF_OPEN
//!                     recovery timeout elapsed (lazily, on the next call)
//! ```
//!
//! All state lives behind one `parking_lot::Mutex` per breaker. The lock
//! is held only to admit a call and to record its outcome, never across
//! the guarded operation itself.
//!
//! Outcomes are tagged with the state episode (generation) they were
//! admitted in; an outcome arriving after the breaker has moved on only
//! updates the counters in [`CircuitMetrics`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::BreakerConfig;
use crate::error::{Result, SteadfastError};
use crate::types::Backend;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow through.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// A bounded number of probe calls test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// One logged state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Previous state.
    pub from: CircuitState,
    /// New state.
    pub to: CircuitState,
    /// Why it happened.
    pub reason: String,
}

/// Counters owned by one breaker. Monotonic except via [`CircuitBreaker::reset`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitMetrics {
    /// Every invocation of `call`, admitted or rejected.
    pub total_calls: u64,
    /// Admitted calls whose operation succeeded.
    pub successful_calls: u64,
    /// Admitted calls whose operation failed.
    pub failed_calls: u64,
    /// Calls rejected without running the operation.
    pub rejected_calls: u64,
    /// OPEN → HALF_OPEN transitions.
    pub recovery_attempts: u64,
    /// Transitions ever logged, including ones evicted from `transitions`.
    pub total_transitions: u64,
    /// Most recent transitions, oldest first.
    pub transitions: Vec<StateTransition>,
}

/// Point-in-time view of a breaker for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Guarded backend.
    pub backend: Backend,
    /// Current state.
    pub state: CircuitState,
    /// Current failure count.
    pub failure_count: u32,
    /// Probe successes in the current HALF_OPEN episode.
    pub success_count: u32,
    /// Probes currently in flight.
    pub half_open_in_flight: u32,
    /// Time spent in the current state.
    pub time_in_state: Duration,
    /// Remaining wait before an OPEN breaker admits a probe.
    pub retry_after: Option<Duration>,
    /// Counters and transition log.
    pub metrics: CircuitMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Failed, but not the backend's fault: metrics only.
    Neutral,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    generation: u64,
    metrics: CircuitMetrics,
    transitions: VecDeque<StateTransition>,
}

/// Per-backend circuit breaker.
pub struct CircuitBreaker {
    backend: Backend,
    config: BreakerConfig,
    recovery_timeout: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("backend", &self.backend)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a CLOSED breaker for `backend`.
    ///
    /// # Errors
    /// Returns `SteadfastError::Config` if the thresholds are invalid.
    pub fn new(backend: Backend, config: BreakerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            backend,
            recovery_timeout: config.recovery_timeout(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_in_flight: 0,
                last_failure_time: None,
                last_state_change: now,
                generation: 0,
                metrics: CircuitMetrics::default(),
                transitions: VecDeque::new(),
            }),
        })
    }

    /// Breaker on the system clock with default thresholds.
    ///
    /// # Errors
    /// Never fails with default configuration; kept fallible for symmetry.
    pub fn with_defaults(backend: Backend) -> Result<Self> {
        Self::new(backend, BreakerConfig::default(), Arc::new(SystemClock))
    }

    /// Guarded backend.
    #[must_use]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Thresholds in effect.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejections return `CircuitOpen` / `HalfOpenSaturated` without calling
    /// `operation`. Errors for which
    /// [`counts_against_breaker`](SteadfastError::counts_against_breaker) is
    /// false are passed through without moving the state machine.
    ///
    /// # Errors
    /// The rejection, or whatever `operation` returned.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(e) if e.counts_against_breaker() => permit.fail(),
            Err(_) => permit.release(),
        }
        result
    }

    /// Admit one call, or reject it.
    ///
    /// The returned permit must be settled with its outcome; dropping it
    /// unsettled frees any recovery slot it holds (a panic counts as a
    /// failure, cancellation as neutral).
    ///
    /// # Errors
    /// `CircuitOpen` while the recovery timeout runs, `HalfOpenSaturated`
    /// when all probe slots are taken.
    pub fn acquire(&self) -> Result<CallPermit<'_>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_time
                .map_or(Duration::MAX, |t| now.saturating_duration_since(t));
            if elapsed < self.recovery_timeout {
                inner.metrics.rejected_calls += 1;
                let retry_after = self.recovery_timeout - elapsed;
                debug!(
                    backend = %self.backend,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit open, rejecting call"
                );
                return Err(SteadfastError::CircuitOpen {
                    backend: self.backend.to_string(),
                    retry_after,
                    failure_count: inner.failure_count,
                });
            }
            self.transition(&mut inner, CircuitState::HalfOpen, "recovery timeout expired", now);
            inner.metrics.recovery_attempts += 1;
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_in_flight >= self.config.half_open_max_calls {
                inner.metrics.rejected_calls += 1;
                debug!(
                    backend = %self.backend,
                    in_flight = inner.half_open_in_flight,
                    "Recovery probes saturated, rejecting call"
                );
                return Err(SteadfastError::HalfOpenSaturated {
                    backend: self.backend.to_string(),
                    in_flight: inner.half_open_in_flight,
                    max: self.config.half_open_max_calls,
                });
            }
            inner.half_open_in_flight += 1;
        }

        Ok(CallPermit {
            breaker: self,
            generation: inner.generation,
            settled: false,
        })
    }

    fn record(&self, generation: u64, outcome: Outcome) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match outcome {
            Outcome::Success => inner.metrics.successful_calls += 1,
            Outcome::Failure | Outcome::Neutral => inner.metrics.failed_calls += 1,
        }
        if generation != inner.generation {
            return;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                match outcome {
                    Outcome::Success => {
                        inner.success_count += 1;
                        if inner.success_count >= self.config.success_threshold {
                            self.transition(&mut inner, CircuitState::Closed, "service recovered", now);
                        }
                    }
                    Outcome::Failure => {
                        inner.last_failure_time = Some(now);
                        self.transition(&mut inner, CircuitState::Open, "recovery test failed", now);
                    }
                    Outcome::Neutral => {}
                }
            }
            CircuitState::Closed => match outcome {
                Outcome::Success => {
                    inner.failure_count = inner.failure_count.saturating_sub(1);
                }
                Outcome::Failure => {
                    inner.failure_count += 1;
                    inner.last_failure_time = Some(now);
                    if inner.failure_count >= self.config.failure_threshold {
                        warn!(
                            backend = %self.backend,
                            failures = inner.failure_count,
                            "Failure threshold reached"
                        );
                        self.transition(&mut inner, CircuitState::Open, "failure threshold reached", now);
                    }
                }
                Outcome::Neutral => {}
            },
            // Permits are never issued in OPEN, so a matching generation cannot land here.
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: &str, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.last_state_change = now;
        inner.success_count = 0;
        inner.half_open_in_flight = 0;
        if to == CircuitState::Closed {
            inner.failure_count = 0;
        }

        inner.transitions.push_back(StateTransition {
            at: self.clock.wall(),
            from,
            to,
            reason: reason.to_string(),
        });
        while inner.transitions.len() > self.config.transition_log_capacity {
            inner.transitions.pop_front();
        }
        inner.metrics.total_transitions += 1;

        info!(backend = %self.backend, %from, %to, reason, "Circuit state changed");
    }

    /// Trip the breaker regardless of counts.
    pub fn force_open(&self, reason: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(now);
        self.transition(&mut inner, CircuitState::Open, &format!("forced open: {reason}"), now);
    }

    /// Close the breaker regardless of counts.
    pub fn force_close(&self, reason: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed, &format!("forced closed: {reason}"), now);
    }

    /// Close the breaker and clear its metrics.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.metrics = CircuitMetrics::default();
        inner.transitions.clear();
        inner.last_failure_time = None;
        self.transition(&mut inner, CircuitState::Closed, "manual reset", now);
    }

    /// Current state. An OPEN breaker whose timeout elapsed still reads OPEN
    /// until the next call moves it.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Current failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Probe successes in the current HALF_OPEN episode.
    #[must_use]
    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    /// Probes in flight.
    #[must_use]
    pub fn half_open_in_flight(&self) -> u32 {
        self.inner.lock().half_open_in_flight
    }

    /// Snapshot of the counters and transition log.
    #[must_use]
    pub fn metrics(&self) -> CircuitMetrics {
        let inner = self.inner.lock();
        Self::metrics_of(&inner)
    }

    fn metrics_of(inner: &BreakerInner) -> CircuitMetrics {
        let mut metrics = inner.metrics.clone();
        metrics.transitions = inner.transitions.iter().cloned().collect();
        metrics
    }

    /// Monitoring view.
    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let retry_after = match (inner.state, inner.last_failure_time) {
            (CircuitState::Open, Some(t)) => {
                Some(self.recovery_timeout.saturating_sub(now.saturating_duration_since(t)))
            }
            _ => None,
        };
        BreakerStatus {
            backend: self.backend.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_in_flight: inner.half_open_in_flight,
            time_in_state: now.saturating_duration_since(inner.last_state_change),
            retry_after,
            metrics: Self::metrics_of(&inner),
        }
    }
}

/// Admission ticket for one call. See [`CircuitBreaker::acquire`].
#[must_use = "a permit must be settled with the call outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl CallPermit<'_> {
    /// The guarded operation succeeded.
    pub fn succeed(mut self) {
        self.settle(Outcome::Success);
    }

    /// The guarded operation failed through the backend's fault.
    pub fn fail(mut self) {
        self.settle(Outcome::Failure);
    }

    /// The operation failed for reasons that say nothing about the backend.
    pub fn release(mut self) {
        self.settle(Outcome::Neutral);
    }

    fn settle(&mut self, outcome: Outcome) {
        if !self.settled {
            self.settled = true;
            self.breaker.record(self.generation, outcome);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let outcome = if std::thread::panicking() {
                Outcome::Failure
            } else {
                Outcome::Neutral
            };
            self.settle(outcome);
        }
    }
}

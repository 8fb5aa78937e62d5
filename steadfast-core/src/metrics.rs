//! Runtime Metrics
//!
//! Lock-free counters for the hot path, a mutex-guarded accumulator for
//! money and per-backend tallies, and a snapshot type that aggregates
//! everything (breakers included) for dashboards.
//!
//! Design: `AtomicU64` counters incremented in the call path, read on export.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::breaker::{BreakerStatus, CircuitState};
use crate::types::Backend;

/// Atomic counters for high-frequency events.
#[derive(Debug, Default)]
pub struct CallCounters {
    /// Logical calls started.
    pub logical_calls: AtomicU64,
    /// Logical calls that produced output.
    pub successes: AtomicU64,
    /// Logical calls that returned `success = false`.
    pub failures: AtomicU64,
    /// Physical attempts that reached a backend.
    pub attempts: AtomicU64,
    /// Attempts that were retries of the same backend.
    pub retries: AtomicU64,
    /// Successes served by a non-preferred backend.
    pub fallbacks: AtomicU64,
    /// Calls stopped by the scope allow-list.
    pub scope_violations: AtomicU64,
    /// Calls where injection patterns were found.
    pub injections_detected: AtomicU64,
    /// Calls that gave up on the overall deadline.
    pub deadlines_exceeded: AtomicU64,
    /// Prompt tokens across all attempts.
    pub tokens_in: AtomicU64,
    /// Completion tokens across all attempts.
    pub tokens_out: AtomicU64,
}

impl CallCounters {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `counter` by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters for export.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            logical_calls: load(&self.logical_calls),
            successes: load(&self.successes),
            failures: load(&self.failures),
            attempts: load(&self.attempts),
            retries: load(&self.retries),
            fallbacks: load(&self.fallbacks),
            scope_violations: load(&self.scope_violations),
            injections_detected: load(&self.injections_detected),
            deadlines_exceeded: load(&self.deadlines_exceeded),
            tokens_in: load(&self.tokens_in),
            tokens_out: load(&self.tokens_out),
            cost_usd: 0.0,
        }
    }
}

/// Counter values at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CounterSnapshot {
    /// Logical calls started.
    pub logical_calls: u64,
    /// Logical calls that produced output.
    pub successes: u64,
    /// Logical calls that failed.
    pub failures: u64,
    /// Physical attempts.
    pub attempts: u64,
    /// Same-backend retries.
    pub retries: u64,
    /// Successes via fallback.
    pub fallbacks: u64,
    /// Scope violations.
    pub scope_violations: u64,
    /// Inputs with injection findings.
    pub injections_detected: u64,
    /// Deadline give-ups.
    pub deadlines_exceeded: u64,
    /// Prompt tokens across all attempts.
    pub tokens_in: u64,
    /// Completion tokens across all attempts.
    pub tokens_out: u64,
    /// Estimated spend across all attempts, USD.
    pub cost_usd: f64,
}

/// Per-backend tallies and spend, guarded by one mutex.
#[derive(Debug, Default)]
pub struct BackendTallies {
    inner: Mutex<TalliesInner>,
}

#[derive(Debug, Default)]
struct TalliesInner {
    success_counts: BTreeMap<String, u64>,
    fallback_counts: BTreeMap<String, u64>,
    cost_usd: f64,
}

impl BackendTallies {
    /// Record a logical success served by `backend`.
    pub fn record_success(&self, backend: &Backend, via_fallback: bool) {
        let key = backend.to_string();
        let mut inner = self.inner.lock();
        *inner.success_counts.entry(key.clone()).or_insert(0) += 1;
        if via_fallback {
            *inner.fallback_counts.entry(key).or_insert(0) += 1;
        }
    }

    /// Add spend from one attempt.
    pub fn add_cost(&self, cost_usd: f64) {
        if cost_usd.is_finite() && cost_usd > 0.0 {
            self.inner.lock().cost_usd += cost_usd;
        }
    }

    fn read(&self) -> (BTreeMap<String, u64>, BTreeMap<String, u64>, f64) {
        let inner = self.inner.lock();
        (
            inner.success_counts.clone(),
            inner.fallback_counts.clone(),
            inner.cost_usd,
        )
    }
}

/// Global metrics view across the caller and every breaker.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Breaker status per backend, in preference order.
    pub per_backend: Vec<BreakerStatus>,
    /// Successes served as a fallback, keyed by `provider:model`.
    pub fallback_counts: BTreeMap<String, u64>,
    /// Successes, keyed by `provider:model`.
    pub success_counts: BTreeMap<String, u64>,
    /// Call-level counters.
    pub calls: CounterSnapshot,
}

impl MetricsSnapshot {
    /// Assemble a snapshot.
    #[must_use]
    pub fn collect(
        counters: &CallCounters,
        tallies: &BackendTallies,
        per_backend: Vec<BreakerStatus>,
    ) -> Self {
        let (success_counts, fallback_counts, cost_usd) = tallies.read();
        let mut calls = counters.snapshot();
        calls.cost_usd = cost_usd;
        Self {
            per_backend,
            fallback_counts,
            success_counts,
            calls,
        }
    }

    /// Format as Prometheus-compatible text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let c = &self.calls;
        let mut out = String::new();
        let mut counter = |name: &str, help: &str, value: String| {
            let _ = write!(
                out,
                "# HELP steadfast_{name} {help}\n# TYPE steadfast_{name} counter\nsteadfast_{name} {value}\n"
            );
        };
        counter("logical_calls_total", "Logical calls started", c.logical_calls.to_string());
        counter("successes_total", "Logical calls that produced output", c.successes.to_string());
        counter("failures_total", "Logical calls that failed", c.failures.to_string());
        counter("attempts_total", "Physical backend attempts", c.attempts.to_string());
        counter("retries_total", "Same-backend retries", c.retries.to_string());
        counter("fallbacks_total", "Successes served by a fallback backend", c.fallbacks.to_string());
        counter("scope_violations_total", "Calls refused by the scope allow-list", c.scope_violations.to_string());
        counter("injections_detected_total", "Inputs with injection findings", c.injections_detected.to_string());
        counter("deadlines_exceeded_total", "Calls that ran out of time", c.deadlines_exceeded.to_string());
        counter("tokens_in_total", "Prompt tokens across all attempts", c.tokens_in.to_string());
        counter("tokens_out_total", "Completion tokens across all attempts", c.tokens_out.to_string());
        counter("cost_usd_total", "Estimated spend in USD", format!("{:.6}", c.cost_usd));

        out.push_str("# HELP steadfast_backend_successes_total Successes per backend\n");
        out.push_str("# TYPE steadfast_backend_successes_total counter\n");
        for (backend, n) in &self.success_counts {
            let _ = writeln!(out, "steadfast_backend_successes_total{{backend=\"{backend}\"}} {n}");
        }
        out.push_str("# HELP steadfast_backend_fallbacks_total Fallback successes per backend\n");
        out.push_str("# TYPE steadfast_backend_fallbacks_total counter\n");
        for (backend, n) in &self.fallback_counts {
            let _ = writeln!(out, "steadfast_backend_fallbacks_total{{backend=\"{backend}\"}} {n}");
        }

        out.push_str("# HELP steadfast_circuit_state Breaker state (0=closed, 1=half_open, 2=open)\n");
        out.push_str("# TYPE steadfast_circuit_state gauge\n");
        for status in &self.per_backend {
            let value = match status.state {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            let _ = writeln!(
                out,
                "steadfast_circuit_state{{backend=\"{}\"}} {value}",
                status.backend
            );
        }
        out.push_str("# HELP steadfast_circuit_rejected_total Calls rejected by the breaker\n");
        out.push_str("# TYPE steadfast_circuit_rejected_total counter\n");
        for status in &self.per_backend {
            let _ = writeln!(
                out,
                "steadfast_circuit_rejected_total{{backend=\"{}\"}} {}",
                status.backend, status.metrics.rejected_calls
            );
        }
        out
    }
}

//! Resilient Caller — composition root for one logical call
//!
//! ```text
//! execute(request)
//!   ├─ SecurityGate::validate        scope violation → CallResult(success=false), no network
//!   └─ FallbackChain::execute        preferred backend first, then preference order
//!        └─ per backend:
//!             loop attempt = 0..=max_retries
//!               CircuitBreaker::call(invoke with timeout)
//!               ok            → winner
//!               rejected      → next backend
//!               retryable     → sleep backoff(attempt), retry same backend
//!               anything else → next backend (or stop, for client errors)
//! ```
//!
//! Every physical attempt is recorded, priced and counted; the returned
//! [`CallResult`] reports the winning attempt only.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::breaker::{BreakerStatus, CircuitBreaker};
use crate::chain::FallbackChain;
use crate::clock::{Clock, SystemClock};
use crate::config::SteadfastConfig;
use crate::error::{BackendError, Result, SteadfastError};
use crate::invoker::{BackendInvoker, CostEstimator, PricingTable};
use crate::metrics::{BackendTallies, CallCounters, MetricsSnapshot};
use crate::security::SecurityGate;
use crate::types::{
    AttemptOutcome, AttemptRecord, Backend, BackendResponse, CallRequest, CallResult,
};

/// Per-call settings shared by every backend step.
struct AttemptContext<'a> {
    input: &'a str,
    max_retries: u32,
    attempt_timeout: Duration,
    started: Instant,
    deadline: Option<Instant>,
    records: &'a Mutex<Vec<AttemptRecord>>,
}

impl AttemptContext<'_> {
    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Timeout for the next attempt, or `DeadlineExceeded` if none is left.
    fn attempt_budget(&self) -> Result<Duration> {
        match self.remaining() {
            None => Ok(self.attempt_timeout),
            Some(left) if left.is_zero() => Err(SteadfastError::DeadlineExceeded {
                elapsed: self.started.elapsed(),
            }),
            Some(left) => Ok(self.attempt_timeout.min(left)),
        }
    }

    fn clip(&self, delay: Duration) -> Duration {
        self.remaining().map_or(delay, |left| delay.min(left))
    }
}

/// The attempt that produced output.
struct Winner {
    response: BackendResponse,
    attempt: u32,
    latency: Duration,
    cost_usd: f64,
}

/// Orchestrates gate → chain → breaker → invoker for every logical call.
pub struct ResilientCaller {
    chain: FallbackChain,
    gate: SecurityGate,
    backoff: BackoffPolicy,
    invoker: Arc<dyn BackendInvoker>,
    cost: Arc<dyn CostEstimator>,
    config: SteadfastConfig,
    counters: CallCounters,
    tallies: BackendTallies,
}

impl std::fmt::Debug for ResilientCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientCaller")
            .field("chain", &self.chain)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl ResilientCaller {
    /// Start building a caller.
    #[must_use]
    pub fn builder() -> ResilientCallerBuilder {
        ResilientCallerBuilder::default()
    }

    /// Caller with default pricing, backoff and the system clock.
    ///
    /// # Errors
    /// `Config` if the configuration is invalid or a backend has no invoker.
    pub fn from_config(config: SteadfastConfig, invoker: Arc<dyn BackendInvoker>) -> Result<Self> {
        Self::builder().config(config).invoker(invoker).build()
    }

    /// The failover chain, for administrative access to breakers.
    #[must_use]
    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    /// The security gate in use.
    #[must_use]
    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    /// Breaker status for one backend.
    #[must_use]
    pub fn status(&self, backend: &Backend) -> Option<BreakerStatus> {
        self.chain.breaker(backend).map(|cb| cb.status())
    }

    /// Global metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot::collect(&self.counters, &self.tallies, self.chain.statuses())
    }

    /// Run one logical call. Never fails: problems come back as
    /// `CallResult { success: false, .. }`.
    pub async fn execute(&self, request: CallRequest) -> CallResult {
        let started = Instant::now();
        CallCounters::bump(&self.counters.logical_calls);

        let security = &self.config.security;
        let allowed = request
            .allowed_scopes
            .as_deref()
            .unwrap_or(&security.default_allowed_scopes);
        let sanitize = request.sanitize.unwrap_or(security.sanitize);

        let verdict = match self
            .gate
            .validate(&request.input, request.scope.as_deref(), allowed, sanitize)
        {
            Ok(verdict) => verdict,
            Err(error) => return self.refuse(&error, started),
        };
        if verdict.injection_detected {
            CallCounters::bump(&self.counters.injections_detected);
        }

        let Some(preferred) = request
            .preferred
            .clone()
            .or_else(|| self.chain.available_backend().cloned())
            .or_else(|| self.chain.backends().first().cloned())
        else {
            return self.refuse(
                &SteadfastError::Config("no backends configured".into()),
                started,
            );
        };

        let deadline = request
            .deadline
            .or_else(|| self.config.retry.deadline())
            .and_then(|d| started.checked_add(d));
        let records = Mutex::new(Vec::new());
        let ctx = AttemptContext {
            input: &verdict.sanitized_input,
            max_retries: request.max_retries.unwrap_or(self.config.retry.max_retries),
            attempt_timeout: request
                .timeout
                .unwrap_or_else(|| self.config.retry.attempt_timeout()),
            started,
            deadline,
            records: &records,
        };

        debug!(preferred = %preferred, max_retries = ctx.max_retries, "Starting logical call");
        let ctx_ref = &ctx;
        let outcome = self
            .chain
            .execute_guarded(
                &preferred,
                || ctx_ref.attempt_budget().map(drop),
                move |backend, breaker| self.run_backend(ctx_ref, backend, breaker),
            )
            .await;

        let records = records.into_inner();
        let total_attempts = u32::try_from(records.len()).unwrap_or(u32::MAX);

        let mut result = match outcome.result {
            Ok(winner) => {
                let backend = outcome.backend_used.clone().unwrap_or_else(|| preferred.clone());
                CallCounters::bump(&self.counters.successes);
                if outcome.fallback_occurred {
                    CallCounters::bump(&self.counters.fallbacks);
                }
                self.tallies.record_success(&backend, outcome.fallback_occurred);
                info!(
                    backend = %backend,
                    fallback = outcome.fallback_occurred,
                    retry_attempt = winner.attempt,
                    latency_ms = u64::try_from(winner.latency.as_millis()).unwrap_or(u64::MAX),
                    "Logical call succeeded"
                );
                CallResult {
                    success: true,
                    output: Some(winner.response.text),
                    error: None,
                    error_kind: None,
                    backend_used: Some(backend),
                    fallback_occurred: outcome.fallback_occurred,
                    attempted_backends: outcome.attempted,
                    tokens_in: winner.response.tokens_in,
                    tokens_out: winner.response.tokens_out,
                    cost_usd: winner.cost_usd,
                    latency: winner.latency,
                    retry_attempt: winner.attempt,
                    total_attempts,
                    injection_detected: false,
                    detected_patterns: Vec::new(),
                    input_sanitized: false,
                }
            }
            Err(error) => {
                CallCounters::bump(&self.counters.failures);
                if matches!(error, SteadfastError::DeadlineExceeded { .. }) {
                    CallCounters::bump(&self.counters.deadlines_exceeded);
                }
                warn!(
                    preferred = %preferred,
                    attempted = outcome.attempted.len(),
                    error = %error,
                    "Logical call failed"
                );
                let mut failed = CallResult::rejected(&error, started.elapsed());
                failed.attempted_backends = outcome.attempted;
                failed.total_attempts = total_attempts;
                failed.retry_attempt = records.last().map_or(0, |r| r.attempt_index);
                failed
            }
        };
        result.injection_detected = verdict.injection_detected;
        result.detected_patterns = verdict.detected_patterns;
        result.input_sanitized = verdict.input_sanitized;
        result
    }

    /// Result for a call stopped before reaching any backend.
    fn refuse(&self, error: &SteadfastError, started: Instant) -> CallResult {
        CallCounters::bump(&self.counters.failures);
        let mut result = CallResult::rejected(error, started.elapsed());
        match error {
            SteadfastError::ScopeViolation { scope, .. } => {
                CallCounters::bump(&self.counters.scope_violations);
                warn!(scope = %scope, "Call refused: scope violation");
            }
            SteadfastError::InjectionBlocked { patterns } => {
                CallCounters::bump(&self.counters.injections_detected);
                warn!(patterns = ?patterns, "Call refused: injection blocked");
                result.injection_detected = true;
                result.detected_patterns = patterns.clone();
            }
            other => warn!(error = %other, "Call refused"),
        }
        result
    }

    /// Retry loop against one backend.
    async fn run_backend(
        &self,
        ctx: &AttemptContext<'_>,
        backend: Backend,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Winner> {
        let mut attempt: u32 = 0;
        loop {
            let timeout = ctx.attempt_budget()?;
            let attempt_started = Instant::now();
            let result = breaker
                .call(|| self.invoke_once(&backend, ctx.input, timeout))
                .await;
            let latency = attempt_started.elapsed();

            let error = match result {
                Ok(response) => {
                    let cost_usd =
                        self.cost
                            .estimate(&backend.model, response.tokens_in, response.tokens_out);
                    self.record_attempt(ctx, &backend, attempt, latency, None, &response, cost_usd);
                    return Ok(Winner {
                        response,
                        attempt,
                        latency,
                        cost_usd,
                    });
                }
                Err(e) if e.is_rejection() => return Err(e),
                Err(e) => e,
            };

            self.record_attempt(
                ctx,
                &backend,
                attempt,
                latency,
                Some(&error),
                &BackendResponse::new("", 0, 0),
                0.0,
            );
            if !error.is_retryable() || attempt >= ctx.max_retries {
                return Err(error);
            }

            let hinted = error.retry_after().unwrap_or_default();
            let delay = ctx.clip(self.backoff.delay(attempt).max(hinted));
            debug!(
                backend = %backend,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying backend"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            CallCounters::bump(&self.counters.retries);
        }
    }

    /// One physical invocation, bounded by `timeout`.
    async fn invoke_once(&self, backend: &Backend, input: &str, timeout: Duration) -> Result<BackendResponse> {
        match tokio::time::timeout(timeout, self.invoker.invoke(backend, input, timeout)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(SteadfastError::from_backend(backend.to_string(), e)),
            Err(_) => Err(SteadfastError::from_backend(
                backend.to_string(),
                BackendError::Timeout(timeout),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_attempt(
        &self,
        ctx: &AttemptContext<'_>,
        backend: &Backend,
        attempt_index: u32,
        latency: Duration,
        error: Option<&SteadfastError>,
        usage: &BackendResponse,
        cost_usd: f64,
    ) {
        CallCounters::bump(&self.counters.attempts);
        self.counters
            .tokens_in
            .fetch_add(u64::from(usage.tokens_in), std::sync::atomic::Ordering::Relaxed);
        self.counters
            .tokens_out
            .fetch_add(u64::from(usage.tokens_out), std::sync::atomic::Ordering::Relaxed);
        self.tallies.add_cost(cost_usd);

        if let Some(e) = error {
            warn!(backend = %backend, attempt = attempt_index, error = %e, "Attempt failed");
        }
        ctx.records.lock().push(AttemptRecord {
            backend: backend.clone(),
            attempt_index,
            outcome: if error.is_none() {
                AttemptOutcome::Success
            } else {
                AttemptOutcome::Failure
            },
            latency,
            error: error.map(ToString::to_string),
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_usd,
        });
    }
}

/// Builder for [`ResilientCaller`].
#[derive(Default)]
pub struct ResilientCallerBuilder {
    config: SteadfastConfig,
    invoker: Option<Arc<dyn BackendInvoker>>,
    cost: Option<Arc<dyn CostEstimator>>,
    clock: Option<Arc<dyn Clock>>,
    backoff: Option<BackoffPolicy>,
}

impl ResilientCallerBuilder {
    /// Use `config` (backends, thresholds, defaults).
    #[must_use]
    pub fn config(mut self, config: SteadfastConfig) -> Self {
        self.config = config;
        self
    }

    /// Transport used for every backend.
    #[must_use]
    pub fn invoker(mut self, invoker: Arc<dyn BackendInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Cost estimator. Defaults to the configured pricing table.
    #[must_use]
    pub fn cost_estimator(mut self, cost: Arc<dyn CostEstimator>) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Clock for breaker recovery timeouts. Defaults to the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the configured backoff policy.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Validate and assemble.
    ///
    /// # Errors
    /// `Config` for invalid configuration, a missing invoker, or a backend
    /// the invoker cannot reach.
    pub fn build(self) -> Result<ResilientCaller> {
        self.config.validate()?;
        let invoker = self
            .invoker
            .ok_or_else(|| SteadfastError::Config("a backend invoker is required".into()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let chain = FallbackChain::from_config(&self.config, clock)?;

        if let Some(unsupported) = chain.backends().iter().find(|b| !invoker.supports(b)) {
            return Err(SteadfastError::Config(format!(
                "no invoker can reach backend {unsupported}"
            )));
        }

        let cost = self
            .cost
            .unwrap_or_else(|| Arc::new(PricingTable::from_config(&self.config.pricing)));
        let backoff = self
            .backoff
            .unwrap_or_else(|| BackoffPolicy::from_config(&self.config.backoff));

        Ok(ResilientCaller {
            gate: SecurityGate::new(&self.config.security),
            chain,
            backoff,
            invoker,
            cost,
            config: self.config,
            counters: CallCounters::new(),
            tallies: BackendTallies::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::BackendConfig;
    use crate::invoker::BoxFuture;

    /// Replays scripted replies per backend, then answers "ok".
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<HashMap<Backend, VecDeque<std::result::Result<BackendResponse, BackendError>>>>,
        calls: Mutex<Vec<(Backend, String)>>,
    }

    impl Scripted {
        fn script(self, backend: &Backend, replies: Vec<std::result::Result<BackendResponse, BackendError>>) -> Self {
            self.replies.lock().insert(backend.clone(), replies.into());
            self
        }

        fn calls_to(&self, backend: &Backend) -> usize {
            self.calls.lock().iter().filter(|(b, _)| b == backend).count()
        }
    }

    impl BackendInvoker for Scripted {
        fn invoke<'a>(
            &'a self,
            backend: &'a Backend,
            input: &'a str,
            _timeout: Duration,
        ) -> BoxFuture<'a, std::result::Result<BackendResponse, BackendError>> {
            self.calls.lock().push((backend.clone(), input.to_string()));
            let reply = self
                .replies
                .lock()
                .get_mut(backend)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(BackendResponse::new(format!("ok from {backend}"), 10, 5)));
            Box::pin(async move { reply })
        }
    }

    fn a() -> Backend {
        Backend::new("openai", "gpt-4o")
    }

    fn b() -> Backend {
        Backend::new("ollama", "llama3.2")
    }

    fn caller(invoker: Arc<Scripted>) -> ResilientCaller {
        let mut config = SteadfastConfig::default();
        config.backends = [a(), b()]
            .iter()
            .map(|x| BackendConfig {
                provider: x.provider.clone(),
                model: x.model.clone(),
            })
            .collect();
        config.backoff.jitter = false;
        ResilientCaller::builder()
            .config(config)
            .invoker(invoker)
            .clock(Arc::new(ManualClock::new()))
            .build()
            .expect("valid caller")
    }

    #[tokio::test(start_paused = true)]
    async fn retries_same_backend_before_failing_over() {
        let invoker = Arc::new(Scripted::default().script(
            &a(),
            vec![
                Err(BackendError::Timeout(Duration::from_secs(1))),
                Err(BackendError::RateLimited { retry_after: None }),
            ],
        ));
        let caller = caller(Arc::clone(&invoker));
        let result = caller.execute(CallRequest::new("hi").preferred(a())).await;

        assert!(result.success);
        assert_eq!(result.backend_used, Some(a()));
        assert_eq!(result.retry_attempt, 2);
        assert_eq!(result.total_attempts, 3);
        assert_eq!(result.attempted_backends, vec![a()]);
        assert!(!result.fallback_occurred);
        assert_eq!(invoker.calls_to(&b()), 0);
        assert_eq!(caller.metrics().calls.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_skip_retries_but_fail_over() {
        let invoker = Arc::new(
            Scripted::default().script(&a(), vec![Err(BackendError::Fatal("401 unauthorized".into()))]),
        );
        let caller = caller(Arc::clone(&invoker));
        let result = caller.execute(CallRequest::new("hi").preferred(a()).max_retries(3)).await;

        assert!(result.success);
        assert_eq!(invoker.calls_to(&a()), 1);
        assert_eq!(result.backend_used, Some(b()));
        assert!(result.fallback_occurred);
        assert_eq!(caller.chain().breaker(&a()).expect("a").failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scope_violation_never_reaches_network() {
        let invoker = Arc::new(Scripted::default());
        let caller = caller(Arc::clone(&invoker));
        let result = caller
            .execute(
                CallRequest::new("hi")
                    .scope("write:code")
                    .allowed_scopes(["read:*", "write:docs"]),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(crate::error::ErrorKind::ScopeViolation));
        assert!(invoker.calls.lock().is_empty());
        assert!(result.attempted_backends.is_empty());
        assert_eq!(caller.metrics().calls.scope_violations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sanitized_input_is_what_gets_sent() {
        let invoker = Arc::new(Scripted::default());
        let caller = caller(Arc::clone(&invoker));
        let result = caller
            .execute(CallRequest::new("run ```ls```").sanitize(true))
            .await;

        assert!(result.success);
        assert!(result.injection_detected);
        assert!(result.input_sanitized);
        assert_eq!(result.detected_patterns, vec!["```".to_string()]);
        let calls = invoker.calls.lock();
        assert_eq!(calls[0].1, "run \\`\\`\\`ls\\`\\`\\`");
    }

    #[test]
    fn build_requires_an_invoker() {
        let mut config = SteadfastConfig::default();
        config.backends = vec![BackendConfig {
            provider: "openai".into(),
            model: "gpt-4o".into(),
        }];
        let err = ResilientCaller::builder().config(config).build();
        assert!(matches!(err, Err(SteadfastError::Config(_))));
    }
}

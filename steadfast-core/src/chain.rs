//! Fallback Chain — ordered failover across backends
//!
//! The chain owns one [`CircuitBreaker`] per backend and a fixed preference
//! order. A logical call starts at the preferred backend; each failure
//! advances to the first backend in preference order not yet attempted in
//! this call. Backends whose breaker is OPEN still pass through their
//! breaker, which rejects them without touching the network, so the attempt
//! history always reflects the preference order.
//!
//! Breaker state is read fresh at every advance. The order itself never
//! changes at runtime.
//!
//! Termination is by attempt history, not by "first non-OPEN backend": the
//! latter would stop at A forever when A is OPEN and would never produce an
//! `[A, B, C]` history. Do not switch `next_candidate` to
//! [`available_backend`](FallbackChain::available_backend).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::breaker::{BreakerStatus, CircuitBreaker, CircuitState};
use crate::clock::Clock;
use crate::config::{BreakerConfig, SteadfastConfig};
use crate::error::{Result, SteadfastError};
use crate::types::Backend;

/// Result of a failover run.
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    /// Value from the winning backend, or the last error.
    pub result: Result<T>,
    /// Backend that produced the value.
    pub backend_used: Option<Backend>,
    /// Whether the winner differs from the preferred backend.
    pub fallback_occurred: bool,
    /// Backends tried, in order, each at most once.
    pub attempted: Vec<Backend>,
}

impl<T> FallbackOutcome<T> {
    fn failed(error: SteadfastError, attempted: Vec<Backend>) -> Self {
        Self {
            result: Err(error),
            backend_used: None,
            fallback_occurred: false,
            attempted,
        }
    }

    /// Whether a backend produced a value.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Ordered backends with one breaker each.
#[derive(Debug)]
pub struct FallbackChain {
    order: Vec<Backend>,
    breakers: HashMap<Backend, Arc<CircuitBreaker>>,
}

impl FallbackChain {
    /// Build a chain over `backends` in preference order.
    ///
    /// # Errors
    /// `Config` for an empty list, duplicate backends, or invalid thresholds.
    pub fn new(backends: Vec<Backend>, config: &BreakerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if backends.is_empty() {
            return Err(SteadfastError::Config("fallback chain needs at least one backend".into()));
        }
        let mut breakers = HashMap::with_capacity(backends.len());
        for backend in &backends {
            let breaker = CircuitBreaker::new(backend.clone(), config.clone(), Arc::clone(&clock))?;
            if breakers.insert(backend.clone(), Arc::new(breaker)).is_some() {
                return Err(SteadfastError::Config(format!("duplicate backend {backend}")));
            }
        }
        Ok(Self {
            order: backends,
            breakers,
        })
    }

    /// Build from the `backends` and `breaker` sections of a config.
    ///
    /// # Errors
    /// Same as [`FallbackChain::new`].
    pub fn from_config(config: &SteadfastConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::new(config.backend_list(), &config.breaker, clock)
    }

    /// Backends in preference order.
    #[must_use]
    pub fn backends(&self) -> &[Backend] {
        &self.order
    }

    /// Breaker guarding `backend`.
    #[must_use]
    pub fn breaker(&self, backend: &Backend) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(backend)
    }

    /// First backend, in preference order, whose breaker is not OPEN.
    #[must_use]
    pub fn available_backend(&self) -> Option<&Backend> {
        self.order.iter().find(|b| {
            self.breakers
                .get(*b)
                .is_some_and(|cb| cb.state() != CircuitState::Open)
        })
    }

    fn next_candidate(&self, attempted: &[Backend]) -> Option<&Backend> {
        self.order.iter().find(|b| !attempted.contains(b))
    }

    /// Drive `step` across backends until one succeeds.
    ///
    /// `step` receives the backend and its breaker and decides how to use
    /// them (one guarded call, or several with retries). Errors for which
    /// [`aborts_chain`](SteadfastError::aborts_chain) is true stop the run
    /// immediately.
    pub async fn execute<T, F, Fut>(&self, preferred: &Backend, step: F) -> FallbackOutcome<T>
    where
        F: FnMut(Backend, Arc<CircuitBreaker>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_guarded(preferred, || Ok(()), step).await
    }

    /// Like [`execute`](Self::execute), but `admit` is consulted before each
    /// backend is entered. An `admit` error ends the run with that error and
    /// the backend is not listed as attempted.
    pub async fn execute_guarded<T, A, F, Fut>(
        &self,
        preferred: &Backend,
        admit: A,
        mut step: F,
    ) -> FallbackOutcome<T>
    where
        A: Fn() -> Result<()>,
        F: FnMut(Backend, Arc<CircuitBreaker>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempted: Vec<Backend> = Vec::with_capacity(self.order.len());
        let mut current = preferred.clone();

        loop {
            let Some(breaker) = self.breakers.get(&current).map(Arc::clone) else {
                return FallbackOutcome::failed(
                    SteadfastError::UnknownBackend(current.to_string()),
                    attempted,
                );
            };
            if let Err(error) = admit() {
                debug!(backend = %current, error = %error, "Not admitted, stopping failover");
                return FallbackOutcome::failed(error, attempted);
            }
            attempted.push(current.clone());

            let error = match step(current.clone(), breaker).await {
                Ok(value) => {
                    let fallback_occurred = current != *preferred;
                    if fallback_occurred {
                        info!(preferred = %preferred, used = %current, "Served by fallback backend");
                    }
                    return FallbackOutcome {
                        result: Ok(value),
                        backend_used: Some(current),
                        fallback_occurred,
                        attempted,
                    };
                }
                Err(e) => e,
            };

            if error.aborts_chain() {
                debug!(backend = %current, error = %error, "Non-recoverable error, stopping failover");
                return FallbackOutcome::failed(error, attempted);
            }

            if let Some(next) = self.next_candidate(&attempted) {
                if error.is_rejection() {
                    debug!(backend = %current, next = %next, "Breaker rejected call, advancing");
                } else {
                    warn!(backend = %current, next = %next, error = %error, "Backend failed, advancing");
                }
                current = next.clone();
            } else {
                warn!(
                    attempted = attempted.len(),
                    error = %error,
                    "Fallback chain exhausted"
                );
                return FallbackOutcome::failed(error, attempted);
            }
        }
    }

    /// One breaker-guarded `operation` call per backend, in failover order.
    pub async fn call_with_fallback<T, F, Fut>(&self, preferred: &Backend, operation: F) -> FallbackOutcome<T>
    where
        F: Fn(Backend) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let operation = &operation;
        self.execute(preferred, move |backend, breaker| async move {
            breaker.call(move || operation(backend)).await
        })
        .await
    }

    /// Status of every breaker, in preference order.
    #[must_use]
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        self.order
            .iter()
            .filter_map(|b| self.breakers.get(b))
            .map(|cb| cb.status())
            .collect()
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        for cb in self.breakers.values() {
            cb.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::BackendError;

    fn abc() -> (FallbackChain, [Backend; 3]) {
        let backends = [
            Backend::new("p", "A"),
            Backend::new("p", "B"),
            Backend::new("p", "C"),
        ];
        let chain = FallbackChain::new(
            backends.to_vec(),
            &BreakerConfig::default(),
            Arc::new(ManualClock::new()),
        )
        .expect("valid chain");
        (chain, backends)
    }

    fn outage(b: &Backend) -> SteadfastError {
        SteadfastError::from_backend(b.to_string(), BackendError::Connection("refused".into()))
    }

    #[tokio::test]
    async fn skips_open_breakers_in_order() {
        let (chain, [a, b, c]) = abc();
        chain.breaker(&a).expect("a").force_open("outage");
        chain.breaker(&b).expect("b").force_open("outage");

        let invoked = AtomicU32::new(0);
        let outcome = chain
            .call_with_fallback(&a, |backend| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async move { Ok(backend.model.clone()) }
            })
            .await;

        assert_eq!(outcome.result.expect("served"), "C");
        assert_eq!(outcome.backend_used, Some(c.clone()));
        assert!(outcome.fallback_occurred);
        assert_eq!(outcome.attempted, vec![a.clone(), b.clone(), c]);
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(chain.breaker(&a).expect("a").metrics().rejected_calls, 1);
    }

    #[tokio::test]
    async fn exhausts_without_repeating_a_backend() {
        let (chain, [a, b, c]) = abc();
        let outcome: FallbackOutcome<()> = chain
            .call_with_fallback(&b, |backend| async move { Err(outage(&backend)) })
            .await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.attempted, vec![b, a, c.clone()]);
        match outcome.result {
            Err(SteadfastError::RetryableBackend { backend, .. }) => assert_eq!(backend, c.to_string()),
            other => panic!("expected last backend error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn preferred_success_is_not_a_fallback() {
        let (chain, [a, ..]) = abc();
        let outcome = chain
            .call_with_fallback(&a, |_| async { Ok(42) })
            .await;
        assert!(!outcome.fallback_occurred);
        assert_eq!(outcome.attempted, vec![a]);
    }

    #[tokio::test]
    async fn client_errors_stop_failover() {
        let (chain, [a, ..]) = abc();
        let outcome: FallbackOutcome<()> = chain
            .call_with_fallback(&a, |backend| async move {
                Err(SteadfastError::from_backend(
                    backend.to_string(),
                    BackendError::InvalidRequest("prompt too long".into()),
                ))
            })
            .await;
        assert_eq!(outcome.attempted, vec![a.clone()]);
        assert!(matches!(outcome.result, Err(SteadfastError::InvalidRequest { .. })));
        assert_eq!(chain.breaker(&a).expect("a").failure_count(), 0);
    }

    #[tokio::test]
    async fn unknown_preferred_backend_fails_cleanly() {
        let (chain, _) = abc();
        let outcome = chain
            .call_with_fallback(&Backend::new("nope", "x"), |_| async { Ok(()) })
            .await;
        assert!(outcome.attempted.is_empty());
        assert!(matches!(outcome.result, Err(SteadfastError::UnknownBackend(_))));
    }

    #[tokio::test]
    async fn available_backend_filters_open_breakers() {
        let (chain, [a, b, c]) = abc();
        assert_eq!(chain.available_backend(), Some(&a));
        chain.breaker(&a).expect("a").force_open("down");
        assert_eq!(chain.available_backend(), Some(&b));
        chain.breaker(&b).expect("b").force_open("down");
        chain.breaker(&c).expect("c").force_open("down");
        assert_eq!(chain.available_backend(), None);

        chain.reset_all();
        assert_eq!(chain.available_backend(), Some(&a));
        assert!(chain.statuses().iter().all(|s| s.state == CircuitState::Closed));
    }

    #[tokio::test]
    async fn refused_admission_leaves_backend_unattempted() {
        let (chain, [a, ..]) = abc();
        let admitted = AtomicU32::new(0);
        let outcome: FallbackOutcome<()> = chain
            .execute_guarded(
                &a,
                || {
                    if admitted.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(())
                    } else {
                        Err(SteadfastError::DeadlineExceeded {
                            elapsed: std::time::Duration::from_secs(3),
                        })
                    }
                },
                |backend, breaker| async move {
                    breaker.call(move || async move { Err::<(), _>(outage(&backend)) }).await
                },
            )
            .await;
        assert_eq!(outcome.attempted, vec![a]);
        assert!(matches!(outcome.result, Err(SteadfastError::DeadlineExceeded { .. })));
    }

    #[test]
    fn rejects_bad_construction() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        assert!(FallbackChain::new(Vec::new(), &BreakerConfig::default(), Arc::clone(&clock)).is_err());
        let dup = vec![Backend::new("p", "A"), Backend::new("p", "A")];
        assert!(FallbackChain::new(dup, &BreakerConfig::default(), clock).is_err());
    }
}

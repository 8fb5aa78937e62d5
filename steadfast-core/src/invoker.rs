//! Seams to the outside world: backend invocation and cost estimation.
//!
//! Providers are resolved once, at construction, into a [`ProviderRouter`];
//! nothing downstream inspects model names to decide where a call goes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ModelPrice, PricingConfig};
use crate::error::BackendError;
use crate::types::{Backend, BackendResponse};

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Performs one network call to one backend.
///
/// Implementations should honour `timeout` themselves where the transport
/// supports it; the caller also enforces it from the outside.
pub trait BackendInvoker: Send + Sync {
    /// Send `input` to `backend`.
    fn invoke<'a>(
        &'a self,
        backend: &'a Backend,
        input: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<BackendResponse, BackendError>>;

    /// Whether this invoker can reach `backend`.
    fn supports(&self, _backend: &Backend) -> bool {
        true
    }
}

impl<T: BackendInvoker + ?Sized> BackendInvoker for Arc<T> {
    fn invoke<'a>(
        &'a self,
        backend: &'a Backend,
        input: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<BackendResponse, BackendError>> {
        (**self).invoke(backend, input, timeout)
    }

    fn supports(&self, backend: &Backend) -> bool {
        (**self).supports(backend)
    }
}

/// Dispatches to one invoker per provider id.
#[derive(Clone, Default)]
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn BackendInvoker>>,
}

impl ProviderRouter {
    /// Empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `invoker` for every backend whose provider is `provider`.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>, invoker: Arc<dyn BackendInvoker>) -> Self {
        self.providers.insert(provider.into(), invoker);
        self
    }

    /// Registered provider ids, sorted.
    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("providers", &self.providers())
            .finish()
    }
}

impl BackendInvoker for ProviderRouter {
    fn invoke<'a>(
        &'a self,
        backend: &'a Backend,
        input: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<BackendResponse, BackendError>> {
        match self.providers.get(&backend.provider) {
            Some(invoker) => invoker.invoke(backend, input, timeout),
            None => {
                let message = format!("no invoker registered for provider '{}'", backend.provider);
                Box::pin(async move { Err(BackendError::Fatal(message)) })
            }
        }
    }

    fn supports(&self, backend: &Backend) -> bool {
        self.providers
            .get(&backend.provider)
            .is_some_and(|invoker| invoker.supports(backend))
    }
}

/// Estimates the monetary cost of a call.
pub trait CostEstimator: Send + Sync {
    /// USD cost of `tokens_in` prompt and `tokens_out` completion tokens.
    fn estimate(&self, model: &str, tokens_in: u32, tokens_out: u32) -> f64;
}

impl<F> CostEstimator for F
where
    F: Fn(&str, u32, u32) -> f64 + Send + Sync,
{
    fn estimate(&self, model: &str, tokens_in: u32, tokens_out: u32) -> f64 {
        self(model, tokens_in, tokens_out)
    }
}

/// Everything is free.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroCost;

impl CostEstimator for ZeroCost {
    fn estimate(&self, _model: &str, _tokens_in: u32, _tokens_out: u32) -> f64 {
        0.0
    }
}

/// Per-1K-token price list with longest-prefix model matching.
///
/// Unknown models cost nothing (local models, mostly).
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: Vec<ModelPrice>,
}

impl PricingTable {
    /// Table from configuration.
    #[must_use]
    pub fn from_config(config: &PricingConfig) -> Self {
        let mut prices = config.models.clone();
        prices.sort_by(|a, b| b.model_prefix.len().cmp(&a.model_prefix.len()));
        Self { prices }
    }

    /// Price entry for `model`.
    #[must_use]
    pub fn lookup(&self, model: &str) -> Option<&ModelPrice> {
        self.prices.iter().find(|p| model.starts_with(&p.model_prefix))
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default())
    }
}

impl CostEstimator for PricingTable {
    fn estimate(&self, model: &str, tokens_in: u32, tokens_out: u32) -> f64 {
        self.lookup(model).map_or(0.0, |p| {
            f64::from(tokens_in) / 1000.0 * p.input_per_1k
                + f64::from(tokens_out) / 1000.0 * p.output_per_1k
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl BackendInvoker for Echo {
        fn invoke<'a>(
            &'a self,
            backend: &'a Backend,
            input: &'a str,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<BackendResponse, BackendError>> {
            Box::pin(async move { Ok(BackendResponse::new(format!("{backend}: {input}"), 1, 1)) })
        }
    }

    #[tokio::test]
    async fn router_dispatches_by_provider() {
        let router = ProviderRouter::new().with_provider("ollama", Arc::new(Echo));
        let local = Backend::new("ollama", "llama3.2");
        let remote = Backend::new("openai", "gpt-4o");

        assert!(router.supports(&local));
        assert!(!router.supports(&remote));

        let ok = router.invoke(&local, "hi", Duration::from_secs(1)).await.expect("routed");
        assert_eq!(ok.text, "ollama:llama3.2: hi");

        let err = router.invoke(&remote, "hi", Duration::from_secs(1)).await;
        assert!(matches!(err, Err(BackendError::Fatal(_))));
    }

    #[test]
    fn pricing_uses_longest_prefix() {
        let table = PricingTable::default();
        let mini = table.estimate("gpt-4o-mini-2024-07-18", 1000, 1000);
        let full = table.estimate("gpt-4o-2024-08-06", 1000, 1000);
        assert!((mini - 0.000_75).abs() < 1e-12);
        assert!((full - 0.012_5).abs() < 1e-12);
        assert!(table.estimate("llama3.2", 5000, 5000).abs() < f64::EPSILON);
    }

    #[test]
    fn closures_estimate_cost() {
        let flat = |_: &str, tin: u32, tout: u32| f64::from(tin + tout) * 0.001;
        assert!((flat.estimate("any", 10, 20) - 0.03).abs() < 1e-12);
        assert!(ZeroCost.estimate("gpt-4", 1000, 1000).abs() < f64::EPSILON);
    }
}

//! Configuration for the Steadfast resilience core.
//!
//! Maps directly to `steadfast.toml`. Every section is optional; missing
//! values take the defaults below.
//!
//! ```toml
//! [breaker]
//! failure_threshold = 3
//! recovery_timeout_secs = 30.0
//!
//! [[backends]]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [[backends]]
//! provider = "ollama"
//! model = "llama3.2"
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SteadfastError};
use crate::types::Backend;

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SteadfastConfig {
    /// Circuit breaker thresholds, shared by every backend.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Delay policy between retries.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Retry budget and timeouts.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Scope allow-list and injection handling.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Backends in preference order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Per-model token prices.
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl SteadfastConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `SteadfastError::Config` if the TOML is invalid or fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| SteadfastError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Check every section for values the core cannot run with.
    ///
    /// # Errors
    /// Returns `SteadfastError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.breaker.validate()?;
        self.backoff.validate()?;
        self.retry.validate()?;
        self.validate_backends()
    }

    /// Ordered backend list.
    #[must_use]
    pub fn backend_list(&self) -> Vec<Backend> {
        self.backends
            .iter()
            .map(|b| Backend::new(&b.provider, &b.model))
            .collect()
    }

    fn validate_backends(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(SteadfastError::Config("at least one backend is required".into()));
        }
        let mut seen = HashSet::new();
        for b in &self.backends {
            if b.provider.trim().is_empty() || b.model.trim().is_empty() {
                return Err(SteadfastError::Config(
                    "backend provider and model must be non-empty".into(),
                ));
            }
            if !seen.insert((b.provider.as_str(), b.model.as_str())) {
                return Err(SteadfastError::Config(format!(
                    "duplicate backend {}:{}",
                    b.provider, b.model
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive-ish failures (with success decay) before opening.
    #[serde(default = "default_5")]
    pub failure_threshold: u32,
    /// Seconds an OPEN breaker waits before admitting a recovery probe.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: f64,
    /// Concurrent probes allowed while HALF_OPEN.
    #[serde(default = "default_1")]
    pub half_open_max_calls: u32,
    /// Probe successes required to close again.
    #[serde(default = "default_2")]
    pub success_threshold: u32,
    /// Most recent transitions kept in the log.
    #[serde(default = "default_256")]
    pub transition_log_capacity: usize,
}

impl BreakerConfig {
    /// Recovery timeout as a `Duration`.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.recovery_timeout_secs).unwrap_or(Duration::MAX)
    }

    /// # Errors
    /// Returns `SteadfastError::Config` for thresholds below one or a
    /// non-positive recovery timeout.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold < 1 {
            return Err(SteadfastError::Config("breaker.failure_threshold must be >= 1".into()));
        }
        if self.half_open_max_calls < 1 {
            return Err(SteadfastError::Config("breaker.half_open_max_calls must be >= 1".into()));
        }
        if self.success_threshold < 1 {
            return Err(SteadfastError::Config("breaker.success_threshold must be >= 1".into()));
        }
        if !(self.recovery_timeout_secs.is_finite() && self.recovery_timeout_secs > 0.0) {
            return Err(SteadfastError::Config(
                "breaker.recovery_timeout_secs must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            half_open_max_calls: 1,
            success_threshold: 2,
            transition_log_capacity: 256,
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,
    /// Upper bound on any delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    /// Growth factor per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Draw delays uniformly from `[d/2, d]`.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl BackoffConfig {
    /// # Errors
    /// Returns `SteadfastError::Config` for negative delays, a cap too large
    /// for a `Duration`, a base above the cap, or a multiplier below one.
    pub fn validate(&self) -> Result<()> {
        let finite_non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !finite_non_negative(self.base_delay_secs) || !finite_non_negative(self.max_delay_secs) {
            return Err(SteadfastError::Config("backoff delays must be non-negative numbers".into()));
        }
        if Duration::try_from_secs_f64(self.max_delay_secs).is_err() {
            return Err(SteadfastError::Config("backoff.max_delay_secs is out of range".into()));
        }
        if self.base_delay_secs > self.max_delay_secs {
            return Err(SteadfastError::Config(
                "backoff.base_delay_secs must not exceed backoff.max_delay_secs".into(),
            ));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(SteadfastError::Config("backoff.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Retry budget and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries per backend after the first attempt.
    #[serde(default = "default_3")]
    pub max_retries: u32,
    /// Timeout for each physical attempt, in seconds.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: f64,
    /// Cap on total elapsed time per logical call, in seconds.
    #[serde(default)]
    pub deadline_secs: Option<f64>,
}

impl RetryConfig {
    /// Attempt timeout as a `Duration`.
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.attempt_timeout_secs).unwrap_or(Duration::MAX)
    }

    /// Overall deadline as a `Duration`.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs
            .map(|s| Duration::try_from_secs_f64(s).unwrap_or(Duration::MAX))
    }

    /// # Errors
    /// Returns `SteadfastError::Config` for non-positive timeouts.
    pub fn validate(&self) -> Result<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.attempt_timeout_secs) {
            return Err(SteadfastError::Config(
                "retry.attempt_timeout_secs must be a positive number".into(),
            ));
        }
        if let Some(d) = self.deadline_secs {
            if !positive(d) {
                return Err(SteadfastError::Config(
                    "retry.deadline_secs must be a positive number".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout_secs: 30.0,
            deadline_secs: None,
        }
    }
}

/// Security gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Allow-list applied when a request does not bring its own.
    #[serde(default = "default_scopes")]
    pub default_allowed_scopes: Vec<String>,
    /// Escape markdown/meta characters unless the request says otherwise.
    #[serde(default)]
    pub sanitize: bool,
    /// Refuse inputs with injection patterns instead of only reporting them.
    #[serde(default)]
    pub block_on_injection: bool,
    /// Additional case-insensitive patterns to scan for.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            default_allowed_scopes: default_scopes(),
            sanitize: false,
            block_on_injection: false,
            extra_patterns: Vec::new(),
        }
    }
}

/// One backend entry in preference order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Provider identifier.
    pub provider: String,
    /// Model identifier.
    pub model: String,
}

/// Token prices used by the default cost estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Price entries; the longest matching `model_prefix` wins.
    #[serde(default = "default_prices")]
    pub models: Vec<ModelPrice>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            models: default_prices(),
        }
    }
}

/// USD price per 1K tokens for models matching a prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Model identifier prefix.
    pub model_prefix: String,
    /// USD per 1K prompt tokens.
    pub input_per_1k: f64,
    /// USD per 1K completion tokens.
    pub output_per_1k: f64,
}

impl ModelPrice {
    fn new(model_prefix: &str, input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            model_prefix: model_prefix.to_string(),
            input_per_1k,
            output_per_1k,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (required by serde)
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_1() -> u32 {
    1
}
fn default_2() -> u32 {
    2
}
fn default_3() -> u32 {
    3
}
fn default_5() -> u32 {
    5
}
fn default_256() -> usize {
    256
}
fn default_recovery_timeout() -> f64 {
    60.0
}
fn default_base_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    60.0
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_attempt_timeout() -> f64 {
    30.0
}
fn default_scopes() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_prices() -> Vec<ModelPrice> {
    vec![
        ModelPrice::new("gpt-4o-mini", 0.000_15, 0.000_6),
        ModelPrice::new("gpt-4o", 0.002_5, 0.01),
        ModelPrice::new("gpt-4", 0.03, 0.06),
        ModelPrice::new("gpt-3.5", 0.000_5, 0.001_5),
        ModelPrice::new("claude-3-5-haiku", 0.000_8, 0.004),
        ModelPrice::new("claude-3-5-sonnet", 0.003, 0.015),
        ModelPrice::new("claude-3-opus", 0.015, 0.075),
        ModelPrice::new("gemini-1.5-flash", 0.000_075, 0.000_3),
        ModelPrice::new("gemini-1.5-pro", 0.001_25, 0.005),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_backends(mut config: SteadfastConfig) -> SteadfastConfig {
        config.backends = vec![
            BackendConfig {
                provider: "openai".into(),
                model: "gpt-4o".into(),
            },
            BackendConfig {
                provider: "ollama".into(),
                model: "llama3.2".into(),
            },
        ];
        config
    }

    #[test]
    fn defaults_validate_once_backends_exist() {
        assert!(SteadfastConfig::default().validate().is_err());
        assert!(with_backends(SteadfastConfig::default()).validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let config = SteadfastConfig::from_toml(
            r#"
            [breaker]
            failure_threshold = 3
            recovery_timeout_secs = 5.0

            [backoff]
            jitter = false

            [[backends]]
            provider = "anthropic"
            model = "claude-3-5-haiku"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.success_threshold, 2);
        assert_eq!(config.breaker.recovery_timeout(), Duration::from_secs(5));
        assert!(!config.backoff.jitter);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.backend_list(), vec![Backend::new("anthropic", "claude-3-5-haiku")]);
        assert!(!config.pricing.models.is_empty());
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = with_backends(SteadfastConfig::default());
        config.breaker.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(SteadfastError::Config(_))));

        let mut config = with_backends(SteadfastConfig::default());
        config.breaker.recovery_timeout_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = with_backends(SteadfastConfig::default());
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = with_backends(SteadfastConfig::default());
        config.backoff.base_delay_secs = 120.0;
        assert!(config.validate().is_err());

        let mut config = with_backends(SteadfastConfig::default());
        config.backoff.max_delay_secs = 1e20;
        assert!(config.validate().is_err());

        let mut config = with_backends(SteadfastConfig::default());
        config.backends.push(config.backends[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("steadfast.toml");
        std::fs::write(
            &path,
            "[[backends]]\nprovider = \"ollama\"\nmodel = \"llama3.2\"\n",
        )
        .expect("write");
        let config = SteadfastConfig::from_file(&path).expect("load");
        assert_eq!(config.backends.len(), 1);

        let missing = SteadfastConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(SteadfastError::Io(_))));
    }
}

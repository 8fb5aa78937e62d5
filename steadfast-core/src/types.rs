//! Core types shared across the resilience layers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SteadfastError};

/// One callable (provider, model) destination.
///
/// Identity is the pair; the display form is `provider:model`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Backend {
    /// Provider identifier, e.g. `openai`, `anthropic`, `ollama`.
    pub provider: String,
    /// Model identifier passed to the provider, e.g. `gpt-4o-mini`.
    pub model: String,
}

impl Backend {
    /// Create a new backend.
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Successful response from one backend invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Generated text.
    pub text: String,
    /// Prompt tokens consumed.
    pub tokens_in: u32,
    /// Completion tokens produced.
    pub tokens_out: u32,
}

impl BackendResponse {
    /// Create a response.
    #[must_use]
    pub fn new(text: impl Into<String>, tokens_in: u32, tokens_out: u32) -> Self {
        Self {
            text: text.into(),
            tokens_in,
            tokens_out,
        }
    }
}

/// Outcome of one physical attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The backend returned a response.
    Success,
    /// The attempt failed or was rejected by the breaker.
    Failure,
}

/// One physical call attempt inside a logical call.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// Backend attempted.
    pub backend: Backend,
    /// 0-based attempt index on this backend.
    pub attempt_index: u32,
    /// Success or failure.
    pub outcome: AttemptOutcome,
    /// Wall time spent in the attempt.
    pub latency: Duration,
    /// Error message for failed attempts.
    pub error: Option<String>,
    /// Prompt tokens billed for this attempt.
    pub tokens_in: u32,
    /// Completion tokens billed for this attempt.
    pub tokens_out: u32,
    /// Estimated cost of this attempt in USD.
    pub cost_usd: f64,
}

/// A logical call request.
///
/// Build with [`CallRequest::new`] and the chained setters; fields left
/// unset fall back to the caller's configuration.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Prompt text.
    pub input: String,
    /// Preferred backend. `None` picks the chain's first available backend.
    pub preferred: Option<Backend>,
    /// Action scope requested by the caller.
    pub scope: Option<String>,
    /// Scopes the caller is permitted to use. `None` means configured default.
    pub allowed_scopes: Option<Vec<String>>,
    /// Retries per backend after the first attempt.
    pub max_retries: Option<u32>,
    /// Timeout for each physical attempt.
    pub timeout: Option<Duration>,
    /// Cap on total elapsed time across all retries and fallbacks.
    pub deadline: Option<Duration>,
    /// Whether to escape markdown/meta characters before sending.
    pub sanitize: Option<bool>,
}

impl CallRequest {
    /// Create a request for `input` with configured defaults.
    #[must_use]
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            preferred: None,
            scope: None,
            allowed_scopes: None,
            max_retries: None,
            timeout: None,
            deadline: None,
            sanitize: None,
        }
    }

    /// Set the preferred backend.
    #[must_use]
    pub fn preferred(mut self, backend: Backend) -> Self {
        self.preferred = Some(backend);
        self
    }

    /// Set the requested action scope.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the allow-list of scopes.
    #[must_use]
    pub fn allowed_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_scopes = Some(scopes.into_iter().map(Into::into).collect());
        self
    }

    /// Set the retry budget per backend.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the overall deadline.
    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Request sanitization of the input.
    #[must_use]
    pub fn sanitize(mut self, sanitize: bool) -> Self {
        self.sanitize = Some(sanitize);
        self
    }
}

/// Externally visible outcome of one logical call.
///
/// Always returned, never thrown: failures set `success = false` and
/// carry the last error.
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    /// Whether some backend produced output.
    pub success: bool,
    /// Generated text on success.
    pub output: Option<String>,
    /// Last error message on failure.
    pub error: Option<String>,
    /// Category of the last error on failure.
    pub error_kind: Option<ErrorKind>,
    /// Backend that produced the output.
    pub backend_used: Option<Backend>,
    /// Whether the output came from a backend other than the preferred one.
    pub fallback_occurred: bool,
    /// Backends tried, in order.
    pub attempted_backends: Vec<Backend>,
    /// Prompt tokens of the successful attempt.
    pub tokens_in: u32,
    /// Completion tokens of the successful attempt.
    pub tokens_out: u32,
    /// Estimated cost of the successful attempt in USD.
    pub cost_usd: f64,
    /// Latency of the successful attempt, or total elapsed time on failure.
    pub latency: Duration,
    /// 0-based index of the winning attempt on the winning backend.
    pub retry_attempt: u32,
    /// Number of physical attempts across all backends.
    pub total_attempts: u32,
    /// Whether the security gate found injection patterns.
    pub injection_detected: bool,
    /// Patterns that matched.
    pub detected_patterns: Vec<String>,
    /// Whether the input was escaped before sending.
    pub input_sanitized: bool,
}

impl CallResult {
    /// Failure result that never reached the network.
    #[must_use]
    pub fn rejected(error: &SteadfastError, latency: Duration) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            backend_used: None,
            fallback_occurred: false,
            attempted_backends: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            latency,
            retry_attempt: 0,
            total_attempts: 0,
            injection_detected: false,
            detected_patterns: Vec::new(),
            input_sanitized: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_display_and_identity() {
        let a = Backend::new("openai", "gpt-4o");
        assert_eq!(a.to_string(), "openai:gpt-4o");
        assert_eq!(a, Backend::new("openai", "gpt-4o"));
        assert_ne!(a, Backend::new("azure", "gpt-4o"));
    }

    #[test]
    fn request_builder_sets_fields() {
        let req = CallRequest::new("hello")
            .preferred(Backend::new("ollama", "llama3"))
            .scope("read:file")
            .allowed_scopes(["read:*"])
            .max_retries(2)
            .timeout(Duration::from_secs(3));
        assert_eq!(req.scope.as_deref(), Some("read:file"));
        assert_eq!(req.allowed_scopes, Some(vec!["read:*".to_string()]));
        assert_eq!(req.max_retries, Some(2));
        assert!(req.deadline.is_none());
    }

    #[test]
    fn rejected_result_serializes() {
        let err = SteadfastError::ScopeViolation {
            scope: "write:code".into(),
            allowed: vec!["read:*".into()],
        };
        let result = CallResult::rejected(&err, Duration::ZERO);
        let json = serde_json::to_string(&result).expect("serialize");
        assert!(json.contains("\"error_kind\":\"scope_violation\""));
        assert!(!result.success);
    }
}

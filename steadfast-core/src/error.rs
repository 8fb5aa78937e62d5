//! Error types for the Steadfast core.
//!
//! Two layers:
//!   - [`BackendError`] — what a single backend invocation reports.
//!   - [`SteadfastError`] — what the resilience machinery reasons about,
//!     carrying the backend a failure belongs to.
//!
//! Classification drives every branch of the retry/failover loop, so it
//! lives here rather than being re-derived at each call site.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failure returned by a [`BackendInvoker`](crate::BackendInvoker).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend throttled the request.
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
    RateLimited {
        /// Server-provided hint for when to try again.
        retry_after: Option<Duration>,
    },

    /// The request did not complete within its timeout.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Network-level failure or transient server error.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The request itself is malformed; every backend would reject it.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The backend refused to process the request (auth, quota, refusal).
    #[error("backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    /// Whether retrying the same backend may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Connection(_)
        )
    }
}

/// Coarse, serializable failure category reported in [`CallResult`](crate::CallResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Breaker rejected the call.
    CircuitOpen,
    /// Too many concurrent recovery probes.
    HalfOpenSaturated,
    /// Requested action is outside the allowed scopes.
    ScopeViolation,
    /// Input matched injection patterns and blocking is enabled.
    InjectionBlocked,
    /// Rate limit, timeout or connection failure.
    Retryable,
    /// Backend refused to process the request.
    Fatal,
    /// Malformed request.
    InvalidRequest,
    /// Caller deadline elapsed.
    DeadlineExceeded,
    /// Programmer or configuration error.
    Configuration,
}

/// Top-level error type for all Steadfast operations.
#[derive(Debug, Clone, Error)]
pub enum SteadfastError {
    /// The backend's breaker is OPEN and its recovery timeout has not elapsed.
    #[error("circuit open for {backend}: {failure_count} failures, retry in {}ms", .retry_after.as_millis())]
    CircuitOpen {
        /// Backend whose breaker rejected the call.
        backend: String,
        /// Remaining time until the breaker admits a recovery probe.
        retry_after: Duration,
        /// Failure count at the time of rejection.
        failure_count: u32,
    },

    /// The breaker is HALF_OPEN and already has the maximum probes in flight.
    #[error("circuit half-open for {backend}: {in_flight}/{max} recovery probes in flight")]
    HalfOpenSaturated {
        /// Backend whose breaker rejected the call.
        backend: String,
        /// Probes currently in flight.
        in_flight: u32,
        /// Configured probe limit.
        max: u32,
    },

    /// The requested action scope is not on the allow-list.
    #[error("scope '{scope}' not permitted (allowed: {})", .allowed.join(", "))]
    ScopeViolation {
        /// Requested scope.
        scope: String,
        /// Allow-list in effect.
        allowed: Vec<String>,
    },

    /// Injection patterns found while the gate is configured to block.
    #[error("input blocked: injection patterns detected ({})", .patterns.join(", "))]
    InjectionBlocked {
        /// Patterns that matched.
        patterns: Vec<String>,
    },

    /// Transient backend failure: rate limit, timeout or connection error.
    #[error("{backend}: {source}")]
    RetryableBackend {
        /// Backend that failed.
        backend: String,
        /// Underlying failure.
        #[source]
        source: BackendError,
    },

    /// Non-transient backend failure, still the backend's fault.
    #[error("{backend}: {source}")]
    FatalBackend {
        /// Backend that failed.
        backend: String,
        /// Underlying failure.
        #[source]
        source: BackendError,
    },

    /// Malformed request; a client error rather than a service failure.
    #[error("{backend}: invalid request: {reason}")]
    InvalidRequest {
        /// Backend that rejected the request.
        backend: String,
        /// Rejection reason.
        reason: String,
    },

    /// The caller's overall deadline was spent.
    #[error("deadline exceeded after {}ms", .elapsed.as_millis())]
    DeadlineExceeded {
        /// Time spent before giving up.
        elapsed: Duration,
    },

    /// A backend was referenced that is not part of the chain.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O failure while loading configuration.
    #[error("I/O error: {0}")]
    Io(String),
}

impl SteadfastError {
    /// Attribute a backend failure to `backend`, picking the taxonomy variant.
    #[must_use]
    pub fn from_backend(backend: impl Into<String>, error: BackendError) -> Self {
        let backend = backend.into();
        match error {
            BackendError::InvalidRequest(reason) => Self::InvalidRequest { backend, reason },
            e if e.is_retryable() => Self::RetryableBackend { backend, source: e },
            e => Self::FatalBackend { backend, source: e },
        }
    }

    /// Whether the same backend should be tried again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableBackend { .. })
    }

    /// Whether this failure is the backend's fault and should move its breaker.
    ///
    /// Client errors and local rejections leave breaker state untouched.
    #[must_use]
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            Self::RetryableBackend { .. } | Self::FatalBackend { .. }
        )
    }

    /// Whether the failover loop must stop instead of trying the next backend.
    #[must_use]
    pub fn aborts_chain(&self) -> bool {
        matches!(
            self,
            Self::ScopeViolation { .. }
                | Self::InjectionBlocked { .. }
                | Self::InvalidRequest { .. }
                | Self::DeadlineExceeded { .. }
                | Self::Config(_)
                | Self::Io(_)
        )
    }

    /// Whether this is a breaker rejection rather than an attempt.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::HalfOpenSaturated { .. }
        )
    }

    /// Serializable category for reporting.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::HalfOpenSaturated { .. } => ErrorKind::HalfOpenSaturated,
            Self::ScopeViolation { .. } => ErrorKind::ScopeViolation,
            Self::InjectionBlocked { .. } => ErrorKind::InjectionBlocked,
            Self::RetryableBackend { .. } => ErrorKind::Retryable,
            Self::FatalBackend { .. } => ErrorKind::Fatal,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::UnknownBackend(_) | Self::Config(_) | Self::Io(_) => ErrorKind::Configuration,
        }
    }

    /// Rate-limit hint carried by the failure, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RetryableBackend {
                source: BackendError::RateLimited { retry_after },
                ..
            } => *retry_after,
            _ => None,
        }
    }
}

impl From<std::io::Error> for SteadfastError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, SteadfastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_onto_taxonomy() {
        let e = SteadfastError::from_backend("openai:gpt-4o", BackendError::Timeout(Duration::from_secs(1)));
        assert!(e.is_retryable());
        assert!(e.counts_against_breaker());
        assert!(!e.aborts_chain());

        let e = SteadfastError::from_backend("openai:gpt-4o", BackendError::Fatal("401".into()));
        assert!(!e.is_retryable());
        assert!(e.counts_against_breaker());
        assert!(!e.aborts_chain());
        assert_eq!(e.kind(), ErrorKind::Fatal);

        let e = SteadfastError::from_backend("openai:gpt-4o", BackendError::InvalidRequest("bad".into()));
        assert!(!e.is_retryable());
        assert!(!e.counts_against_breaker());
        assert!(e.aborts_chain());
    }

    #[test]
    fn scope_violation_is_client_side() {
        let e = SteadfastError::ScopeViolation {
            scope: "write:code".into(),
            allowed: vec!["read:*".into()],
        };
        assert!(!e.counts_against_breaker());
        assert!(e.aborts_chain());
        assert!(e.to_string().contains("write:code"));
    }

    #[test]
    fn rate_limit_hint_is_exposed() {
        let e = SteadfastError::from_backend(
            "anthropic:claude",
            BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
            },
        );
        assert_eq!(e.retry_after(), Some(Duration::from_secs(7)));
        assert!(e.to_string().contains("7000ms"));
    }
}

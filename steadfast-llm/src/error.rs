//! Provider error types and HTTP status classification.

use std::time::Duration;

use reqwest::StatusCode;
use steadfast_core::BackendError;
use thiserror::Error;

/// Longest body excerpt kept in error messages.
const BODY_EXCERPT: usize = 256;

/// Errors from one HTTP provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The request did not finish in time.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Could not reach the server, or the connection broke mid-request.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Response status.
        status: StatusCode,
        /// Body excerpt.
        body: String,
        /// Parsed `Retry-After` header.
        retry_after: Option<Duration>,
        /// Timeout the request ran under.
        timeout: Duration,
    },

    /// The response body was not the expected JSON.
    #[error("failed to parse provider response: {0}")]
    Decode(String),

    /// No API key was configured for a provider that needs one.
    #[error("no API key for {provider} (set {env})")]
    MissingApiKey {
        /// Provider id.
        provider: String,
        /// Environment variable that was consulted.
        env: String,
    },
}

impl ProviderError {
    /// Map a transport error, given the timeout the request ran under.
    #[must_use]
    pub fn transport(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

impl From<ProviderError> for BackendError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout(d) => BackendError::Timeout(d),
            ProviderError::Unavailable(msg) => BackendError::Connection(msg),
            ProviderError::Status {
                status,
                body,
                retry_after,
                timeout,
            } => classify_status(status, retry_after, timeout, &body),
            // A 2xx with garbage in it is the backend's fault, and repeating
            // the same request is unlikely to help.
            e @ (ProviderError::Decode(_) | ProviderError::MissingApiKey { .. }) => {
                BackendError::Fatal(e.to_string())
            }
        }
    }
}

/// Classify a non-success HTTP status. `timeout` is what the request ran
/// under and is reported for gateway timeouts.
#[must_use]
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    timeout: Duration,
    body: &str,
) -> BackendError {
    let detail = format!("HTTP {}: {}", status.as_u16(), excerpt(body));
    match status.as_u16() {
        429 => BackendError::RateLimited { retry_after },
        408 | 504 => BackendError::Timeout(timeout),
        // 529: Anthropic "overloaded".
        529 => BackendError::Connection(detail),
        400 | 404 | 413 | 422 => BackendError::InvalidRequest(detail),
        s if (500..600).contains(&s) => BackendError::Connection(detail),
        _ => BackendError::Fatal(detail),
    }
}

/// Parse a `Retry-After` value given in seconds.
///
/// HTTP-date values are not supported and yield `None`.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

fn excerpt(body: &str) -> &str {
    let body = body.trim();
    match body.char_indices().nth(BODY_EXCERPT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn classify(code: u16) -> BackendError {
        classify_status(StatusCode::from_u16(code).expect("valid status"), None, TIMEOUT, "")
    }

    #[test]
    fn status_classes() {
        assert!(matches!(classify(429), BackendError::RateLimited { .. }));
        assert!(matches!(classify(408), BackendError::Timeout(_)));
        assert!(matches!(classify(504), BackendError::Timeout(_)));
        assert!(matches!(classify(500), BackendError::Connection(_)));
        assert!(matches!(classify(503), BackendError::Connection(_)));
        assert!(matches!(classify(529), BackendError::Connection(_)));
        assert!(matches!(classify(400), BackendError::InvalidRequest(_)));
        assert!(matches!(classify(422), BackendError::InvalidRequest(_)));
        assert!(matches!(classify(401), BackendError::Fatal(_)));
        assert!(matches!(classify(403), BackendError::Fatal(_)));
        assert!(matches!(classify(418), BackendError::Fatal(_)));
    }

    #[test]
    fn retry_after_is_carried_on_rate_limits() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, parse_retry_after("12"), TIMEOUT, "slow down");
        assert_eq!(
            err,
            BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
    }

    #[test]
    fn gateway_timeouts_report_the_request_timeout() {
        assert_eq!(classify(504), BackendError::Timeout(TIMEOUT));
        let err: BackendError = ProviderError::Status {
            status: StatusCode::REQUEST_TIMEOUT,
            body: String::new(),
            retry_after: None,
            timeout: Duration::from_secs(7),
        }
        .into();
        assert_eq!(err, BackendError::Timeout(Duration::from_secs(7)));
        assert_ne!(err.to_string(), BackendError::Timeout(Duration::ZERO).to_string());
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("0.5"), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(10_000);
        match classify_status(StatusCode::BAD_REQUEST, None, TIMEOUT, &body) {
            BackendError::InvalidRequest(msg) => assert!(msg.len() < 300),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn provider_errors_map_to_backend_errors() {
        let timeout: BackendError = ProviderError::Timeout(Duration::from_secs(5)).into();
        assert_eq!(timeout, BackendError::Timeout(Duration::from_secs(5)));
        let decode: BackendError = ProviderError::Decode("eof".into()).into();
        assert!(matches!(decode, BackendError::Fatal(_)));
        let down: BackendError = ProviderError::Unavailable("refused".into()).into();
        assert!(down.is_retryable());
    }
}

//! Property-Based Tests for Steadfast Core
//!
//! Uses `proptest` to check the backoff bounds, breaker thresholds and the
//! scope/sanitization rules under random inputs.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use steadfast_core::config::BreakerConfig;
use steadfast_core::error::BackendError;
use steadfast_core::security::{check_scope, sanitize_input};
use steadfast_core::{
    Backend, BackoffPolicy, CircuitBreaker, CircuitState, ManualClock, SteadfastError,
};

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn delay_never_exceeds_cap(
        base in 0.0..10.0f64,
        max in 0.0..120.0f64,
        multiplier in 1.0..4.0f64,
        attempt in 0u32..200,
        jitter in any::<bool>(),
    ) {
        let policy = BackoffPolicy::new(
            Duration::from_secs_f64(base),
            Duration::from_secs_f64(max),
            multiplier,
            jitter,
        );
        prop_assert!(policy.delay(attempt) <= policy.max_delay());
    }

    #[test]
    fn undithered_delay_is_monotonic(
        base in 0.001..5.0f64,
        max in 0.0..300.0f64,
        multiplier in 1.0..3.0f64,
        attempt in 0u32..64,
    ) {
        let policy = BackoffPolicy::new(
            Duration::from_secs_f64(base),
            Duration::from_secs_f64(max),
            multiplier,
            false,
        );
        prop_assert!(policy.delay(attempt) <= policy.delay(attempt + 1));
    }

    #[test]
    fn jitter_stays_within_half_of_capped(
        base in 0.01..5.0f64,
        attempt in 0u32..10,
    ) {
        let policy = BackoffPolicy::new(
            Duration::from_secs_f64(base),
            Duration::from_secs(60),
            2.0,
            true,
        );
        let capped = policy.capped_secs(attempt);
        let secs = policy.delay(attempt).as_secs_f64();
        prop_assert!(secs >= capped / 2.0 - 1e-6);
        prop_assert!(secs <= capped + 1e-6);
    }
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

fn outage() -> SteadfastError {
    SteadfastError::from_backend("p:m", BackendError::Connection("refused".into()))
}

proptest! {
    #[test]
    fn opens_exactly_at_threshold(threshold in 1u32..20) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let config = BreakerConfig {
                failure_threshold: threshold,
                ..BreakerConfig::default()
            };
            let cb = CircuitBreaker::new(Backend::new("p", "m"), config, Arc::new(ManualClock::new()))
                .expect("valid config");
            for i in 1..=threshold {
                let _: Result<(), _> = cb.call(|| async { Err(outage()) }).await;
                let expected = if i < threshold { CircuitState::Closed } else { CircuitState::Open };
                assert_eq!(cb.state(), expected);
            }
            assert!(matches!(
                cb.call(|| async { Ok(()) }).await,
                Err(SteadfastError::CircuitOpen { .. })
            ));
        });
    }

    #[test]
    fn successes_decay_failure_count(failures in 0u32..5, successes in 0u32..8) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let config = BreakerConfig {
                failure_threshold: 5,
                ..BreakerConfig::default()
            };
            let cb = CircuitBreaker::new(Backend::new("p", "m"), config, Arc::new(ManualClock::new()))
                .expect("valid config");
            for _ in 0..failures {
                let _: Result<(), _> = cb.call(|| async { Err(outage()) }).await;
            }
            for _ in 0..successes {
                cb.call(|| async { Ok(()) }).await.expect("closed");
            }
            assert_eq!(cb.failure_count(), failures.saturating_sub(successes));
            assert_eq!(cb.state(), CircuitState::Closed);
            assert_eq!(cb.metrics().total_calls, u64::from(failures + successes));
        });
    }
}

// ---------------------------------------------------------------------------
// Security rules
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn wildcard_permits_everything(scope in "[a-z:]{0,24}") {
        prop_assert!(check_scope(&scope, &["*".to_string()]).is_ok());
    }

    #[test]
    fn prefix_entries_permit_their_namespace(ns in "[a-z]{1,8}", action in "[a-z]{0,8}") {
        let allowed = vec![format!("{ns}:*")];
        let scope = format!("{ns}:{action}");
        prop_assert!(check_scope(&scope, &allowed).is_ok());
    }

    #[test]
    fn sanitized_text_has_no_bare_backticks(input in ".{0,64}") {
        let out = sanitize_input(&input);
        let chars: Vec<char> = out.chars().collect();
        for (i, c) in chars.iter().enumerate() {
            if *c == '`' {
                prop_assert!(i > 0 && chars[i - 1] == '\\');
            }
        }
        prop_assert!(out.chars().count() >= input.chars().count());
    }
}

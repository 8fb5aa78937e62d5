//! Exponential Backoff
//!
//! Delay before retry `n` (0-indexed):
//!   d = min(max, base × multiplier^n)
//!
//! With jitter the delay is drawn uniformly from `[d/2, d]`, which keeps
//! concurrent callers from retrying in lockstep while never exceeding `d`.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Immutable delay policy. Cheap to copy, safe to share across tasks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base_delay_secs: f64,
    max_delay_secs: f64,
    multiplier: f64,
    jitter: bool,
}

impl BackoffPolicy {
    /// Create a policy. Negative or non-finite inputs are clamped to zero,
    /// a multiplier below one is treated as one.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64, jitter: bool) -> Self {
        Self::from_secs(
            base_delay.as_secs_f64(),
            max_delay.as_secs_f64(),
            multiplier,
            jitter,
        )
    }

    /// Build from validated configuration.
    #[must_use]
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::from_secs(
            config.base_delay_secs,
            config.max_delay_secs,
            config.multiplier,
            config.jitter,
        )
    }

    fn from_secs(base: f64, max: f64, multiplier: f64, jitter: bool) -> Self {
        let sane = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
        Self {
            base_delay_secs: sane(base),
            max_delay_secs: sane(max),
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            jitter,
        }
    }

    /// Same policy with jitter switched on or off.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether delays are randomised.
    #[must_use]
    pub fn jitter_enabled(&self) -> bool {
        self.jitter
    }

    /// Upper bound on any delay this policy returns.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        to_duration(self.max_delay_secs)
    }

    /// Un-jittered delay for `attempt`, in seconds.
    #[must_use]
    pub fn capped_secs(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_secs * self.multiplier.powi(exponent);
        if raw.is_finite() {
            raw.clamp(0.0, self.max_delay_secs)
        } else {
            self.max_delay_secs
        }
    }

    /// Delay to wait before retry `attempt` (0-indexed).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_secs(attempt);
        let secs = if self.jitter && capped > 0.0 {
            rand::thread_rng().gen_range(capped / 2.0..=capped)
        } else {
            capped
        };
        to_duration(secs.clamp(0.0, self.max_delay_secs))
    }
}

/// Seconds to `Duration`, saturating at `Duration::MAX`.
fn to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10), 2.0, jitter)
    }

    #[test]
    fn grows_exponentially_until_capped() {
        let p = policy(false);
        assert_eq!(p.delay(0), Duration::from_secs(1));
        assert_eq!(p.delay(1), Duration::from_secs(2));
        assert_eq!(p.delay(2), Duration::from_secs(4));
        assert_eq!(p.delay(3), Duration::from_secs(8));
        assert_eq!(p.delay(4), Duration::from_secs(10));
        assert_eq!(p.delay(500), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let p = policy(true);
        for attempt in 0..8 {
            let full = p.capped_secs(attempt);
            for _ in 0..50 {
                let d = p.delay(attempt).as_secs_f64();
                assert!(d >= full / 2.0 - 1e-9, "attempt {attempt}: {d} < {}", full / 2.0);
                assert!(d <= full + 1e-9);
            }
        }
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let p = BackoffPolicy::new(Duration::ZERO, Duration::from_secs(5), 10.0, false);
        assert_eq!(p.delay(u32::MAX), Duration::ZERO);
        let p = BackoffPolicy::new(Duration::from_millis(1), Duration::from_secs(5), 10.0, true);
        assert!(p.delay(u32::MAX) <= Duration::from_secs(5));
    }

    #[test]
    fn caps_beyond_duration_range_saturate() {
        let p = BackoffPolicy::new(Duration::from_secs(1), Duration::MAX, 2.0, false);
        assert_eq!(p.delay(80), Duration::MAX);
        assert_eq!(p.max_delay(), Duration::MAX);
        assert_eq!(p.delay(3), Duration::from_secs(8));

        let p = BackoffPolicy::from_secs(1.0, 1e20, 2.0, true);
        assert_eq!(p.max_delay(), Duration::MAX);
        assert!(p.delay(100) >= Duration::from_secs(1));
    }

    #[test]
    fn nonsense_inputs_are_clamped() {
        let p = BackoffPolicy::from_secs(-1.0, f64::NAN, 0.1, false);
        assert_eq!(p.delay(3), Duration::ZERO);
    }
}

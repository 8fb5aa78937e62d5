//! Time source abstraction.
//!
//! Breakers compare monotonic instants for recovery timeouts and stamp
//! transition logs with wall-clock time. Tests drive both through
//! [`ManualClock`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Wall-clock now.
    fn wall(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualInner>>,
}

struct ManualInner {
    base: Instant,
    base_wall: DateTime<Utc>,
    offset: Duration,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualInner {
                base: Instant::now(),
                base_wall: Utc::now(),
                offset: Duration::ZERO,
            })),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.inner.lock().offset += by;
    }

    /// Total time advanced since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().offset
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let inner = self.inner.lock();
        inner.base + inner.offset
    }

    fn wall(&self) -> DateTime<Utc> {
        let inner = self.inner.lock();
        chrono::Duration::from_std(inner.offset)
            .ok()
            .and_then(|d| inner.base_wall.checked_add_signed(d))
            .unwrap_or(inner.base_wall)
    }
}

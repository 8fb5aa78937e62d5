//! # Steadfast Core
//!
//! Client-side reliability layer for calling interchangeable remote
//! text-generation backends. A logical call flows through:
//!
//! ```text
//! SecurityGate ──► FallbackChain ──► CircuitBreaker ──► BackendInvoker
//!      │                 │                  ▲
//!      │                 └── BackoffPolicy ─┘  (retries on the same backend)
//!      └── scope violations never reach the network
//! ```
//!
//! - **Backoff** — capped exponential delay with optional jitter.
//! - **Circuit breaker** — per-backend CLOSED / OPEN / HALF_OPEN gate.
//! - **Security gate** — scope allow-list and prompt-injection scan.
//! - **Fallback chain** — ordered failover across backends.
//! - **Resilient caller** — composition root returning a [`CallResult`]
//!   for every logical call, successful or not.
//!
//! The crate performs no I/O of its own: transports plug in through
//! [`BackendInvoker`], pricing through [`CostEstimator`], and time through
//! [`Clock`].

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod breaker;
pub mod caller;
pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod invoker;
pub mod metrics;
pub mod security;
pub mod types;

pub use backoff::BackoffPolicy;
pub use breaker::{BreakerStatus, CircuitBreaker, CircuitMetrics, CircuitState};
pub use caller::{ResilientCaller, ResilientCallerBuilder};
pub use chain::{FallbackChain, FallbackOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SteadfastConfig;
pub use error::{BackendError, SteadfastError};
pub use invoker::{BackendInvoker, BoxFuture, CostEstimator, PricingTable, ProviderRouter, ZeroCost};
pub use metrics::MetricsSnapshot;
pub use security::{GateVerdict, SecurityGate};
pub use types::*;

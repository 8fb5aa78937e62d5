//! # steadfast-llm — HTTP Backends for Steadfast
//!
//! Concrete [`BackendInvoker`](steadfast_core::BackendInvoker)s for:
//!   - **Ollama** (local, `/api/generate`)
//!   - **OpenAI-compatible APIs** (`/v1/chat/completions`)
//!   - **Anthropic** (`/v1/messages`)
//!
//! Each backend performs exactly one HTTP request per invocation. Retries,
//! breakers and failover belong to `steadfast-core`; this crate only turns
//! HTTP outcomes into [`BackendError`](steadfast_core::BackendError)s the
//! core can classify.
//!
//! ```text
//! 2xx           → BackendResponse (text + token usage)
//! 429           → RateLimited (Retry-After honoured)
//! 408, 504      → Timeout
//! 5xx, 529      → Connection
//! 400/404/413/422 → InvalidRequest
//! other 4xx     → Fatal
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod types;

pub use client::{AnthropicBackend, OllamaBackend, OpenAiBackend, providers_from_config};
pub use config::{GenerationOptions, HttpProvidersConfig};
pub use error::{classify_status, parse_retry_after};

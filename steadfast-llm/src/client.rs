//! HTTP backends — one request per invocation, errors classified for the core.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use steadfast_core::{
    Backend, BackendError, BackendInvoker, BackendResponse, BoxFuture, ProviderRouter,
    SteadfastError,
};
use tracing::{debug, warn};

use crate::config::{GenerationOptions, HttpProvidersConfig, resolve_api_key};
use crate::error::{ProviderError, parse_retry_after};
use crate::types::{
    ChatCompletionRequest, ChatCompletionResponse, MessagesRequest, MessagesResponse,
    OllamaGenerateRequest, OllamaGenerateResponse,
};

/// Provider id for [`OllamaBackend`].
pub const OLLAMA: &str = "ollama";
/// Provider id for [`OpenAiBackend`].
pub const OPENAI: &str = "openai";
/// Provider id for [`AnthropicBackend`].
pub const ANTHROPIC: &str = "anthropic";

/// Send `body` as JSON and decode a JSON reply, classifying failures.
async fn send_json<B, R>(
    request: RequestBuilder,
    body: &B,
    timeout: Duration,
) -> Result<R, ProviderError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let resp = request
        .json(body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ProviderError::transport(&e, timeout))?;

    let status = resp.status();
    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Status {
            status,
            body,
            retry_after,
            timeout,
        });
    }

    resp.json::<R>()
        .await
        .map_err(|e| ProviderError::transport(&e, timeout))
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Log the outcome of one request and convert its error.
fn finish(
    provider: &str,
    model: &str,
    start: Instant,
    result: Result<BackendResponse, ProviderError>,
) -> Result<BackendResponse, BackendError> {
    let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    match result {
        Ok(response) => {
            debug!(provider, model, latency_ms, tokens_out = response.tokens_out, "Provider call succeeded");
            Ok(response)
        }
        Err(e) => {
            warn!(provider, model, latency_ms, error = %e, "Provider call failed");
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

/// Local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    http: Client,
    base_url: String,
    options: GenerationOptions,
}

impl OllamaBackend {
    /// Backend for the server at `base_url`.
    #[must_use]
    pub fn new(base_url: impl AsRef<str>, options: GenerationOptions) -> Self {
        Self {
            http: Client::new(),
            base_url: trim_base(base_url.as_ref()),
            options,
        }
    }

    /// Generate a completion for `input` with `model`.
    ///
    /// # Errors
    /// A classified [`BackendError`].
    pub async fn generate(&self, model: &str, input: &str, timeout: Duration) -> Result<BackendResponse, BackendError> {
        let start = Instant::now();
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest::new(model, input, &self.options);
        let result = send_json::<_, OllamaGenerateResponse>(self.http.post(&url), &body, timeout)
            .await
            .map(BackendResponse::from);
        finish(OLLAMA, model, start, result)
    }
}

impl BackendInvoker for OllamaBackend {
    fn invoke<'a>(
        &'a self,
        backend: &'a Backend,
        input: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<BackendResponse, BackendError>> {
        Box::pin(self.generate(&backend.model, input, timeout))
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible
// ---------------------------------------------------------------------------

/// OpenAI, or any API speaking the chat-completions dialect.
#[derive(Clone)]
pub struct OpenAiBackend {
    http: Client,
    base_url: String,
    api_key: String,
    options: GenerationOptions,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl OpenAiBackend {
    /// Backend for the API at `base_url` (without `/v1`).
    #[must_use]
    pub fn new(base_url: impl AsRef<str>, api_key: impl Into<String>, options: GenerationOptions) -> Self {
        Self {
            http: Client::new(),
            base_url: trim_base(base_url.as_ref()),
            api_key: api_key.into(),
            options,
        }
    }

    /// Generate a completion for `input` with `model`.
    ///
    /// # Errors
    /// A classified [`BackendError`].
    pub async fn generate(&self, model: &str, input: &str, timeout: Duration) -> Result<BackendResponse, BackendError> {
        let start = Instant::now();
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatCompletionRequest::new(model, input, &self.options);
        let request = self.http.post(&url).bearer_auth(&self.api_key);
        let result = send_json::<_, ChatCompletionResponse>(request, &body, timeout)
            .await
            .map(BackendResponse::from);
        finish(OPENAI, model, start, result)
    }
}

impl BackendInvoker for OpenAiBackend {
    fn invoke<'a>(
        &'a self,
        backend: &'a Backend,
        input: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<BackendResponse, BackendError>> {
        Box::pin(self.generate(&backend.model, input, timeout))
    }
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

/// Anthropic messages API.
#[derive(Clone)]
pub struct AnthropicBackend {
    http: Client,
    base_url: String,
    api_key: String,
    api_version: String,
    options: GenerationOptions,
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBackend")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AnthropicBackend {
    /// Backend for the API at `base_url` (without `/v1`).
    #[must_use]
    pub fn new(
        base_url: impl AsRef<str>,
        api_key: impl Into<String>,
        api_version: impl Into<String>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: trim_base(base_url.as_ref()),
            api_key: api_key.into(),
            api_version: api_version.into(),
            options,
        }
    }

    /// Generate a completion for `input` with `model`.
    ///
    /// # Errors
    /// A classified [`BackendError`].
    pub async fn generate(&self, model: &str, input: &str, timeout: Duration) -> Result<BackendResponse, BackendError> {
        let start = Instant::now();
        let url = format!("{}/v1/messages", self.base_url);
        let body = MessagesRequest::new(model, input, &self.options);
        let request = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version);
        let result = send_json::<_, MessagesResponse>(request, &body, timeout)
            .await
            .map(BackendResponse::from);
        finish(ANTHROPIC, model, start, result)
    }
}

impl BackendInvoker for AnthropicBackend {
    fn invoke<'a>(
        &'a self,
        backend: &'a Backend,
        input: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<BackendResponse, BackendError>> {
        Box::pin(self.generate(&backend.model, input, timeout))
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Build a router with one backend per configured provider section.
///
/// # Errors
/// `Config` when a provider that needs an API key has none.
pub fn providers_from_config(config: &HttpProvidersConfig) -> Result<ProviderRouter, SteadfastError> {
    let options = &config.generation;
    let mut router = ProviderRouter::new();

    if let Some(ollama) = &config.ollama {
        router = router.with_provider(
            OLLAMA,
            Arc::new(OllamaBackend::new(&ollama.base_url, options.clone())),
        );
    }
    if let Some(openai) = &config.openai {
        let key = resolve_api_key(OPENAI, openai.api_key.as_ref(), &openai.api_key_env)
            .map_err(|e| SteadfastError::Config(e.to_string()))?;
        router = router.with_provider(
            OPENAI,
            Arc::new(OpenAiBackend::new(&openai.base_url, key, options.clone())),
        );
    }
    if let Some(anthropic) = &config.anthropic {
        let key = resolve_api_key(ANTHROPIC, anthropic.api_key.as_ref(), &anthropic.api_key_env)
            .map_err(|e| SteadfastError::Config(e.to_string()))?;
        router = router.with_provider(
            ANTHROPIC,
            Arc::new(AnthropicBackend::new(
                &anthropic.base_url,
                key,
                &anthropic.api_version,
                options.clone(),
            )),
        );
    }

    debug!(providers = ?router.providers(), "HTTP providers registered");
    Ok(router)
}

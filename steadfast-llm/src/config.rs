//! HTTP provider configuration.
//!
//! ```toml
//! [generation]
//! max_tokens = 512
//!
//! [ollama]
//! base_url = "http://localhost:11434"
//!
//! [openai]
//! api_key_env = "OPENAI_API_KEY"
//! ```
//!
//! Providers without a section are not registered. API keys are read from
//! the named environment variable unless given inline.

use serde::{Deserialize, Serialize};
use steadfast_core::SteadfastError;

use crate::error::ProviderError;

/// Which providers to register, and how to reach them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpProvidersConfig {
    /// Sampling settings shared by every provider.
    #[serde(default)]
    pub generation: GenerationOptions,

    /// Local Ollama server.
    #[serde(default)]
    pub ollama: Option<OllamaConfig>,

    /// OpenAI or any API speaking its chat-completions dialect.
    #[serde(default)]
    pub openai: Option<OpenAiConfig>,

    /// Anthropic messages API.
    #[serde(default)]
    pub anthropic: Option<AnthropicConfig>,
}

impl HttpProvidersConfig {
    /// Parse from a TOML string.
    ///
    /// # Errors
    /// `Config` if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self, SteadfastError> {
        toml::from_str(toml_str).map_err(|e| SteadfastError::Config(e.to_string()))
    }
}

/// Sampling settings sent with every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Optional system prompt.
    #[serde(default)]
    pub system: Option<String>,

    /// Completion token cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature; provider default when unset.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            system: None,
            max_tokens: default_max_tokens(),
            temperature: None,
        }
    }
}

/// Ollama settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Server root.
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
        }
    }
}

/// OpenAI-compatible settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// API root (without `/v1`).
    #[serde(default = "default_openai_url")]
    pub base_url: String,

    /// Inline key; takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the key.
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_url(),
            api_key: None,
            api_key_env: default_openai_key_env(),
        }
    }
}

/// Anthropic settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    /// API root (without `/v1`).
    #[serde(default = "default_anthropic_url")]
    pub base_url: String,

    /// Inline key; takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the key.
    #[serde(default = "default_anthropic_key_env")]
    pub api_key_env: String,

    /// Value of the `anthropic-version` header.
    #[serde(default = "default_anthropic_version")]
    pub api_version: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: default_anthropic_url(),
            api_key: None,
            api_key_env: default_anthropic_key_env(),
            api_version: default_anthropic_version(),
        }
    }
}

/// Inline key, else the environment variable.
pub(crate) fn resolve_api_key(
    provider: &str,
    inline: Option<&String>,
    env: &str,
) -> Result<String, ProviderError> {
    inline
        .cloned()
        .or_else(|| std::env::var(env).ok())
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ProviderError::MissingApiKey {
            provider: provider.to_string(),
            env: env.to_string(),
        })
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

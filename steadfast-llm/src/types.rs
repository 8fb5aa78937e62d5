//! Wire types for the supported provider APIs.
//!
//! Only the fields the backends read or write are modelled; unknown
//! response fields are ignored.

use serde::{Deserialize, Serialize};
use steadfast_core::BackendResponse;

use crate::config::GenerationOptions;

// ---------------------------------------------------------------------------
// Ollama — POST /api/generate
// ---------------------------------------------------------------------------

/// Ollama generate request.
#[derive(Debug, Clone, Serialize)]
pub struct OllamaGenerateRequest<'a> {
    /// Model tag.
    pub model: &'a str,
    /// Prompt text.
    pub prompt: &'a str,
    /// System prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    /// Always false; responses are read whole.
    pub stream: bool,
    /// Sampling options.
    pub options: OllamaOptions,
}

/// Ollama sampling options.
#[derive(Debug, Clone, Serialize)]
pub struct OllamaOptions {
    /// Completion token cap.
    pub num_predict: u32,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl<'a> OllamaGenerateRequest<'a> {
    /// Request for `prompt` against `model`.
    #[must_use]
    pub fn new(model: &'a str, prompt: &'a str, options: &'a GenerationOptions) -> Self {
        Self {
            model,
            prompt,
            system: options.system.as_deref(),
            stream: false,
            options: OllamaOptions {
                num_predict: options.max_tokens,
                temperature: options.temperature,
            },
        }
    }
}

/// Ollama generate response.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaGenerateResponse {
    /// Generated text.
    #[serde(default)]
    pub response: String,
    /// Prompt tokens evaluated.
    #[serde(default)]
    pub prompt_eval_count: u32,
    /// Completion tokens generated.
    #[serde(default)]
    pub eval_count: u32,
}

impl From<OllamaGenerateResponse> for BackendResponse {
    fn from(r: OllamaGenerateResponse) -> Self {
        BackendResponse::new(r.response, r.prompt_eval_count, r.eval_count)
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible — POST /v1/chat/completions
// ---------------------------------------------------------------------------

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message text; absent for tool-call-only replies.
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
        }
    }
}

/// Chat-completions request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest<'a> {
    /// Model id.
    pub model: &'a str,
    /// Conversation.
    pub messages: Vec<ChatMessage>,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl<'a> ChatCompletionRequest<'a> {
    /// Single-turn request, with the system prompt first if set.
    #[must_use]
    pub fn new(model: &'a str, input: &str, options: &GenerationOptions) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &options.system {
            messages.push(ChatMessage::new("system", system));
        }
        messages.push(ChatMessage::new("user", input));
        Self {
            model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        }
    }
}

/// Chat-completions response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    /// Candidate completions.
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    /// Token usage.
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

/// One candidate.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    /// The generated message.
    pub message: ChatMessage,
}

/// Token usage block.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ChatUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Completion tokens.
    #[serde(default)]
    pub completion_tokens: u32,
}

impl From<ChatCompletionResponse> for BackendResponse {
    fn from(r: ChatCompletionResponse) -> Self {
        let usage = r.usage.unwrap_or_default();
        let text = r
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        BackendResponse::new(text, usage.prompt_tokens, usage.completion_tokens)
    }
}

// ---------------------------------------------------------------------------
// Anthropic — POST /v1/messages
// ---------------------------------------------------------------------------

/// Messages API request.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest<'a> {
    /// Model id.
    pub model: &'a str,
    /// Completion token cap (required by the API).
    pub max_tokens: u32,
    /// System prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    /// Conversation.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl<'a> MessagesRequest<'a> {
    /// Single-turn request.
    #[must_use]
    pub fn new(model: &'a str, input: &str, options: &'a GenerationOptions) -> Self {
        Self {
            model,
            max_tokens: options.max_tokens,
            system: options.system.as_deref(),
            messages: vec![ChatMessage::new("user", input)],
            temperature: options.temperature,
        }
    }
}

/// Messages API response.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    /// Content blocks.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Token usage.
    #[serde(default)]
    pub usage: MessagesUsage,
}

/// One content block; only `text` blocks carry output.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    /// Block type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Text, for `text` blocks.
    #[serde(default)]
    pub text: Option<String>,
}

/// Token usage block.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MessagesUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub input_tokens: u32,
    /// Completion tokens.
    #[serde(default)]
    pub output_tokens: u32,
}

impl From<MessagesResponse> for BackendResponse {
    fn from(r: MessagesResponse) -> Self {
        let text: String = r
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        BackendResponse::new(text, r.usage.input_tokens, r.usage.output_tokens)
    }
}

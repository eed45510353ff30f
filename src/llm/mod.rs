//! LLM provider abstraction layer.
//!
//! Defines the [`LlmProvider`] trait and the shared request types used by all
//! provider implementations:
//! - [`anthropic::AnthropicProvider`] — Anthropic `/v1/messages` API
//! - [`openai::OpenAiProvider`] — OpenAI-compatible `/v1/chat/completions`
//!   (also covers Ollama and other local servers via an endpoint override)
//!
//! Bindings (`llm.heartbeat`, `llm.chat`, `llm.subconscious`) are stored in
//! the substrate's config table and resolved by [`binding::load_llm_binding`].
//! All think-call outputs are JSON documents; [`json::chat_json`] wraps a
//! completion with lenient parsing and a declared fallback.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod binding;
pub mod json;
pub mod openai;

pub use binding::{load_llm_binding, LlmBinding};

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message.
    System,
    /// Human/user message.
    User,
    /// Assistant (LLM) message.
    Assistant,
}

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// Plain-text content.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation including the latest user message.
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens in the response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Ask the provider for a JSON object response where supported.
    pub json_mode: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by model providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Response did not match the expected schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
    /// Upstream provider responded with an error status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// Provider cannot satisfy the request with the current configuration.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// HTTP helpers shared by providers
// ---------------------------------------------------------------------------

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// `ProviderError::Request` on transport failure, `ProviderError::HttpStatus`
/// on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"Bearer [A-Za-z0-9._\-]{16,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Core LLM provider interface.
///
/// Implementations must be `Send + Sync`; completions are issued from worker
/// loops and tool handlers across task boundaries.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Request a completion, returning the raw assistant text.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on API, network, or parse failure.
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError>;

    /// The model identifier this provider is instantiated for.
    fn model_id(&self) -> &str;
}

/// Resolve a provider implementation for a binding.
///
/// `openai` also serves any OpenAI-compatible server (Ollama, LM Studio, …)
/// through the binding's endpoint override.
///
/// # Errors
///
/// Returns [`ProviderError::Unavailable`] for unknown provider names or
/// missing credentials.
pub fn resolve_provider(binding: &LlmBinding) -> Result<Box<dyn LlmProvider>, ProviderError> {
    match binding.provider.as_str() {
        "anthropic" => Ok(Box::new(anthropic::AnthropicProvider::new(
            binding.model.clone(),
            binding.resolve_api_key("ANTHROPIC_API_KEY").ok_or_else(|| {
                ProviderError::Unavailable("ANTHROPIC_API_KEY is not set".to_owned())
            })?,
            binding.endpoint.clone(),
        ))),
        "openai" | "ollama" | "local" => Ok(Box::new(openai::OpenAiProvider::new(
            binding.model.clone(),
            binding.resolve_api_key("OPENAI_API_KEY"),
            binding.endpoint.clone(),
        ))),
        other => Err(ProviderError::Unavailable(format!(
            "unknown provider: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_redacts_api_keys() {
        let body = "error sk-ant-abc123def456ghi789 in request";
        let sanitized = sanitize_http_error_body(body);
        assert!(!sanitized.contains("sk-ant-abc123def456ghi789"));
        assert!(sanitized.contains("[REDACTED]"));
    }

    #[test]
    fn test_sanitize_truncates_long_bodies() {
        let body = "x".repeat(1000);
        let sanitized = sanitize_http_error_body(&body);
        assert!(sanitized.ends_with("...[truncated]"));
        assert!(sanitized.chars().count() < 300);
    }

    #[test]
    fn test_resolve_unknown_provider() {
        let binding = LlmBinding {
            provider: "mystery".to_owned(),
            model: "m".to_owned(),
            endpoint: None,
            api_key: None,
            api_key_env: None,
        };
        assert!(matches!(
            resolve_provider(&binding),
            Err(ProviderError::Unavailable(_))
        ));
    }
}

//! LLM binding resolution from substrate config.
//!
//! Config keys like `llm.heartbeat` hold `{provider, model, endpoint?,
//! api_key?, api_key_env?}`; missing fields fall back to `LLM_PROVIDER` /
//! `LLM_MODEL` environment defaults.

use serde::{Deserialize, Serialize};

use crate::store::{Store, StoreResult};

/// Resolved model binding for one role (heartbeat, chat, subconscious).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmBinding {
    /// Provider name (`anthropic`, `openai`, `ollama`, ...).
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Endpoint override for OpenAI-compatible servers.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Inline API key (prefer `api_key_env`).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl LlmBinding {
    /// Resolve the API key: inline value, then `api_key_env`, then the
    /// provider's conventional variable.
    pub fn resolve_api_key(&self, default_env: &str) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        if let Some(env_name) = &self.api_key_env {
            if let Ok(value) = std::env::var(env_name) {
                return Some(value);
            }
        }
        std::env::var(default_env).ok()
    }

    /// Binding from `LLM_PROVIDER` / `LLM_MODEL` environment defaults.
    pub fn from_env_defaults() -> Self {
        Self {
            provider: std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_owned()),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o".to_owned()),
            endpoint: std::env::var("OPENAI_BASE_URL").ok(),
            api_key: None,
            api_key_env: None,
        }
    }
}

/// Load a binding from config, falling back to `fallback_key` and then to
/// environment defaults for any missing field.
///
/// # Errors
///
/// Returns a store error if config cannot be read.
pub async fn load_llm_binding(
    store: &Store,
    key: &str,
    fallback_key: Option<&str>,
) -> StoreResult<LlmBinding> {
    let mut doc = store.get_config(key).await?;
    if doc.is_none() {
        if let Some(fallback) = fallback_key {
            doc = store.get_config(fallback).await?;
        }
    }

    let defaults = LlmBinding::from_env_defaults();
    let Some(doc) = doc else {
        return Ok(defaults);
    };

    let mut binding: LlmBinding = serde_json::from_value(doc).unwrap_or_else(|_| defaults.clone());
    if binding.provider.is_empty() {
        binding.provider = defaults.provider;
    }
    if binding.model.is_empty() {
        binding.model = defaults.model;
    }
    if binding.endpoint.is_none() {
        binding.endpoint = defaults.endpoint;
    }
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_deserializes_partial_doc() {
        let doc = serde_json::json!({"provider": "anthropic", "model": "claude-3-opus"});
        let binding: LlmBinding = serde_json::from_value(doc).expect("parse");
        assert_eq!(binding.provider, "anthropic");
        assert_eq!(binding.model, "claude-3-opus");
        assert!(binding.endpoint.is_none());
    }

    #[test]
    fn test_inline_key_wins() {
        let binding = LlmBinding {
            provider: "openai".to_owned(),
            model: "gpt-4o".to_owned(),
            endpoint: None,
            api_key: Some("inline-key".to_owned()),
            api_key_env: Some("SOME_UNSET_VAR_123".to_owned()),
        };
        assert_eq!(
            binding.resolve_api_key("ALSO_UNSET_456"),
            Some("inline-key".to_owned())
        );
    }
}

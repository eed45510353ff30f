//! Anthropic `/v1/messages` provider.

use async_trait::async_trait;
use serde_json::json;

use super::{check_http_response, ChatRequest, LlmProvider, ProviderError, Role};

/// Default Anthropic API base URL.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// HTTP timeout for completion requests.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a provider for `model` with the given key and optional base URL.
    pub fn new(model: String, api_key: String, endpoint: Option<String>) -> Self {
        let base_url = endpoint
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        Self {
            model,
            api_key,
            base_url,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        // The Messages API takes the system prompt as a top-level field.
        let system: String = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                };
                json!({"role": role, "content": m.content})
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let raw = check_http_response(response).await?;
        let doc: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::Parse(format!("invalid JSON response: {e}")))?;

        let text: String = doc
            .get("content")
            .and_then(serde_json::Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        (b.get("type").and_then(serde_json::Value::as_str) == Some("text"))
                            .then(|| b.get("text").and_then(serde_json::Value::as_str))
                            .flatten()
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(ProviderError::Parse(
                "response contained no text blocks".to_owned(),
            ));
        }
        Ok(text)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

//! OpenAI-compatible chat completions provider.
//!
//! Talks to `/v1/chat/completions` with an optional base-URL override, which
//! also covers Ollama, LM Studio, and other compatible local servers.

use async_trait::async_trait;
use serde_json::json;

use super::{check_http_response, ChatRequest, LlmProvider, ProviderError, Role};

/// Default OpenAI API base URL.
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// HTTP timeout for completion requests.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Provider for OpenAI-compatible chat endpoints.
pub struct OpenAiProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider for `model`, optionally overriding the base URL.
    pub fn new(model: String, api_key: Option<String>, endpoint: Option<String>) -> Self {
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
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, request: ChatRequest) -> Result<String, ProviderError> {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
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
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let raw = check_http_response(req.send().await?).await?;
        let doc: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| ProviderError::Parse(format!("invalid JSON response: {e}")))?;

        doc.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ProviderError::Parse("response missing choices[0].message.content".to_owned()))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

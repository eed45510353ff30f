//! Messaging tools: Discord, Slack, and Telegram senders.
//!
//! Discord and Slack deliver through webhook URLs; Telegram through the bot
//! API. All three are externally observable, so they require approval and
//! never run in parallel.

use async_trait::async_trait;
use serde_json::json;

use crate::store::Store;

use super::config::ToolsConfig;
use super::{
    ToolCategory, ToolContext, ToolErrorType, ToolExecutionContext, ToolHandler, ToolResult,
    ToolSpec,
};

/// Which platform a sender targets.
#[derive(Debug, Clone, Copy)]
enum Platform {
    Discord,
    Slack,
    Telegram,
}

impl Platform {
    fn tool_name(self) -> &'static str {
        match self {
            Self::Discord => "discord_send",
            Self::Slack => "slack_send",
            Self::Telegram => "telegram_send",
        }
    }

    fn key_name(self) -> &'static str {
        match self {
            Self::Discord => "discord_webhook",
            Self::Slack => "slack_webhook",
            Self::Telegram => "telegram_bot_token",
        }
    }
}

/// One API-backed message sender.
pub struct MessageSendHandler {
    store: Store,
    platform: Platform,
}

impl MessageSendHandler {
    async fn send(
        &self,
        config: &ToolsConfig,
        message: &str,
        chat_id: Option<&str>,
    ) -> Result<(), ToolResult> {
        let Some(secret) = config.get_api_key(self.platform.key_name()) else {
            return Err(ToolResult::error_result(
                format!(
                    "No credential configured (api_keys.{})",
                    self.platform.key_name()
                ),
                ToolErrorType::MissingApiKey,
            ));
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        let response = match self.platform {
            Platform::Discord => client.post(&secret).json(&json!({"content": message})),
            Platform::Slack => client.post(&secret).json(&json!({"text": message})),
            Platform::Telegram => {
                let Some(chat_id) = chat_id else {
                    return Err(ToolResult::error_result(
                        "chat_id is required for telegram_send",
                        ToolErrorType::InvalidParams,
                    ));
                };
                let url = format!("https://api.telegram.org/bot{secret}/sendMessage");
                client
                    .post(url)
                    .json(&json!({"chat_id": chat_id, "text": message}))
            }
        }
        .send()
        .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return Err(ToolResult::error_result(
                    e.to_string(),
                    ToolErrorType::NetworkError,
                ))
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ToolResult::error_result(
                format!("{} auth failed: HTTP {status}", self.platform.tool_name()),
                ToolErrorType::AuthFailed,
            ));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ToolResult::error_result(
                format!("{} rate limited", self.platform.tool_name()),
                ToolErrorType::RateLimited,
            ));
        }
        if !status.is_success() {
            return Err(ToolResult::error_result(
                format!("{} returned HTTP {status}", self.platform.tool_name()),
                ToolErrorType::HttpError,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ToolHandler for MessageSendHandler {
    fn spec(&self) -> ToolSpec {
        let mut properties = serde_json::Map::new();
        properties.insert(
            "message".to_owned(),
            json!({"type": "string", "description": "Message text to send."}),
        );
        if matches!(self.platform, Platform::Telegram) {
            properties.insert(
                "chat_id".to_owned(),
                json!({"type": "string", "description": "Telegram chat id to deliver to."}),
            );
        }
        let required = match self.platform {
            Platform::Telegram => json!(["message", "chat_id"]),
            _ => json!(["message"]),
        };

        ToolSpec {
            name: self.platform.tool_name().to_owned(),
            description: format!(
                "Send a message via {}. Requires prior approval for autonomous use.",
                match self.platform {
                    Platform::Discord => "a Discord webhook",
                    Platform::Slack => "a Slack webhook",
                    Platform::Telegram => "the Telegram bot API",
                }
            ),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required
            }),
            category: ToolCategory::Messaging,
            energy_cost: 5,
            requires_approval: true,
            is_read_only: false,
            supports_parallel: false,
            allowed_contexts: vec![ToolContext::Heartbeat, ToolContext::Chat],
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_network {
            return ToolResult::error_result(
                "Network access not allowed in this context",
                ToolErrorType::PermissionDenied,
            );
        }

        let config = super::config::load_tools_config(&self.store)
            .await
            .unwrap_or_default();
        let message = arguments
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let chat_id = arguments.get("chat_id").and_then(serde_json::Value::as_str);

        if let Err(result) = self.send(&config, message, chat_id).await {
            return result;
        }

        let preview: String = message.chars().take(50).collect();
        ToolResult::success_result(
            json!({"sent": true, "message": preview}),
            Some(format!("Sent via {}: {preview}", self.platform.tool_name())),
        )
    }
}

/// Create all messaging tool handlers.
pub fn create_messaging_tools(store: Store) -> Vec<std::sync::Arc<dyn ToolHandler>> {
    vec![
        std::sync::Arc::new(MessageSendHandler {
            store: store.clone(),
            platform: Platform::Discord,
        }),
        std::sync::Arc::new(MessageSendHandler {
            store: store.clone(),
            platform: Platform::Slack,
        }),
        std::sync::Arc::new(MessageSendHandler {
            store,
            platform: Platform::Telegram,
        }),
    ]
}

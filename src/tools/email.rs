//! Email sending via an HTTP API (SendGrid v3).
//!
//! Key under `api_keys.sendgrid`; the from-address under config key
//! `email.from_address`.

use async_trait::async_trait;
use serde_json::json;

use crate::store::Store;

use super::{
    ToolCategory, ToolContext, ToolErrorType, ToolExecutionContext, ToolHandler, ToolResult,
    ToolSpec,
};

/// SendGrid mail-send endpoint.
const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

/// Send an email.
pub struct EmailSendHandler {
    store: Store,
}

#[async_trait]
impl ToolHandler for EmailSendHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "email_send".to_owned(),
            description: "Send an email. Requires prior approval for autonomous use.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "to": {"type": "string", "description": "Recipient address."},
                    "subject": {"type": "string", "description": "Subject line."},
                    "body": {"type": "string", "description": "Plain-text body."}
                },
                "required": ["to", "subject", "body"]
            }),
            category: ToolCategory::Email,
            energy_cost: 5,
            requires_approval: true,
            is_read_only: false,
            supports_parallel: false,
            allowed_contexts: vec![ToolContext::Heartbeat, ToolContext::Chat],
        }
    }

    fn validate(&self, arguments: &serde_json::Value) -> Vec<String> {
        let mut errors = super::validate_against_schema(&self.spec().parameters, arguments);
        if let Some(to) = arguments.get("to").and_then(serde_json::Value::as_str) {
            if !to.contains('@') {
                errors.push("to must be an email address".to_owned());
            }
        }
        errors
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
        let Some(api_key) = config.get_api_key("sendgrid") else {
            return ToolResult::error_result(
                "No email API key configured (api_keys.sendgrid)",
                ToolErrorType::MissingApiKey,
            );
        };
        let from_address = match self.store.get_config("email.from_address").await {
            Ok(Some(serde_json::Value::String(addr))) if !addr.is_empty() => addr,
            _ => {
                return ToolResult::error_result(
                    "No from-address configured (email.from_address)",
                    ToolErrorType::MissingConfig,
                )
            }
        };

        let to = arguments
            .get("to")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let subject = arguments
            .get("subject")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let body = arguments
            .get("body")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        let payload = json!({
            "personalizations": [{"to": [{"email": to}]}],
            "from": {"email": from_address},
            "subject": subject,
            "content": [{"type": "text/plain", "value": body}],
        });

        let response = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default()
            .post(SENDGRID_ENDPOINT)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return ToolResult::error_result(e.to_string(), ToolErrorType::NetworkError)
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return ToolResult::error_result(
                format!("email API auth failed: HTTP {status}"),
                ToolErrorType::AuthFailed,
            );
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return ToolResult::error_result("email API rate limited", ToolErrorType::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            return ToolResult::error_result(
                format!("email API returned HTTP {status}: {preview}"),
                ToolErrorType::HttpError,
            );
        }

        ToolResult::success_result(
            json!({"sent": true, "to": to, "subject": subject}),
            Some(format!("Sent email to {to}: {subject}")),
        )
    }
}

/// Create all email tool handlers.
pub fn create_email_tools(store: Store) -> Vec<std::sync::Arc<dyn ToolHandler>> {
    vec![std::sync::Arc::new(EmailSendHandler { store })]
}

//! Wrapper handler exposing one discovered MCP tool through the registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::tools::{
    ToolCategory, ToolContext, ToolErrorType, ToolExecutionContext, ToolHandler, ToolResult,
    ToolSpec,
};

use super::client::{McpClient, McpClientError, McpToolInfo};

/// A registry handler backed by a shared MCP client.
pub struct McpToolHandler {
    server_name: String,
    info: McpToolInfo,
    client: Arc<tokio::sync::Mutex<McpClient>>,
}

impl McpToolHandler {
    /// Wrap a discovered tool.
    pub fn new(
        server_name: String,
        info: McpToolInfo,
        client: Arc<tokio::sync::Mutex<McpClient>>,
    ) -> Self {
        Self {
            server_name,
            info,
            client,
        }
    }

    /// Registry name for a server/tool pair.
    pub fn registry_name(server: &str, tool: &str) -> String {
        format!("mcp_{server}_{tool}")
    }
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    fn spec(&self) -> ToolSpec {
        let parameters = if self.info.input_schema.is_object() {
            self.info.input_schema.clone()
        } else {
            json!({"type": "object", "properties": {}})
        };
        ToolSpec {
            name: Self::registry_name(&self.server_name, &self.info.name),
            description: self
                .info
                .description
                .clone()
                .unwrap_or_else(|| format!("MCP tool {} from {}", self.info.name, self.server_name)),
            parameters,
            category: ToolCategory::External,
            energy_cost: 2,
            requires_approval: false,
            is_read_only: false,
            supports_parallel: false, // One client per server; calls serialize.
            allowed_contexts: vec![ToolContext::Heartbeat, ToolContext::Chat],
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _context: &ToolExecutionContext,
    ) -> ToolResult {
        let mut client = self.client.lock().await;
        match client.call_tool(&self.info.name, arguments).await {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if is_error {
                    return ToolResult::error_result(
                        content_text(&result),
                        ToolErrorType::ExecutionFailed,
                    );
                }
                ToolResult::success_result(result, None)
            }
            Err(McpClientError::Timeout) => {
                ToolResult::error_result("MCP call timed out", ToolErrorType::Timeout)
            }
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Join the text blocks of an MCP result for error display.
fn content_text(result: &serde_json::Value) -> String {
    result
        .get("content")
        .and_then(serde_json::Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(serde_json::Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "MCP tool reported an error".to_owned())
}

//! Minimal MCP client: JSON-RPC 2.0 over newline-delimited stdio.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};

/// Protocol version this client speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Per-request timeout for protocol exchanges.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Errors from the MCP protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    /// I/O failure on the child's pipes.
    #[error("MCP transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// Response was not valid JSON-RPC.
    #[error("MCP protocol error: {0}")]
    Protocol(String),
    /// The server returned a JSON-RPC error object.
    #[error("MCP server error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
    },
    /// The server did not answer within the request timeout.
    #[error("MCP request timed out")]
    Timeout,
}

/// A tool discovered from an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInfo {
    /// Tool name as the server exposes it.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Input JSON Schema.
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// JSON-RPC client over a child process's stdio.
pub struct McpClient {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: i64,
}

impl McpClient {
    /// Wrap a child's pipes.
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 0,
        }
    }

    /// Perform the `initialize` handshake and send the initialized
    /// notification.
    pub async fn initialize(&mut self) -> Result<(), McpClientError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "hexis", "version": env!("CARGO_PKG_VERSION")},
        });
        self.request("initialize", params).await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(())
    }

    /// List the server's tools.
    pub async fn list_tools(&mut self) -> Result<Vec<McpToolInfo>, McpClientError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| serde_json::from_value(t).ok())
            .collect())
    }

    /// Invoke a tool and return its result document.
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<serde_json::Value, McpClientError> {
        self.request("tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    async fn request(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, McpClientError> {
        self.next_id = self.next_id.saturating_add(1);
        let id = self.next_id;
        let message = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.write_line(&message).await?;

        // Skip notifications and unrelated responses until our id appears.
        let deadline = std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS);
        let read = async {
            loop {
                let mut line = String::new();
                let n = self.stdout.read_line(&mut line).await?;
                if n == 0 {
                    return Err(McpClientError::Protocol("server closed stdout".to_owned()));
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(doc) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                    continue;
                };
                if doc.get("id").and_then(serde_json::Value::as_i64) != Some(id) {
                    continue;
                }
                if let Some(error) = doc.get("error") {
                    return Err(McpClientError::Server {
                        code: error
                            .get("code")
                            .and_then(serde_json::Value::as_i64)
                            .unwrap_or(-1),
                        message: error
                            .get("message")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("unknown")
                            .to_owned(),
                    });
                }
                return Ok(doc.get("result").cloned().unwrap_or(serde_json::Value::Null));
            }
        };

        tokio::time::timeout(deadline, read)
            .await
            .map_err(|_| McpClientError::Timeout)?
    }

    async fn notify(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<(), McpClientError> {
        let message = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.write_line(&message).await
    }

    async fn write_line(&mut self, message: &serde_json::Value) -> Result<(), McpClientError> {
        let mut line = message.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

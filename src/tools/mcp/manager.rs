//! MCP server lifecycle manager.
//!
//! Spawns configured servers as child processes, performs the handshake,
//! discovers tools, and registers one wrapper handler per tool. Handles
//! shutdown and tool deregistration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::tools::config::McpServerConfig;
use crate::tools::ToolRegistry;

use super::client::McpClient;
use super::tool::McpToolHandler;

/// Errors from MCP server lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum McpManagerError {
    /// Failed to spawn the server process.
    #[error("spawn failed for {server}: {detail}")]
    Spawn {
        /// Server name.
        server: String,
        /// Error detail.
        detail: String,
    },
    /// MCP protocol error during handshake or discovery.
    #[error("MCP protocol error for {server}: {detail}")]
    Protocol {
        /// Server name.
        server: String,
        /// Error detail.
        detail: String,
    },
    /// Server is not running.
    #[error("server '{0}' is not running")]
    NotRunning(String),
}

/// A running server with its child process and registered tool names.
struct RunningServer {
    child: tokio::process::Child,
    tool_names: Vec<String>,
}

/// Manages MCP server lifecycle: spawn, discover, register, stop.
pub struct McpServerManager {
    servers: tokio::sync::Mutex<HashMap<String, RunningServer>>,
    registry: Arc<ToolRegistry>,
}

impl McpServerManager {
    /// Create a manager registering into the given registry.
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            servers: tokio::sync::Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Spawn every enabled server from configuration; failures are logged and
    /// skipped so one broken server cannot block startup.
    pub async fn start_configured(&self, configs: &[McpServerConfig]) {
        for config in configs.iter().filter(|c| c.enabled) {
            match self.spawn_server(config).await {
                Ok(tools) => {
                    info!(server = %config.name, tools = tools.len(), "MCP server started");
                }
                Err(e) => {
                    warn!(server = %config.name, error = %e, "failed to start MCP server");
                }
            }
        }
    }

    /// Spawn a server, handshake, discover tools, and register wrappers.
    ///
    /// Returns the registered tool names (`mcp_{server}_{tool}`).
    pub async fn spawn_server(
        &self,
        config: &McpServerConfig,
    ) -> Result<Vec<String>, McpManagerError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| McpManagerError::Spawn {
            server: config.name.clone(),
            detail: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpManagerError::Spawn {
            server: config.name.clone(),
            detail: "failed to capture stdin".to_owned(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpManagerError::Spawn {
            server: config.name.clone(),
            detail: "failed to capture stdout".to_owned(),
        })?;

        let mut client = McpClient::new(stdin, stdout);
        client
            .initialize()
            .await
            .map_err(|e| McpManagerError::Protocol {
                server: config.name.clone(),
                detail: format!("initialize: {e}"),
            })?;
        let tools = client
            .list_tools()
            .await
            .map_err(|e| McpManagerError::Protocol {
                server: config.name.clone(),
                detail: format!("tools/list: {e}"),
            })?;

        let client = Arc::new(tokio::sync::Mutex::new(client));
        let mut tool_names = Vec::with_capacity(tools.len());
        for info in tools {
            let name = McpToolHandler::registry_name(&config.name, &info.name);
            let handler = McpToolHandler::new(config.name.clone(), info, Arc::clone(&client));
            self.registry.register_mcp(Arc::new(handler));
            tool_names.push(name);
        }

        let mut servers = self.servers.lock().await;
        servers.insert(
            config.name.clone(),
            RunningServer {
                child,
                tool_names: tool_names.clone(),
            },
        );

        Ok(tool_names)
    }

    /// Stop a server and unregister its tools.
    pub async fn stop_server(&self, name: &str) -> Result<(), McpManagerError> {
        let mut servers = self.servers.lock().await;
        let mut server = servers
            .remove(name)
            .ok_or_else(|| McpManagerError::NotRunning(name.to_owned()))?;

        for tool_name in &server.tool_names {
            self.registry.unregister(tool_name);
        }
        let _ = server.child.kill().await;

        info!(server = %name, "MCP server stopped and tools unregistered");
        Ok(())
    }

    /// Shut down all running servers (graceful-shutdown path).
    pub async fn shutdown_all(&self) {
        let mut servers = self.servers.lock().await;
        let names: Vec<String> = servers.keys().cloned().collect();
        for name in &names {
            if let Some(mut server) = servers.remove(name) {
                for tool_name in &server.tool_names {
                    self.registry.unregister(tool_name);
                }
                let _ = server.child.kill().await;
                info!(server = %name, "MCP server shut down");
            }
        }
    }

    /// Names of all running servers.
    pub async fn list_servers(&self) -> Vec<String> {
        let servers = self.servers.lock().await;
        let mut names: Vec<String> = servers.keys().cloned().collect();
        names.sort();
        names
    }
}

//! MCP (Model Context Protocol) integration.
//!
//! Configured servers are spawned as child processes speaking JSON-RPC 2.0
//! over stdio. Discovered tools register in the registry under
//! `mcp_{server}_{tool}` and execute through the shared client.

pub mod client;
pub mod manager;
pub mod tool;

pub use client::{McpClient, McpClientError, McpToolInfo};
pub use manager::McpServerManager;

//! Tool system: catalogue, policy, and execution.
//!
//! Tools are named capabilities exposed to the LLM through function-calling
//! descriptors and executed by the registry under a policy pipeline (enabled →
//! context → energy → boundary → approval). Built-in families live in their
//! own modules; MCP servers contribute dynamic tools through `mcp`.

pub mod calendar;
pub mod config;
pub mod email;
pub mod filesystem;
pub mod mcp;
pub mod memory;
pub mod messaging;
pub mod policy;
pub mod registry;
pub mod shell;
pub mod web;

pub use config::{ContextOverrides, McpServerConfig, ToolsConfig};
pub use registry::{create_default_registry, ExecutionStats, ToolRegistry, ToolRegistryBuilder};

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Categories, contexts, error kinds
// ---------------------------------------------------------------------------

/// Categories of tools for organization and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    /// Memory operations (recall, remember, goals).
    Memory,
    /// Web search and fetch.
    Web,
    /// File read/write/search within the workspace.
    Filesystem,
    /// Command execution.
    Shell,
    /// Calendar integrations.
    Calendar,
    /// Email sending.
    Email,
    /// Chat-platform senders.
    Messaging,
    /// MCP and other external tools.
    External,
}

impl ToolCategory {
    /// Stable string form used in config and boundaries.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Web => "web",
            Self::Filesystem => "filesystem",
            Self::Shell => "shell",
            Self::Calendar => "calendar",
            Self::Email => "email",
            Self::Messaging => "messaging",
            Self::External => "external",
        }
    }
}

impl std::str::FromStr for ToolCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "web" => Ok(Self::Web),
            "filesystem" => Ok(Self::Filesystem),
            "shell" => Ok(Self::Shell),
            "calendar" => Ok(Self::Calendar),
            "email" => Ok(Self::Email),
            "messaging" => Ok(Self::Messaging),
            "external" => Ok(Self::External),
            other => Err(anyhow::anyhow!("unknown tool category: {other}")),
        }
    }
}

/// Contexts in which tools can be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolContext {
    /// Autonomous heartbeat loop.
    Heartbeat,
    /// Interactive conversation.
    Chat,
    /// External MCP client.
    Mcp,
}

impl ToolContext {
    /// Stable string form used in config.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Chat => "chat",
            Self::Mcp => "mcp",
        }
    }
}

impl std::str::FromStr for ToolContext {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heartbeat" => Ok(Self::Heartbeat),
            "chat" => Ok(Self::Chat),
            "mcp" => Ok(Self::Mcp),
            other => Err(anyhow::anyhow!("unknown tool context: {other}")),
        }
    }
}

/// Typed error categories for tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ToolErrorType {
    // General
    UnknownTool,
    InvalidParams,
    ExecutionFailed,
    Timeout,
    Cancelled,
    // Policy
    ContextDenied,
    InsufficientEnergy,
    BoundaryViolation,
    ApprovalRequired,
    Disabled,
    // Filesystem
    FileNotFound,
    DirectoryNotFound,
    PermissionDenied,
    FileTooLarge,
    PathNotAllowed,
    // Shell
    ShellDisabled,
    ShellTimeout,
    ShellExitError,
    // Web
    NetworkError,
    HttpError,
    FetchTimeout,
    // Config
    MissingConfig,
    MissingApiKey,
    MissingDependency,
    // Auth/API
    AuthFailed,
    RateLimited,
}

impl ToolErrorType {
    /// Stable string form used in results and stats.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::InvalidParams => "invalid_params",
            Self::ExecutionFailed => "execution_failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ContextDenied => "context_denied",
            Self::InsufficientEnergy => "insufficient_energy",
            Self::BoundaryViolation => "boundary_violation",
            Self::ApprovalRequired => "approval_required",
            Self::Disabled => "disabled",
            Self::FileNotFound => "file_not_found",
            Self::DirectoryNotFound => "directory_not_found",
            Self::PermissionDenied => "permission_denied",
            Self::FileTooLarge => "file_too_large",
            Self::PathNotAllowed => "path_not_allowed",
            Self::ShellDisabled => "shell_disabled",
            Self::ShellTimeout => "shell_timeout",
            Self::ShellExitError => "shell_exit_error",
            Self::NetworkError => "network_error",
            Self::HttpError => "http_error",
            Self::FetchTimeout => "fetch_timeout",
            Self::MissingConfig => "missing_config",
            Self::MissingApiKey => "missing_api_key",
            Self::MissingDependency => "missing_dependency",
            Self::AuthFailed => "auth_failed",
            Self::RateLimited => "rate_limited",
        }
    }
}

// ---------------------------------------------------------------------------
// Spec, result, context
// ---------------------------------------------------------------------------

/// Tool definition exposed to LLMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (must be unique in the registry).
    pub name: String,
    /// Description shown to the LLM.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    pub parameters: serde_json::Value,
    /// Category for policy and organization.
    pub category: ToolCategory,
    /// Default energy cost (config may override).
    pub energy_cost: i32,
    /// Whether autonomous use requires prior approval.
    pub requires_approval: bool,
    /// Whether the tool mutates anything.
    pub is_read_only: bool,
    /// Whether the tool may run concurrently with others.
    pub supports_parallel: bool,
    /// Contexts the tool may run in.
    pub allowed_contexts: Vec<ToolContext>,
}

impl ToolSpec {
    /// All three contexts, the common default.
    pub fn all_contexts() -> Vec<ToolContext> {
        vec![ToolContext::Heartbeat, ToolContext::Chat, ToolContext::Mcp]
    }

    /// OpenAI-style function descriptor.
    pub fn to_openai_function(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }

    /// MCP tool descriptor.
    pub fn to_mcp_tool(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.parameters,
        })
    }
}

/// Structured result from tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool succeeded.
    pub success: bool,
    /// Output for LLM consumption (JSON-serializable).
    pub output: serde_json::Value,
    /// Human-readable output for UI display.
    #[serde(default)]
    pub display_output: Option<String>,
    /// Error text when failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Typed error kind when failed.
    #[serde(default)]
    pub error_type: Option<ToolErrorType>,
    /// Wall-clock duration.
    #[serde(default)]
    pub duration_seconds: f64,
    /// Energy charged for this execution.
    #[serde(default)]
    pub energy_spent: i32,
}

impl ToolResult {
    /// Build an error result.
    pub fn error_result(error: impl Into<String>, error_type: ToolErrorType) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            display_output: None,
            error: Some(error.into()),
            error_type: Some(error_type),
            duration_seconds: 0.0,
            energy_spent: 0,
        }
    }

    /// Build a success result.
    pub fn success_result(
        output: serde_json::Value,
        display_output: Option<String>,
    ) -> Self {
        Self {
            success: true,
            output,
            display_output,
            error: None,
            error_type: None,
            duration_seconds: 0.0,
            energy_spent: 0,
        }
    }

    /// Format for LLM consumption.
    pub fn to_model_output(&self) -> String {
        if self.success {
            match &self.output {
                serde_json::Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_default(),
            }
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("unknown"))
        }
    }
}

/// Context passed to tool execution.
#[derive(Debug, Clone)]
pub struct ToolExecutionContext {
    /// The context this execution runs in.
    pub tool_context: ToolContext,
    /// Unique call identifier for tracking.
    pub call_id: String,
    /// Owning heartbeat, when applicable.
    pub heartbeat_id: Option<String>,
    /// Energy remaining in the current cycle (heartbeat only).
    pub energy_available: Option<i32>,
    /// Workspace root for filesystem and shell tools.
    pub workspace_path: Option<String>,
    /// Whether network access is allowed.
    pub allow_network: bool,
    /// Whether shell execution is allowed.
    pub allow_shell: bool,
    /// Whether file writes are allowed.
    pub allow_file_write: bool,
    /// Whether file reads are allowed.
    pub allow_file_read: bool,
}

impl ToolExecutionContext {
    /// Resolve a path relative to the workspace, normalizing `.`/`..`.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let raw = Path::new(path);
        let base = match (&self.workspace_path, raw.is_absolute()) {
            (Some(ws), false) => Path::new(ws).join(raw),
            _ => raw.to_path_buf(),
        };
        normalize_path(&base)
    }

    /// Whether a path stays inside the workspace jail.
    ///
    /// With no workspace configured there is no restriction.
    pub fn is_path_allowed(&self, path: &str) -> bool {
        let Some(ws) = &self.workspace_path else {
            return true;
        };
        let resolved = self.resolve_path(path);
        let workspace = normalize_path(Path::new(ws));
        resolved.starts_with(&workspace)
    }
}

/// Lexically normalize a path, resolving `.` and `..` components.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// A tool implementation registered in the catalogue.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// The tool's static descriptor.
    fn spec(&self) -> ToolSpec;

    /// Execute with validated arguments and a policy-resolved context.
    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult;

    /// Validate arguments beyond JSON-schema basics.
    ///
    /// The default checks required fields and primitive types declared in
    /// `spec().parameters`; override for custom rules.
    fn validate(&self, arguments: &serde_json::Value) -> Vec<String> {
        validate_against_schema(&self.spec().parameters, arguments)
    }
}

/// Schema-driven argument validation: required fields and primitive types.
pub fn validate_against_schema(
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Vec<String> {
    let mut errors = Vec::new();

    let required = schema
        .get("required")
        .and_then(serde_json::Value::as_array)
        .cloned()
        .unwrap_or_default();
    for field in required {
        if let Some(name) = field.as_str() {
            if arguments.get(name).is_none() {
                errors.push(format!("Missing required field: {name}"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(serde_json::Value::as_object) else {
        return errors;
    };
    let Some(args) = arguments.as_object() else {
        if !arguments.is_null() {
            errors.push("arguments must be an object".to_owned());
        }
        return errors;
    };

    for (key, value) in args {
        let Some(prop) = properties.get(key) else {
            continue; // Unknown fields pass through.
        };
        let Some(expected) = prop.get("type").and_then(serde_json::Value::as_str) else {
            continue;
        };
        let ok = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };
        if !ok {
            errors.push(format!("Field '{key}' must be a {expected}"));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_required_fields() {
        let schema = json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
        });
        assert!(validate_against_schema(&schema, &json!({"query": "x"})).is_empty());
        let errors = validate_against_schema(&schema, &json!({}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("query"));
    }

    #[test]
    fn test_validate_type_mismatch() {
        let schema = json!({
            "type": "object",
            "properties": {"limit": {"type": "integer"}},
        });
        let errors = validate_against_schema(&schema, &json!({"limit": "five"}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("integer"));
    }

    #[test]
    fn test_validate_unknown_fields_pass() {
        let schema = json!({"type": "object", "properties": {}});
        assert!(validate_against_schema(&schema, &json!({"extra": 1})).is_empty());
    }

    #[test]
    fn test_path_jail() {
        let ctx = ToolExecutionContext {
            tool_context: ToolContext::Heartbeat,
            call_id: "c".to_owned(),
            heartbeat_id: None,
            energy_available: None,
            workspace_path: Some("/workspace".to_owned()),
            allow_network: true,
            allow_shell: false,
            allow_file_write: false,
            allow_file_read: true,
        };
        assert!(ctx.is_path_allowed("notes.txt"));
        assert!(ctx.is_path_allowed("sub/dir/file.rs"));
        assert!(!ctx.is_path_allowed("../outside.txt"));
        assert!(!ctx.is_path_allowed("/etc/passwd"));
        assert!(!ctx.is_path_allowed("sub/../../outside"));
    }

    #[test]
    fn test_no_workspace_means_no_jail() {
        let ctx = ToolExecutionContext {
            tool_context: ToolContext::Chat,
            call_id: "c".to_owned(),
            heartbeat_id: None,
            energy_available: None,
            workspace_path: None,
            allow_network: true,
            allow_shell: false,
            allow_file_write: false,
            allow_file_read: true,
        };
        assert!(ctx.is_path_allowed("/anywhere/at/all"));
    }

    #[test]
    fn test_spec_descriptor_shapes() {
        let spec = ToolSpec {
            name: "recall".to_owned(),
            description: "Search memories".to_owned(),
            parameters: json!({"type": "object", "properties": {}}),
            category: ToolCategory::Memory,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        };
        let f = spec.to_openai_function();
        assert_eq!(f["type"], "function");
        assert_eq!(f["function"]["name"], "recall");
        let m = spec.to_mcp_tool();
        assert_eq!(m["name"], "recall");
        assert!(m.get("inputSchema").is_some());
    }
}

//! Tools configuration, stored under config key `tools`.
//!
//! Resolution order for a tool in a context: global disabled → category
//! disabled → explicit-enabled allowlist (when set) → context overrides.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::store::{Store, StoreResult};

use super::{ToolCategory, ToolContext};

/// Configuration for one MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Server name; discovered tools register as `mcp_{name}_{tool}`.
    pub name: String,
    /// Command to launch the server.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Disabled servers are skipped at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Context-specific configuration overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextOverrides {
    /// Refuse tools whose resolved cost exceeds this.
    #[serde(default)]
    pub max_energy_per_tool: Option<i32>,
    /// Tools disabled in this context.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// When non-empty, only these tools are enabled in this context.
    #[serde(default)]
    pub enabled: Vec<String>,
    /// Bypass the context allowlist entirely.
    #[serde(default)]
    pub allow_all: bool,
    /// Permit shell execution in this context.
    #[serde(default)]
    pub allow_shell: bool,
    /// Permit file writes in this context.
    #[serde(default)]
    pub allow_file_write: bool,
}

/// Complete tools configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Explicit global allowlist; `None` means all tools enabled by default.
    #[serde(default)]
    pub enabled: Option<Vec<String>>,
    /// Globally disabled tools.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Globally disabled categories (by string name; unknown names ignored).
    #[serde(default)]
    pub disabled_categories: Vec<String>,
    /// Configured MCP servers.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    /// API keys; values may be direct or `env:VAR` references.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    /// Per-tool energy cost overrides.
    #[serde(default)]
    pub costs: HashMap<String, i32>,
    /// Per-context overrides, keyed by context name.
    #[serde(default)]
    pub context_overrides: HashMap<String, ContextOverrides>,
    /// Workspace root for filesystem/shell tools.
    #[serde(default)]
    pub workspace_path: Option<String>,
}

impl ToolsConfig {
    /// Parse from a stored JSON document; malformed documents yield defaults.
    pub fn from_json(value: Option<serde_json::Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Whether a tool is enabled globally.
    pub fn is_tool_enabled(&self, tool_name: &str, category: ToolCategory) -> bool {
        if self.disabled.iter().any(|t| t == tool_name) {
            return false;
        }
        if self
            .disabled_categories
            .iter()
            .any(|c| c == category.as_str())
        {
            return false;
        }
        if let Some(enabled) = &self.enabled {
            return enabled.iter().any(|t| t == tool_name);
        }
        true
    }

    /// Whether a tool is enabled for a specific context.
    pub fn is_tool_enabled_for_context(
        &self,
        tool_name: &str,
        category: ToolCategory,
        context: ToolContext,
    ) -> bool {
        if !self.is_tool_enabled(tool_name, category) {
            return false;
        }
        if let Some(overrides) = self.context_overrides.get(context.as_str()) {
            if overrides.allow_all {
                return true;
            }
            if overrides.disabled.iter().any(|t| t == tool_name) {
                return false;
            }
            if !overrides.enabled.is_empty() && !overrides.enabled.iter().any(|t| t == tool_name)
            {
                return false;
            }
        }
        true
    }

    /// Energy cost for a tool: configured override or the spec default.
    pub fn get_energy_cost(&self, tool_name: &str, default_cost: i32) -> i32 {
        self.costs.get(tool_name).copied().unwrap_or(default_cost)
    }

    /// Resolve an API key; `env:VAR` values read the environment.
    pub fn get_api_key(&self, key_name: &str) -> Option<String> {
        let value = self.api_keys.get(key_name)?;
        if value.is_empty() {
            return None;
        }
        if let Some(env_name) = value.strip_prefix("env:") {
            return std::env::var(env_name).ok();
        }
        Some(value.clone())
    }

    /// Overrides for a context, defaulting to the restrictive baseline.
    pub fn get_context_overrides(&self, context: ToolContext) -> ContextOverrides {
        self.context_overrides
            .get(context.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

/// Load tools configuration from the substrate.
pub async fn load_tools_config(store: &Store) -> StoreResult<ToolsConfig> {
    let value = store.get_config("tools").await?;
    Ok(ToolsConfig::from_json(value))
}

/// Save tools configuration to the substrate.
pub async fn save_tools_config(store: &Store, config: &ToolsConfig) -> StoreResult<()> {
    let value = serde_json::to_value(config)
        .map_err(|e| crate::store::StoreError::Malformed(e.to_string()))?;
    store
        .set_config("tools", &value, "Tool system configuration")
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_from(doc: serde_json::Value) -> ToolsConfig {
        ToolsConfig::from_json(Some(doc))
    }

    #[test]
    fn test_default_everything_enabled() {
        let config = ToolsConfig::default();
        assert!(config.is_tool_enabled("recall", ToolCategory::Memory));
        assert!(config.is_tool_enabled_for_context(
            "recall",
            ToolCategory::Memory,
            ToolContext::Heartbeat
        ));
    }

    #[test]
    fn test_global_disable_wins() {
        let config = config_from(json!({"disabled": ["shell"]}));
        assert!(!config.is_tool_enabled("shell", ToolCategory::Shell));
    }

    #[test]
    fn test_category_disable() {
        let config = config_from(json!({"disabled_categories": ["shell"]}));
        assert!(!config.is_tool_enabled("safe_shell", ToolCategory::Shell));
        assert!(config.is_tool_enabled("recall", ToolCategory::Memory));
    }

    #[test]
    fn test_explicit_allowlist() {
        let config = config_from(json!({"enabled": ["recall"]}));
        assert!(config.is_tool_enabled("recall", ToolCategory::Memory));
        assert!(!config.is_tool_enabled("remember", ToolCategory::Memory));
    }

    #[test]
    fn test_context_override_disable() {
        let config = config_from(json!({
            "context_overrides": {"heartbeat": {"disabled": ["web_fetch"]}}
        }));
        assert!(!config.is_tool_enabled_for_context(
            "web_fetch",
            ToolCategory::Web,
            ToolContext::Heartbeat
        ));
        assert!(config.is_tool_enabled_for_context(
            "web_fetch",
            ToolCategory::Web,
            ToolContext::Chat
        ));
    }

    #[test]
    fn test_context_override_allowlist() {
        let config = config_from(json!({
            "context_overrides": {"mcp": {"enabled": ["recall"]}}
        }));
        assert!(config.is_tool_enabled_for_context(
            "recall",
            ToolCategory::Memory,
            ToolContext::Mcp
        ));
        assert!(!config.is_tool_enabled_for_context(
            "shell",
            ToolCategory::Shell,
            ToolContext::Mcp
        ));
    }

    #[test]
    fn test_allow_all_bypasses_context_lists() {
        let config = config_from(json!({
            "context_overrides": {"chat": {"allow_all": true, "disabled": ["shell"]}}
        }));
        assert!(config.is_tool_enabled_for_context(
            "shell",
            ToolCategory::Shell,
            ToolContext::Chat
        ));
    }

    #[test]
    fn test_energy_cost_override() {
        let config = config_from(json!({"costs": {"web_search": 7}}));
        assert_eq!(config.get_energy_cost("web_search", 2), 7);
        assert_eq!(config.get_energy_cost("recall", 1), 1);
    }

    #[test]
    fn test_api_key_env_reference() {
        let config = config_from(json!({"api_keys": {
            "direct": "abc123",
            "via_env": "env:HEXIS_TEST_MISSING_KEY_VAR"
        }}));
        assert_eq!(config.get_api_key("direct"), Some("abc123".to_owned()));
        assert_eq!(config.get_api_key("via_env"), None);
        assert_eq!(config.get_api_key("absent"), None);
    }

    #[test]
    fn test_malformed_doc_yields_defaults() {
        let config = ToolsConfig::from_json(Some(json!("not an object")));
        assert!(config.enabled.is_none());
        assert!(config.disabled.is_empty());
    }
}

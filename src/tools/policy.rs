//! Policy enforcement for tool execution.
//!
//! Checks run in order, denying at the first failure with a typed kind:
//! 1. Tool enabled (global and context-specific)
//! 2. Context allowed (`spec.allowed_contexts`)
//! 3. Energy budget (heartbeat only)
//! 4. Boundary restrictions (active worldview memories)
//! 5. Approval requirements (first-use approval for sensitive tools)

use serde_json::json;

use crate::store::{Store, StoreResult};

use super::{ToolContext, ToolErrorType, ToolResult, ToolSpec, ToolsConfig};

/// Result of a policy check.
#[derive(Debug, Clone)]
pub struct PolicyCheckResult {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Denial reason.
    pub reason: Option<String>,
    /// Typed denial kind.
    pub error_type: Option<ToolErrorType>,
}

impl PolicyCheckResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            error_type: None,
        }
    }

    fn deny(reason: impl Into<String>, error_type: ToolErrorType) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            error_type: Some(error_type),
        }
    }

    /// Convert a denial into a [`ToolResult`].
    pub fn to_result(&self) -> ToolResult {
        ToolResult::error_result(
            self.reason.clone().unwrap_or_else(|| "Policy denied".to_owned()),
            self.error_type.unwrap_or(ToolErrorType::ExecutionFailed),
        )
    }
}

/// Policy gate consulted by the registry before every execution.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    store: Store,
}

impl ToolPolicy {
    /// Create a policy gate over the substrate.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run all checks in order; the first failure wins.
    pub async fn check_all(
        &self,
        spec: &ToolSpec,
        context: ToolContext,
        config: &ToolsConfig,
        energy_available: Option<i32>,
    ) -> StoreResult<PolicyCheckResult> {
        let result = check_enabled(spec, context, config);
        if !result.allowed {
            return Ok(result);
        }

        let result = check_context(spec, context);
        if !result.allowed {
            return Ok(result);
        }

        if context == ToolContext::Heartbeat {
            let result = check_energy(spec, config, energy_available);
            if !result.allowed {
                return Ok(result);
            }
        }

        let result = self.check_boundaries(spec).await?;
        if !result.allowed {
            return Ok(result);
        }

        self.check_approval(spec, context).await
    }

    /// Deny when an active worldview boundary restricts this tool or its
    /// category.
    async fn check_boundaries(&self, spec: &ToolSpec) -> StoreResult<PolicyCheckResult> {
        let boundary: Option<String> = sqlx::query_scalar(
            "SELECT content FROM memories
             WHERE type = 'worldview'
               AND metadata->>'category' = 'boundary'
               AND metadata->'restricts_tools' ? $1
               AND status = 'active'
             LIMIT 1",
        )
        .bind(&spec.name)
        .fetch_optional(self.store.pool())
        .await?;

        if let Some(text) = boundary {
            return Ok(PolicyCheckResult::deny(
                format!("Boundary restriction: {text}"),
                ToolErrorType::BoundaryViolation,
            ));
        }

        let boundary: Option<String> = sqlx::query_scalar(
            "SELECT content FROM memories
             WHERE type = 'worldview'
               AND metadata->>'category' = 'boundary'
               AND metadata->'restricts_categories' ? $1
               AND status = 'active'
             LIMIT 1",
        )
        .bind(spec.category.as_str())
        .fetch_optional(self.store.pool())
        .await?;

        if let Some(text) = boundary {
            return Ok(PolicyCheckResult::deny(
                format!(
                    "Boundary restriction on category '{}': {text}",
                    spec.category.as_str()
                ),
                ToolErrorType::BoundaryViolation,
            ));
        }

        Ok(PolicyCheckResult::allow())
    }

    /// Deny sensitive tools in the heartbeat context without a prior grant.
    /// Chat interaction provides implicit approval.
    async fn check_approval(
        &self,
        spec: &ToolSpec,
        context: ToolContext,
    ) -> StoreResult<PolicyCheckResult> {
        if !spec.requires_approval || context == ToolContext::Chat {
            return Ok(PolicyCheckResult::allow());
        }

        let approved: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM config WHERE key = 'tools.approvals' AND value ? $1",
        )
        .bind(&spec.name)
        .fetch_optional(self.store.pool())
        .await?;

        if approved.is_none() {
            return Ok(PolicyCheckResult::deny(
                format!(
                    "Tool '{}' requires approval for autonomous use",
                    spec.name
                ),
                ToolErrorType::ApprovalRequired,
            ));
        }
        Ok(PolicyCheckResult::allow())
    }
}

fn check_enabled(spec: &ToolSpec, context: ToolContext, config: &ToolsConfig) -> PolicyCheckResult {
    if !config.is_tool_enabled_for_context(&spec.name, spec.category, context) {
        return PolicyCheckResult::deny(
            format!("Tool '{}' is disabled", spec.name),
            ToolErrorType::Disabled,
        );
    }
    PolicyCheckResult::allow()
}

fn check_context(spec: &ToolSpec, context: ToolContext) -> PolicyCheckResult {
    if !spec.allowed_contexts.contains(&context) {
        return PolicyCheckResult::deny(
            format!(
                "Tool '{}' not allowed in {} context",
                spec.name,
                context.as_str()
            ),
            ToolErrorType::ContextDenied,
        );
    }
    PolicyCheckResult::allow()
}

fn check_energy(
    spec: &ToolSpec,
    config: &ToolsConfig,
    energy_available: Option<i32>,
) -> PolicyCheckResult {
    let Some(available) = energy_available else {
        return PolicyCheckResult::allow();
    };
    let cost = config.get_energy_cost(&spec.name, spec.energy_cost);

    let overrides = config.get_context_overrides(ToolContext::Heartbeat);
    if let Some(max_per_tool) = overrides.max_energy_per_tool {
        if cost > max_per_tool {
            return PolicyCheckResult::deny(
                format!(
                    "Tool '{}' cost ({cost}) exceeds max per tool ({max_per_tool})",
                    spec.name
                ),
                ToolErrorType::InsufficientEnergy,
            );
        }
    }

    if cost > available {
        return PolicyCheckResult::deny(
            format!("Insufficient energy: need {cost}, have {available}"),
            ToolErrorType::InsufficientEnergy,
        );
    }

    PolicyCheckResult::allow()
}

// ---------------------------------------------------------------------------
// Approval and boundary administration
// ---------------------------------------------------------------------------

/// Grant approval for autonomous use of a tool.
pub async fn grant_tool_approval(store: &Store, tool_name: &str) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO config (key, value, description, updated_at)
         VALUES ('tools.approvals', jsonb_build_array($1::text),
                 'Approved tools for autonomous use', now())
         ON CONFLICT (key) DO UPDATE SET
             value = CASE WHEN config.value ? $1 THEN config.value
                          ELSE config.value || jsonb_build_array($1::text) END,
             updated_at = now()",
    )
    .bind(tool_name)
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Revoke approval for autonomous use of a tool.
pub async fn revoke_tool_approval(store: &Store, tool_name: &str) -> StoreResult<()> {
    sqlx::query(
        "UPDATE config SET value = value - $1, updated_at = now()
         WHERE key = 'tools.approvals'",
    )
    .bind(tool_name)
    .execute(store.pool())
    .await?;
    Ok(())
}

/// List tools approved for autonomous use.
pub async fn list_approved_tools(store: &Store) -> StoreResult<Vec<String>> {
    let value = store.get_config("tools.approvals").await?;
    Ok(value
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default())
}

/// Create a worldview boundary memory restricting tools or categories.
pub async fn create_tool_boundary(
    store: &Store,
    content: &str,
    restricts_tools: &[String],
    restricts_categories: &[String],
) -> StoreResult<uuid::Uuid> {
    let mut metadata = json!({"category": "boundary"});
    if !restricts_tools.is_empty() {
        metadata["restricts_tools"] = json!(restricts_tools);
    }
    if !restricts_categories.is_empty() {
        metadata["restricts_categories"] = json!(restricts_categories);
    }

    let id: uuid::Uuid = sqlx::query_scalar(
        "INSERT INTO memories (type, content, importance, metadata)
         VALUES ('worldview', $1, 0.9, $2) RETURNING id",
    )
    .bind(content)
    .bind(&metadata)
    .fetch_one(store.pool())
    .await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolCategory;
    use serde_json::json;

    fn spec(contexts: Vec<ToolContext>, cost: i32) -> ToolSpec {
        ToolSpec {
            name: "probe".to_owned(),
            description: String::new(),
            parameters: json!({"type": "object", "properties": {}}),
            category: ToolCategory::Web,
            energy_cost: cost,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: contexts,
        }
    }

    #[test]
    fn test_context_denied() {
        let spec = spec(vec![ToolContext::Chat], 1);
        let result = check_context(&spec, ToolContext::Heartbeat);
        assert!(!result.allowed);
        assert_eq!(result.error_type, Some(ToolErrorType::ContextDenied));
    }

    #[test]
    fn test_energy_insufficient() {
        let spec = spec(ToolSpec::all_contexts(), 5);
        let config = ToolsConfig::default();
        let result = check_energy(&spec, &config, Some(3));
        assert!(!result.allowed);
        assert_eq!(result.error_type, Some(ToolErrorType::InsufficientEnergy));
    }

    #[test]
    fn test_energy_unbound_allows() {
        let spec = spec(ToolSpec::all_contexts(), 5);
        let config = ToolsConfig::default();
        assert!(check_energy(&spec, &config, None).allowed);
    }

    #[test]
    fn test_energy_max_per_tool() {
        let spec = spec(ToolSpec::all_contexts(), 5);
        let config = ToolsConfig::from_json(Some(json!({
            "context_overrides": {"heartbeat": {"max_energy_per_tool": 3}}
        })));
        let result = check_energy(&spec, &config, Some(100));
        assert!(!result.allowed);
        assert_eq!(result.error_type, Some(ToolErrorType::InsufficientEnergy));
    }

    #[test]
    fn test_disabled_tool() {
        let spec = spec(ToolSpec::all_contexts(), 1);
        let config = ToolsConfig::from_json(Some(json!({"disabled": ["probe"]})));
        let result = check_enabled(&spec, ToolContext::Chat, &config);
        assert!(!result.allowed);
        assert_eq!(result.error_type, Some(ToolErrorType::Disabled));
    }
}

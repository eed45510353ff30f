//! Central tool registry: registration, discovery, policy-gated execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::Store;

use super::config::{load_tools_config, ToolsConfig};
use super::policy::ToolPolicy;
use super::{ToolContext, ToolErrorType, ToolExecutionContext, ToolHandler, ToolResult, ToolSpec};

/// Wall-clock timeout for a single tool execution.
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a loaded [`ToolsConfig`] stays fresh.
const CONFIG_CACHE_TTL: Duration = Duration::from_secs(60);

/// Execution statistics accumulated per process.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    /// Total executions attempted.
    pub total_calls: u64,
    /// Successful executions.
    pub total_successes: u64,
    /// Failed executions (any error kind).
    pub total_failures: u64,
    /// Sum of wall-clock durations.
    pub total_duration: f64,
    /// Sum of energy charged.
    pub total_energy_spent: i64,
    /// Executions per tool name.
    pub calls_by_tool: HashMap<String, u64>,
    /// Failures per error kind.
    pub errors_by_type: HashMap<String, u64>,
}

impl ExecutionStats {
    fn record(&mut self, tool_name: &str, result: &ToolResult) {
        self.total_calls = self.total_calls.saturating_add(1);
        self.total_duration += result.duration_seconds;
        self.total_energy_spent = self
            .total_energy_spent
            .saturating_add(i64::from(result.energy_spent));
        let count = self.calls_by_tool.entry(tool_name.to_owned()).or_insert(0);
        *count = count.saturating_add(1);

        if result.success {
            self.total_successes = self.total_successes.saturating_add(1);
        } else {
            self.total_failures = self.total_failures.saturating_add(1);
            if let Some(kind) = result.error_type {
                let count = self
                    .errors_by_type
                    .entry(kind.as_str().to_owned())
                    .or_insert(0);
                *count = count.saturating_add(1);
            }
        }
    }
}

/// Cached configuration with its load time.
struct ConfigCache {
    config: Option<ToolsConfig>,
    loaded_at: Instant,
}

/// Central registry for all tools.
///
/// Manages registration, discovery, and execution with policy enforcement.
/// Later registrations under the same name overwrite earlier ones (with a
/// warning).
pub struct ToolRegistry {
    store: Store,
    handlers: Mutex<HashMap<String, Arc<dyn ToolHandler>>>,
    mcp_handlers: Mutex<HashMap<String, Arc<dyn ToolHandler>>>,
    policy: ToolPolicy,
    stats: Mutex<ExecutionStats>,
    config_cache: tokio::sync::Mutex<ConfigCache>,
    execution_timeout: Duration,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.lock().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("ToolRegistry")
            .field("tool_count", &count)
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry over the substrate.
    pub fn new(store: Store) -> Self {
        Self {
            policy: ToolPolicy::new(store.clone()),
            store,
            handlers: Mutex::new(HashMap::new()),
            mcp_handlers: Mutex::new(HashMap::new()),
            stats: Mutex::new(ExecutionStats::default()),
            config_cache: tokio::sync::Mutex::new(ConfigCache {
                config: None,
                loaded_at: Instant::now(),
            }),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    /// Override the execution timeout (build time only).
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// The substrate handle, for handlers that need raw access.
    pub fn store(&self) -> &Store {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a tool handler.
    pub fn register(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.spec().name;
        if let Ok(mut map) = self.handlers.lock() {
            if map.contains_key(&name) {
                warn!(tool = %name, "overwriting existing handler");
            }
            map.insert(name.clone(), handler);
            debug!(tool = %name, "registered tool");
        }
    }

    /// Register an MCP tool handler.
    pub fn register_mcp(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.spec().name;
        if let Ok(mut map) = self.mcp_handlers.lock() {
            if map.contains_key(&name) {
                warn!(tool = %name, "overwriting existing MCP handler");
            }
            map.insert(name.clone(), handler);
            debug!(tool = %name, "registered MCP tool");
        }
    }

    /// Remove a handler by name. Returns whether anything was removed.
    pub fn unregister(&self, name: &str) -> bool {
        if let Ok(mut map) = self.handlers.lock() {
            if map.remove(name).is_some() {
                return true;
            }
        }
        if let Ok(mut map) = self.mcp_handlers.lock() {
            return map.remove(name).is_some();
        }
        false
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Get a handler by name (built-in first, then MCP).
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        if let Ok(map) = self.handlers.lock() {
            if let Some(handler) = map.get(name) {
                return Some(Arc::clone(handler));
            }
        }
        self.mcp_handlers
            .lock()
            .ok()
            .and_then(|map| map.get(name).map(Arc::clone))
    }

    /// All registered handlers.
    pub fn list_all(&self) -> Vec<Arc<dyn ToolHandler>> {
        let mut out = Vec::new();
        if let Ok(map) = self.handlers.lock() {
            out.extend(map.values().map(Arc::clone));
        }
        if let Ok(map) = self.mcp_handlers.lock() {
            out.extend(map.values().map(Arc::clone));
        }
        out
    }

    /// All registered tool names.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.list_all().iter().map(|h| h.spec().name).collect();
        names.sort();
        names
    }

    /// Cached or fresh configuration (60-second TTL).
    pub async fn get_config(&self, force_refresh: bool) -> anyhow::Result<ToolsConfig> {
        let mut cache = self.config_cache.lock().await;
        let stale = cache.config.is_none() || cache.loaded_at.elapsed() > CONFIG_CACHE_TTL;
        if force_refresh || stale {
            let config = load_tools_config(&self.store).await?;
            cache.config = Some(config);
            cache.loaded_at = Instant::now();
        }
        cache
            .config
            .clone()
            .ok_or_else(|| anyhow::anyhow!("tools config unavailable"))
    }

    /// Handlers enabled for a context (policy steps: enabled + context).
    pub async fn get_enabled_tools(
        &self,
        context: ToolContext,
    ) -> anyhow::Result<Vec<Arc<dyn ToolHandler>>> {
        let config = self.get_config(false).await?;
        Ok(self
            .list_all()
            .into_iter()
            .filter(|handler| {
                let spec = handler.spec();
                config.is_tool_enabled_for_context(&spec.name, spec.category, context)
                    && spec.allowed_contexts.contains(&context)
            })
            .collect())
    }

    /// OpenAI function descriptors for tools enabled in a context.
    pub async fn get_specs(&self, context: ToolContext) -> anyhow::Result<Vec<serde_json::Value>> {
        let handlers = self.get_enabled_tools(context).await?;
        Ok(handlers
            .iter()
            .map(|h| h.spec().to_openai_function())
            .collect())
    }

    /// MCP descriptors for tools enabled in a context.
    pub async fn get_mcp_tools(
        &self,
        context: ToolContext,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let handlers = self.get_enabled_tools(context).await?;
        Ok(handlers.iter().map(|h| h.spec().to_mcp_tool()).collect())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute a tool with full policy enforcement.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
        context: ToolExecutionContext,
    ) -> ToolResult {
        let started = Instant::now();

        let Some(handler) = self.get(tool_name) else {
            let result =
                ToolResult::error_result(format!("Unknown tool: {tool_name}"), ToolErrorType::UnknownTool);
            self.record(tool_name, &result);
            return result;
        };
        let spec = handler.spec();

        let config = match self.get_config(false).await {
            Ok(config) => config,
            Err(e) => {
                let result = ToolResult::error_result(
                    format!("failed to load tools config: {e}"),
                    ToolErrorType::MissingConfig,
                );
                self.record(tool_name, &result);
                return result;
            }
        };

        let policy = self
            .policy
            .check_all(&spec, context.tool_context, &config, context.energy_available)
            .await;
        match policy {
            Ok(check) if !check.allowed => {
                let result = check.to_result();
                info!(tool = tool_name, reason = ?check.reason, "tool denied by policy");
                self.record(tool_name, &result);
                return result;
            }
            Err(e) => {
                let result = ToolResult::error_result(
                    format!("policy check failed: {e}"),
                    ToolErrorType::ExecutionFailed,
                );
                self.record(tool_name, &result);
                return result;
            }
            Ok(_) => {}
        }

        let validation_errors = handler.validate(arguments);
        if !validation_errors.is_empty() {
            let result = ToolResult::error_result(
                format!("Validation errors: {}", validation_errors.join(", ")),
                ToolErrorType::InvalidParams,
            );
            self.record(tool_name, &result);
            return result;
        }

        let mut result = match tokio::time::timeout(
            self.execution_timeout,
            handler.execute(arguments, &context),
        )
        .await
        {
            Ok(result) => {
                let mut result = result;
                result.energy_spent = config.get_energy_cost(tool_name, spec.energy_cost);
                result
            }
            Err(_) => ToolResult::error_result(
                format!(
                    "Tool execution timed out after {} seconds",
                    self.execution_timeout.as_secs()
                ),
                ToolErrorType::Timeout,
            ),
        };

        result.duration_seconds = started.elapsed().as_secs_f64();
        self.record(tool_name, &result);

        debug!(
            tool = tool_name,
            success = result.success,
            duration = result.duration_seconds,
            energy = result.energy_spent,
            "tool completed"
        );

        result
    }

    /// Execute a batch of calls.
    ///
    /// Parallel-safe calls run concurrently; the rest run strictly in their
    /// original order, each decrementing the shared energy budget. Results
    /// come back in the original call order.
    pub async fn execute_batch(
        &self,
        calls: &[(String, serde_json::Value)],
        context: &ToolExecutionContext,
    ) -> Vec<ToolResult> {
        let mut parallel_calls = Vec::new();
        let mut sequential_calls = Vec::new();

        for (index, (name, args)) in calls.iter().enumerate() {
            let parallel_safe = self
                .get(name)
                .map(|h| h.spec().supports_parallel)
                .unwrap_or(true);
            if parallel_safe {
                parallel_calls.push((index, name.clone(), args.clone()));
            } else {
                sequential_calls.push((index, name.clone(), args.clone()));
            }
        }

        let mut indexed: Vec<(usize, ToolResult)> = Vec::with_capacity(calls.len());

        let tasks: Vec<_> = parallel_calls
            .into_iter()
            .map(|(index, name, args)| {
                let call_context = fresh_call_context(context);
                async move {
                    let result = self.execute(&name, &args, call_context).await;
                    (index, result)
                }
            })
            .collect();
        indexed.extend(futures::future::join_all(tasks).await);

        let mut energy_available = context.energy_available;
        for (index, name, args) in sequential_calls {
            let mut call_context = fresh_call_context(context);
            call_context.energy_available = energy_available;
            let result = self.execute(&name, &args, call_context).await;
            if let Some(available) = energy_available {
                energy_available = Some(available.saturating_sub(result.energy_spent));
            }
            indexed.push((index, result));
        }

        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, result)| result).collect()
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    /// Snapshot the execution statistics.
    pub fn get_stats(&self) -> ExecutionStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Reset the execution statistics.
    pub fn reset_stats(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = ExecutionStats::default();
        }
    }

    fn record(&self, tool_name: &str, result: &ToolResult) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(tool_name, result);
        }
    }
}

/// Clone a context with a fresh call id.
fn fresh_call_context(context: &ToolExecutionContext) -> ToolExecutionContext {
    let mut fresh = context.clone();
    fresh.call_id = Uuid::new_v4().to_string();
    fresh
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent builder for constructing a [`ToolRegistry`].
pub struct ToolRegistryBuilder {
    store: Store,
    handlers: Vec<Arc<dyn ToolHandler>>,
    exclude: Vec<String>,
    include_only: Option<Vec<String>>,
    timeout: Option<Duration>,
}

impl ToolRegistryBuilder {
    /// Start a builder over the substrate.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            handlers: Vec::new(),
            exclude: Vec::new(),
            include_only: None,
            timeout: None,
        }
    }

    /// Add a single handler.
    pub fn add(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Add multiple handlers.
    pub fn add_all(mut self, handlers: Vec<Arc<dyn ToolHandler>>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Exclude tools by name.
    pub fn exclude(mut self, names: &[&str]) -> Self {
        self.exclude.extend(names.iter().map(|n| (*n).to_owned()));
        self
    }

    /// Only include the named tools.
    pub fn include_only(mut self, names: &[&str]) -> Self {
        self.include_only = Some(names.iter().map(|n| (*n).to_owned()).collect());
        self
    }

    /// Override the execution timeout.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the registry.
    pub fn build(self) -> ToolRegistry {
        let mut registry = ToolRegistry::new(self.store);
        if let Some(timeout) = self.timeout {
            registry = registry.with_execution_timeout(timeout);
        }

        for handler in self.handlers {
            let name = handler.spec().name;
            if self.exclude.contains(&name) {
                continue;
            }
            if let Some(include) = &self.include_only {
                if !include.contains(&name) {
                    continue;
                }
            }
            registry.register(handler);
        }

        registry
    }
}

/// Create a registry with all built-in tool families.
pub fn create_default_registry(store: Store) -> ToolRegistry {
    ToolRegistryBuilder::new(store.clone())
        .add_all(super::memory::create_memory_tools(store.clone()))
        .add_all(super::web::create_web_tools(store.clone()))
        .add_all(super::filesystem::create_filesystem_tools())
        .add_all(super::shell::create_shell_tools(false))
        .add_all(super::calendar::create_calendar_tools(store.clone()))
        .add_all(super::email::create_email_tools(store.clone()))
        .add_all(super::messaging::create_messaging_tools(store))
        .build()
}

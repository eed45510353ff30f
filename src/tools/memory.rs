//! Memory tools: recall, remember, concept exploration, goals, scheduling,
//! and the heartbeat-only user-message queue.
//!
//! Retrieval internals belong to the substrate; these handlers speak the
//! named operations only. Text relevance uses Postgres full-text search.

use async_trait::async_trait;
use serde_json::json;
use sqlx::Row;
use uuid::Uuid;

use crate::store::Store;

use super::{
    ToolCategory, ToolContext, ToolErrorType, ToolExecutionContext, ToolHandler, ToolResult,
    ToolSpec,
};

/// Memory types accepted from tool arguments.
const MEMORY_TYPES: &[&str] = &["episodic", "semantic", "procedural", "strategic"];

/// Search memories by text relevance.
pub struct RecallHandler {
    store: Store,
}

#[async_trait]
impl ToolHandler for RecallHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "recall".to_owned(),
            description: "Search memories by relevance. Use this to find memories related to \
                          a topic, concept, or question."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural language query describing what you want to remember."
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of memories to return (default: 5, max: 20).",
                        "default": 5, "minimum": 1, "maximum": 20
                    },
                    "memory_types": {
                        "type": "array",
                        "items": {"type": "string", "enum": MEMORY_TYPES},
                        "description": "Filter by memory types. Omit to search all types."
                    },
                    "min_importance": {
                        "type": "number",
                        "description": "Minimum importance score (0.0-1.0).",
                        "default": 0.0, "minimum": 0.0, "maximum": 1.0
                    }
                },
                "required": ["query"]
            }),
            category: ToolCategory::Memory,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _context: &ToolExecutionContext,
    ) -> ToolResult {
        let query = arguments
            .get("query")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let limit = arguments
            .get("limit")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(5)
            .clamp(1, 20);
        let min_importance = arguments
            .get("min_importance")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);
        let types: Option<Vec<String>> = arguments
            .get("memory_types")
            .and_then(serde_json::Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            });

        if let Some(types) = &types {
            if types.iter().any(|t| !MEMORY_TYPES.contains(&t.as_str())) {
                return ToolResult::error_result(
                    format!("Invalid memory type in {types:?}"),
                    ToolErrorType::InvalidParams,
                );
            }
        }

        let rows = sqlx::query(
            "SELECT id, type::text AS type, content, importance,
                    ts_rank(to_tsvector('english', content),
                            plainto_tsquery('english', $1)) AS rank
             FROM memories
             WHERE status = 'active'
               AND importance >= $2
               AND ($3::text[] IS NULL OR type::text = ANY($3))
               AND (to_tsvector('english', content) @@ plainto_tsquery('english', $1)
                    OR content ILIKE '%' || $1 || '%')
             ORDER BY rank DESC, importance DESC
             LIMIT $4",
        )
        .bind(query)
        .bind(min_importance)
        .bind(&types)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => return ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        };

        let mut memories = Vec::with_capacity(rows.len());
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = match row.try_get("id") {
                Ok(id) => id,
                Err(e) => {
                    return ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed)
                }
            };
            ids.push(id);
            memories.push(json!({
                "memory_id": id,
                "content": row.try_get::<String, _>("content").unwrap_or_default(),
                "type": row.try_get::<String, _>("type").unwrap_or_default(),
                "importance": row.try_get::<f32, _>("importance").unwrap_or(0.0),
            }));
        }

        // Touch accessed memories.
        if !ids.is_empty() {
            let _ = sqlx::query(
                "UPDATE memories SET accessed_at = now(), access_count = access_count + 1
                 WHERE id = ANY($1)",
            )
            .bind(&ids)
            .execute(self.store.pool())
            .await;
        }

        let count = memories.len();
        ToolResult::success_result(
            json!({"memories": memories, "count": count, "query": query}),
            Some(format!("Found {count} memories for '{query}'")),
        )
    }
}

/// Store a new memory.
pub struct RememberHandler {
    store: Store,
}

#[async_trait]
impl ToolHandler for RememberHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "remember".to_owned(),
            description: "Store a new memory. Use this to save important information, events, \
                          or learnings for future recall."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "The content to remember."},
                    "type": {
                        "type": "string", "enum": MEMORY_TYPES, "default": "episodic",
                        "description": "Type of memory to create."
                    },
                    "importance": {
                        "type": "number", "default": 0.5, "minimum": 0.0, "maximum": 1.0,
                        "description": "Importance score (0.0-1.0)."
                    },
                    "concepts": {
                        "type": "array", "items": {"type": "string"},
                        "description": "Concepts to link this memory to."
                    }
                },
                "required": ["content"]
            }),
            category: ToolCategory::Memory,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: false,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _context: &ToolExecutionContext,
    ) -> ToolResult {
        let content = arguments
            .get("content")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let memory_type = arguments
            .get("type")
            .and_then(serde_json::Value::as_str)
            .filter(|t| MEMORY_TYPES.contains(t))
            .unwrap_or("episodic");
        let importance = arguments
            .get("importance")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let concepts = arguments
            .get("concepts")
            .cloned()
            .unwrap_or_else(|| json!([]));

        let metadata = json!({"concepts": concepts});
        let inserted: Result<Uuid, sqlx::Error> = sqlx::query_scalar(
            "INSERT INTO memories (type, content, importance, metadata)
             VALUES ($1::memory_type, $2, $3, $4) RETURNING id",
        )
        .bind(memory_type)
        .bind(content)
        .bind(importance)
        .bind(&metadata)
        .fetch_one(self.store.pool())
        .await;

        match inserted {
            Ok(id) => {
                let preview: String = content.chars().take(50).collect();
                ToolResult::success_result(
                    json!({"memory_id": id, "content": preview}),
                    Some(format!("Stored memory: {preview}...")),
                )
            }
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Quick feeling-of-knowing check before a full recall.
pub struct SenseMemoryAvailabilityHandler {
    store: Store,
}

#[async_trait]
impl ToolHandler for SenseMemoryAvailabilityHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "sense_memory_availability".to_owned(),
            description: "Sense whether you likely have relevant memories before doing a full \
                          recall. Use this for a quick feeling-of-knowing check."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Topic to check memory availability for."}
                },
                "required": ["query"]
            }),
            category: ToolCategory::Memory,
            energy_cost: 0,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _context: &ToolExecutionContext,
    ) -> ToolResult {
        let query = arguments
            .get("query")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        let row = sqlx::query(
            "SELECT count(*) AS hits, COALESCE(max(importance), 0::real) AS strongest
             FROM memories
             WHERE status = 'active'
               AND (to_tsvector('english', content) @@ plainto_tsquery('english', $1)
                    OR content ILIKE '%' || $1 || '%')",
        )
        .bind(query)
        .fetch_one(self.store.pool())
        .await;

        match row {
            Ok(row) => {
                let hits: i64 = row.try_get("hits").unwrap_or(0);
                let strongest: f32 = row.try_get("strongest").unwrap_or(0.0);
                ToolResult::success_result(
                    json!({
                        "has_memories": hits > 0,
                        "match_count": hits,
                        "activation_strength": strongest,
                    }),
                    Some(format!("Memory availability: {strongest:.2}")),
                )
            }
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Explore memories connected to a concept.
pub struct ExploreConceptHandler {
    store: Store,
}

#[async_trait]
impl ToolHandler for ExploreConceptHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "explore_concept".to_owned(),
            description: "Explore memories connected to a specific concept. Shows how \
                          different memories relate to an idea and what other concepts are \
                          connected."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "concept": {"type": "string", "description": "The concept to explore."},
                    "include_related": {
                        "type": "boolean", "default": true,
                        "description": "Also return concepts linked from the same memories."
                    },
                    "limit": {
                        "type": "integer", "default": 5, "minimum": 1, "maximum": 20,
                        "description": "Maximum memories to return."
                    }
                },
                "required": ["concept"]
            }),
            category: ToolCategory::Memory,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _context: &ToolExecutionContext,
    ) -> ToolResult {
        let concept = arguments
            .get("concept")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let include_related = arguments
            .get("include_related")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        let limit = arguments
            .get("limit")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(5)
            .clamp(1, 20);

        let rows = sqlx::query(
            "SELECT id, content, type::text AS type, importance, metadata->'concepts' AS concepts
             FROM memories
             WHERE status = 'active' AND metadata->'concepts' ? $1
             ORDER BY importance DESC
             LIMIT $2",
        )
        .bind(concept)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => return ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        };

        let mut memories = Vec::with_capacity(rows.len());
        let mut related = std::collections::BTreeSet::new();
        for row in &rows {
            let id: Option<Uuid> = row.try_get("id").ok();
            memories.push(json!({
                "memory_id": id,
                "content": row.try_get::<String, _>("content").unwrap_or_default(),
                "type": row.try_get::<String, _>("type").unwrap_or_default(),
                "importance": row.try_get::<f32, _>("importance").unwrap_or(0.0),
            }));
            if include_related {
                let concepts: Option<serde_json::Value> = row.try_get("concepts").ok();
                if let Some(serde_json::Value::Array(list)) = concepts {
                    for c in list {
                        if let Some(name) = c.as_str() {
                            if name != concept {
                                related.insert(name.to_owned());
                            }
                        }
                    }
                }
            }
        }

        let count = memories.len();
        ToolResult::success_result(
            json!({
                "concept": concept,
                "memories": memories,
                "related_concepts": related.into_iter().collect::<Vec<_>>(),
                "count": count,
            }),
            Some(format!("Found {count} memories for concept '{concept}'")),
        )
    }
}

/// Retrieve procedural or strategic memories for a situation.
///
/// One handler covers both tools; they differ only in memory type and
/// framing.
pub struct TypedRecallHandler {
    store: Store,
    tool_name: &'static str,
    memory_type: &'static str,
    subject_field: &'static str,
    description: &'static str,
}

#[async_trait]
impl ToolHandler for TypedRecallHandler {
    fn spec(&self) -> ToolSpec {
        let mut properties = serde_json::Map::new();
        properties.insert(self.subject_field.to_owned(), json!({"type": "string"}));
        properties.insert(
            "limit".to_owned(),
            json!({
                "type": "integer", "default": 3, "minimum": 1, "maximum": 10,
                "description": "Maximum results to return."
            }),
        );
        ToolSpec {
            name: self.tool_name.to_owned(),
            description: self.description.to_owned(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": [self.subject_field]
            }),
            category: ToolCategory::Memory,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _context: &ToolExecutionContext,
    ) -> ToolResult {
        let subject = arguments
            .get(self.subject_field)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let limit = arguments
            .get("limit")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(3)
            .clamp(1, 10);

        let rows = sqlx::query(
            "SELECT id, content FROM memories
             WHERE status = 'active' AND type::text = $1
               AND (to_tsvector('english', content) @@ plainto_tsquery('english', $2)
                    OR content ILIKE '%' || $2 || '%')
             ORDER BY importance DESC
             LIMIT $3",
        )
        .bind(self.memory_type)
        .bind(subject)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await;

        match rows {
            Ok(rows) => {
                let items: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| {
                        json!({
                            "memory_id": row.try_get::<Uuid, _>("id").ok(),
                            "content": row.try_get::<String, _>("content").unwrap_or_default(),
                        })
                    })
                    .collect();
                let count = items.len();
                let mut output = serde_json::Map::new();
                output.insert("results".to_owned(), json!(items));
                output.insert("count".to_owned(), json!(count));
                output.insert(self.subject_field.to_owned(), json!(subject));
                ToolResult::success_result(
                    serde_json::Value::Object(output),
                    Some(format!("Found {count} {} memories", self.memory_type)),
                )
            }
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Create a new goal.
pub struct CreateGoalHandler {
    store: Store,
}

#[async_trait]
impl ToolHandler for CreateGoalHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "create_goal".to_owned(),
            description: "Create a new goal for the agent to pursue. Use this for reminders, \
                          TODOs, or longer-term objectives."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Short goal title."},
                    "description": {"type": "string", "description": "Optional longer description."},
                    "priority": {
                        "type": "string", "enum": ["active", "queued", "backburner"],
                        "default": "queued", "description": "Desired priority."
                    },
                    "source": {
                        "type": "string",
                        "enum": ["curiosity", "user_request", "identity", "derived", "external"],
                        "default": "user_request", "description": "Why this goal exists."
                    }
                },
                "required": ["title"]
            }),
            category: ToolCategory::Memory,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: false,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _context: &ToolExecutionContext,
    ) -> ToolResult {
        let title = arguments
            .get("title")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let description = arguments
            .get("description")
            .and_then(serde_json::Value::as_str);
        let priority = arguments
            .get("priority")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("queued");
        let source = arguments
            .get("source")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("user_request");

        let inserted: Result<Uuid, sqlx::Error> = sqlx::query_scalar(
            "INSERT INTO goals (title, description, priority, source)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(title)
        .bind(description)
        .bind(priority)
        .bind(source)
        .fetch_one(self.store.pool())
        .await;

        match inserted {
            Ok(id) => ToolResult::success_result(
                json!({"goal_id": id, "title": title, "priority": priority}),
                Some(format!("Created goal: {title}")),
            ),
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Create a scheduled task.
pub struct ScheduleTaskHandler {
    store: Store,
}

#[async_trait]
impl ToolHandler for ScheduleTaskHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "schedule_task".to_owned(),
            description: "Create a scheduled task. Use for recurring reminders or timed actions."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Short task name."},
                    "description": {"type": "string", "description": "Optional longer description."},
                    "schedule_kind": {
                        "type": "string", "enum": ["once", "interval", "daily", "weekly"],
                        "description": "Schedule type."
                    },
                    "schedule": {"type": "object", "description": "Schedule details for the selected type."},
                    "timezone": {"type": "string", "description": "IANA timezone name."},
                    "action_kind": {
                        "type": "string", "enum": ["queue_user_message", "create_goal"],
                        "description": "Action to perform when the schedule fires."
                    },
                    "action_payload": {"type": "object", "description": "Action payload."},
                    "max_runs": {
                        "type": "integer",
                        "description": "Optional max number of runs before auto-disable."
                    }
                },
                "required": ["name", "schedule_kind", "schedule", "action_kind", "action_payload"]
            }),
            category: ToolCategory::Memory,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: false,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _context: &ToolExecutionContext,
    ) -> ToolResult {
        let name = arguments
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let schedule_kind = arguments
            .get("schedule_kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let action_kind = arguments
            .get("action_kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let schedule = arguments
            .get("schedule")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let action_payload = arguments
            .get("action_payload")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let timezone = arguments.get("timezone").and_then(serde_json::Value::as_str);
        let description = arguments
            .get("description")
            .and_then(serde_json::Value::as_str);
        let max_runs = arguments
            .get("max_runs")
            .and_then(serde_json::Value::as_i64)
            .and_then(|v| i32::try_from(v).ok());

        let inserted: Result<Uuid, sqlx::Error> = sqlx::query_scalar(
            "INSERT INTO scheduled_tasks
                 (name, description, schedule_kind, schedule, timezone,
                  action_kind, action_payload, max_runs, created_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'agent') RETURNING id",
        )
        .bind(name)
        .bind(description)
        .bind(schedule_kind)
        .bind(&schedule)
        .bind(timezone)
        .bind(action_kind)
        .bind(&action_payload)
        .bind(max_runs)
        .fetch_one(self.store.pool())
        .await;

        match inserted {
            Ok(id) => ToolResult::success_result(
                json!({"task_id": id, "name": name}),
                Some(format!("Scheduled task: {name}")),
            ),
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Queue a message for external delivery to the user.
///
/// Heartbeat-only: enqueues an `outbox_message` external call whose
/// application creates the durable outbox row.
pub struct QueueUserMessageHandler {
    store: Store,
}

#[async_trait]
impl ToolHandler for QueueUserMessageHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "queue_user_message".to_owned(),
            description: "Queue a message for external delivery to the user.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Message body for the user."},
                    "intent": {
                        "type": "string",
                        "description": "Optional intent/category (e.g. 'reminder', 'status', 'question')."
                    }
                },
                "required": ["message"]
            }),
            category: ToolCategory::Memory,
            energy_cost: 0,
            requires_approval: false,
            is_read_only: false,
            supports_parallel: true,
            allowed_contexts: vec![ToolContext::Heartbeat],
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        _context: &ToolExecutionContext,
    ) -> ToolResult {
        let message = arguments
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let intent = arguments.get("intent").and_then(serde_json::Value::as_str);

        let input = json!({"message": message, "intent": intent});
        let inserted = self
            .store
            .enqueue_external_call("outbox_message", &input, None)
            .await;

        match inserted {
            Ok(_) => {
                let preview: String = message.chars().take(50).collect();
                ToolResult::success_result(
                    json!({"queued": true, "message": preview}),
                    Some(format!("Queued message: {preview}...")),
                )
            }
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Create all memory tool handlers.
pub fn create_memory_tools(store: Store) -> Vec<std::sync::Arc<dyn ToolHandler>> {
    vec![
        std::sync::Arc::new(RecallHandler {
            store: store.clone(),
        }),
        std::sync::Arc::new(RememberHandler {
            store: store.clone(),
        }),
        std::sync::Arc::new(SenseMemoryAvailabilityHandler {
            store: store.clone(),
        }),
        std::sync::Arc::new(ExploreConceptHandler {
            store: store.clone(),
        }),
        std::sync::Arc::new(TypedRecallHandler {
            store: store.clone(),
            tool_name: "get_procedures",
            memory_type: "procedural",
            subject_field: "task",
            description: "Retrieve procedural memories (how-to knowledge) for a specific task. \
                          Returns step-by-step instructions and prerequisites.",
        }),
        std::sync::Arc::new(TypedRecallHandler {
            store: store.clone(),
            tool_name: "get_strategies",
            memory_type: "strategic",
            subject_field: "situation",
            description: "Retrieve strategic memories (patterns, heuristics, lessons learned) \
                          applicable to a situation.",
        }),
        std::sync::Arc::new(CreateGoalHandler {
            store: store.clone(),
        }),
        std::sync::Arc::new(ScheduleTaskHandler {
            store: store.clone(),
        }),
        std::sync::Arc::new(QueueUserMessageHandler { store }),
    ]
}

//! Named store operations: gate predicates, heartbeat lifecycle, external-call
//! result application, termination, maintenance, and context snapshots.
//!
//! Each public method is atomic with respect to its declared side effects:
//! the status transition and the domain writes commit together or not at all.

use chrono::Utc;
use serde_json::json;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::calls::schemas::{GoalChange, HeartbeatDecision};

use super::error::{StoreError, StoreResult};
use super::types::{
    AppliedEffects, DecisionBatch, ExternalCall, HeartbeatState, OutboxPayload, StartedHeartbeat,
};
use super::Store;

/// Goal priorities accepted from LLM output; anything else is coerced to `queued`.
const GOAL_PRIORITIES: &[&str] = &["active", "queued", "backburner"];

/// Goal sources accepted from LLM output; anything else is coerced to `derived`.
const GOAL_SOURCES: &[&str] = &["curiosity", "user_request", "identity", "derived", "external"];

/// Default per-think-kind energy costs, overridable via config
/// `heartbeat.action_costs`.
const DEFAULT_ACTION_COSTS: &[(&str, i32)] = &[
    ("rest", 0),
    ("brainstorm_goals", 2),
    ("inquire_shallow", 2),
    ("inquire_deep", 4),
    ("reflect", 3),
    ("termination_confirm", 0),
    ("consent_request", 0),
];

// ---------------------------------------------------------------------------
// Config and predicates
// ---------------------------------------------------------------------------

impl Store {
    /// Read a config value by key.
    pub async fn get_config(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT value FROM config WHERE key = $1")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;
        Ok(value)
    }

    /// Upsert a config value.
    pub async fn set_config(
        &self,
        key: &str,
        value: &serde_json::Value,
        description: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO config (key, value, description, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .bind(description)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Upsert a control-plane state row.
    pub async fn set_state(&self, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        set_state(&mut *tx, key, value).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Read a control-plane state row.
    pub async fn get_state(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT value FROM state WHERE key = $1")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;
        Ok(value)
    }

    /// List all config rows as `(key, value)` pairs.
    pub async fn list_config(&self) -> StoreResult<Vec<(String, serde_json::Value)>> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(self.pool())
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("key")?, row.try_get("value")?));
        }
        Ok(out)
    }

    /// Whether initial configuration has been completed.
    pub async fn is_agent_configured(&self) -> StoreResult<bool> {
        let value = self.get_config("agent.is_configured").await?;
        Ok(matches!(value, Some(serde_json::Value::Bool(true))))
    }

    /// Whether the agent has been terminated.
    pub async fn is_agent_terminated(&self) -> StoreResult<bool> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT value FROM state WHERE key = 'agent.terminated'")
                .fetch_optional(self.pool())
                .await?;
        Ok(value
            .and_then(|v| v.get("terminated").and_then(serde_json::Value::as_bool))
            .unwrap_or(false))
    }

    /// Snapshot the heartbeat cadence singleton.
    pub async fn heartbeat_state(&self) -> StoreResult<HeartbeatState> {
        let row = sqlx::query(
            "SELECT is_paused, current_energy, max_energy, base_regeneration,
                    interval_minutes, last_user_contact, last_heartbeat_at
             FROM heartbeat_state WHERE id = 1",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(HeartbeatState {
            is_paused: row.try_get("is_paused")?,
            current_energy: row.try_get("current_energy")?,
            max_energy: row.try_get("max_energy")?,
            base_regeneration: row.try_get("base_regeneration")?,
            interval_minutes: row.try_get("interval_minutes")?,
            last_user_contact: row.try_get("last_user_contact")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        })
    }

    /// Whether a heartbeat is due: configured, not paused, interval elapsed.
    ///
    /// The config key `heartbeat.heartbeat_interval_minutes` overrides the
    /// singleton's interval when present.
    pub async fn should_run_heartbeat(&self) -> StoreResult<bool> {
        if !self.is_agent_configured().await? || self.is_agent_terminated().await? {
            return Ok(false);
        }
        let due: bool = sqlx::query_scalar(
            "SELECT NOT hs.is_paused
                    AND (hs.last_heartbeat_at IS NULL
                         OR hs.last_heartbeat_at <= now() - make_interval(mins => COALESCE(
                                (SELECT (value #>> '{}')::int FROM config
                                 WHERE key = 'heartbeat.heartbeat_interval_minutes'),
                                hs.interval_minutes)))
             FROM heartbeat_state hs WHERE hs.id = 1",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(due)
    }

    /// Whether substrate maintenance is due.
    pub async fn should_run_maintenance(&self) -> StoreResult<bool> {
        let due: bool = sqlx::query_scalar(
            "SELECT NOT is_paused
                    AND (last_run_at IS NULL
                         OR last_run_at <= now() - make_interval(secs => interval_seconds))
             FROM maintenance_state WHERE id = 1",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(due)
    }

    /// Whether the subconscious decider pass is due.
    pub async fn should_run_subconscious_decider(&self) -> StoreResult<bool> {
        let due: bool = sqlx::query_scalar(
            "SELECT NOT is_paused
                    AND (decider_last_run_at IS NULL
                         OR decider_last_run_at <= now() - make_interval(secs => decider_interval_seconds))
             FROM maintenance_state WHERE id = 1",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(due)
    }

    /// Stamp the subconscious decider as run, regardless of its outcome.
    pub async fn mark_subconscious_decider_run(&self) -> StoreResult<()> {
        sqlx::query("UPDATE maintenance_state SET decider_last_run_at = now() WHERE id = 1")
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Heartbeat lifecycle
// ---------------------------------------------------------------------------

impl Store {
    /// Start a heartbeat cycle if one is due.
    ///
    /// Returns `None` when the cadence gate says no.
    pub async fn run_heartbeat(&self) -> StoreResult<Option<StartedHeartbeat>> {
        if !self.should_run_heartbeat().await? {
            return Ok(None);
        }
        self.start_heartbeat().await.map(Some)
    }

    /// Atomically create an in-flight heartbeat and its initial
    /// `think/heartbeat_decision` external call.
    ///
    /// # Errors
    ///
    /// `AgentNotConfigured` / `AgentTerminated` when the gates fail.
    pub async fn start_heartbeat(&self) -> StoreResult<StartedHeartbeat> {
        if !self.is_agent_configured().await? {
            return Err(StoreError::AgentNotConfigured);
        }
        if self.is_agent_terminated().await? {
            return Err(StoreError::AgentTerminated);
        }

        let mut tx = self.pool().begin().await?;

        let heartbeat_id: Uuid =
            sqlx::query_scalar("INSERT INTO heartbeats DEFAULT VALUES RETURNING id")
                .fetch_one(&mut *tx)
                .await?;

        let context = gather_turn_context_tx(&mut *tx).await?;
        let input = json!({
            "kind": "heartbeat_decision",
            "heartbeat_id": heartbeat_id,
            "context": context,
            "max_tokens": 2048,
        });

        let call = insert_external_call(&mut *tx, "think", &input, Some(heartbeat_id)).await?;

        sqlx::query("UPDATE heartbeat_state SET last_heartbeat_at = now() WHERE id = 1")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(StartedHeartbeat {
            heartbeat_id,
            external_calls: vec![call],
        })
    }

    /// Execute decision actions starting at `start_index`, pausing at the
    /// first action that requires an external call.
    ///
    /// Idempotent with respect to already-applied actions: the heartbeat row
    /// records a monotonically non-decreasing `actions_index`, and execution
    /// resumes from `max(start_index, actions_index)`.
    pub async fn apply_heartbeat_decision(
        &self,
        heartbeat_id: Uuid,
        decision: &HeartbeatDecision,
        start_index: i32,
    ) -> StoreResult<DecisionBatch> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "SELECT actions_index, outcome, decision IS NULL AS decision_missing
             FROM heartbeats WHERE id = $1 FOR UPDATE",
        )
        .bind(heartbeat_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::HeartbeatNotFound(heartbeat_id))?;

        let outcome: String = row.try_get("outcome")?;
        if outcome == "terminated" {
            tx.commit().await?;
            return Ok(DecisionBatch {
                terminated: true,
                halt_reason: Some("terminated".to_owned()),
                ..DecisionBatch::default()
            });
        }
        if outcome == "finalized" {
            let memory_id = finalization_memory_id(&mut *tx, heartbeat_id).await?;
            tx.commit().await?;
            return Ok(DecisionBatch {
                completed: true,
                memory_id,
                halt_reason: Some("completed".to_owned()),
                ..DecisionBatch::default()
            });
        }

        let applied_index: i32 = row.try_get("actions_index")?;
        let decision_missing: bool = row.try_get("decision_missing")?;
        if decision_missing {
            let doc = serde_json::to_value(decision)
                .map_err(|e| StoreError::Malformed(e.to_string()))?;
            sqlx::query(
                "UPDATE heartbeats SET decision = $2, actions_planned = $3 WHERE id = $1",
            )
            .bind(heartbeat_id)
            .bind(&doc)
            .bind(doc.get("actions").cloned().unwrap_or_else(|| json!([])))
            .execute(&mut *tx)
            .await?;
        }

        let mut index = start_index.max(applied_index).max(0);
        let total = i32::try_from(decision.actions.len()).unwrap_or(i32::MAX);

        while index < total {
            let Some(action) = usize::try_from(index)
                .ok()
                .and_then(|i| decision.actions.get(i))
            else {
                break;
            };
            let next = index.saturating_add(1);

            match action.action.as_str() {
                "rest" | "goal_change" => {
                    index = next;
                }
                "tool_use" => {
                    let tool_name = action
                        .params
                        .get("tool_name")
                        .or_else(|| action.params.get("name"))
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default();
                    let arguments = action
                        .params
                        .get("arguments")
                        .or_else(|| action.params.get("params"))
                        .cloned()
                        .unwrap_or_else(|| json!({}));
                    let energy: i32 = sqlx::query_scalar(
                        "SELECT current_energy FROM heartbeat_state WHERE id = 1",
                    )
                    .fetch_one(&mut *tx)
                    .await?;

                    let input = json!({
                        "tool_name": tool_name,
                        "arguments": arguments,
                        "heartbeat_id": heartbeat_id,
                        "energy_available": energy,
                    });
                    let call =
                        insert_external_call(&mut *tx, "tool_use", &input, Some(heartbeat_id))
                            .await?;
                    advance_index(&mut *tx, heartbeat_id, next).await?;
                    tx.commit().await?;
                    return Ok(DecisionBatch {
                        pending_external_call_id: Some(call.id),
                        next_index: next,
                        ..DecisionBatch::default()
                    });
                }
                kind => {
                    if let Some(think_kind) = think_kind_for_action(kind) {
                        let context = gather_turn_context_tx(&mut *tx).await?;
                        let input = json!({
                            "kind": think_kind,
                            "heartbeat_id": heartbeat_id,
                            "context": context,
                            "params": action.params,
                            "depth": inquire_depth(kind),
                            "query": action.params.get("query").cloned(),
                        });
                        let call =
                            insert_external_call(&mut *tx, "think", &input, Some(heartbeat_id))
                                .await?;
                        advance_index(&mut *tx, heartbeat_id, next).await?;
                        tx.commit().await?;
                        return Ok(DecisionBatch {
                            pending_external_call_id: Some(call.id),
                            next_index: next,
                            ..DecisionBatch::default()
                        });
                    }
                    // Unknown action kinds are skipped rather than halting the cycle.
                    index = next;
                }
            }
        }

        let memory_id =
            finalize_heartbeat(&mut *tx, heartbeat_id, decision, total).await?;
        tx.commit().await?;

        Ok(DecisionBatch {
            completed: true,
            next_index: total,
            memory_id: Some(memory_id),
            halt_reason: Some("completed".to_owned()),
            ..DecisionBatch::default()
        })
    }

    /// Enqueue a pending external call directly.
    ///
    /// Used by tools (e.g. `queue_user_message`) and operators; heartbeat
    /// actions enqueue through `apply_heartbeat_decision` instead.
    pub async fn enqueue_external_call(
        &self,
        call_type: &str,
        input: &serde_json::Value,
        heartbeat_id: Option<Uuid>,
    ) -> StoreResult<ExternalCall> {
        let mut tx = self.pool().begin().await?;
        let call = insert_external_call(&mut *tx, call_type, input, heartbeat_id).await?;
        tx.commit().await?;
        Ok(call)
    }

    /// Append actions to a heartbeat's stored decision.
    ///
    /// Used when a refused termination supplies alternative actions that the
    /// cycle adopts as if they had been decided originally.
    pub async fn append_decision_actions(
        &self,
        heartbeat_id: Uuid,
        actions: &[crate::calls::schemas::DecisionAction],
    ) -> StoreResult<()> {
        let doc =
            serde_json::to_value(actions).map_err(|e| StoreError::Malformed(e.to_string()))?;
        sqlx::query(
            "UPDATE heartbeats
             SET decision = jsonb_set(
                     COALESCE(decision, '{}'::jsonb),
                     '{actions}',
                     COALESCE(decision->'actions', '[]'::jsonb) || $2::jsonb),
                 actions_planned = actions_planned || $2::jsonb
             WHERE id = $1",
        )
        .bind(heartbeat_id)
        .bind(&doc)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Atomically transition a `processing` call to `complete` and apply the
    /// per-kind domain effect.
    ///
    /// Invoking twice with the same id is a no-op after the first: the second
    /// call observes `status != processing` and returns empty effects.
    pub async fn apply_external_call_result(
        &self,
        call_id: Uuid,
        output: &serde_json::Value,
    ) -> StoreResult<AppliedEffects> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "UPDATE external_calls
             SET status = 'complete', output = $2, completed_at = now()
             WHERE id = $1 AND status = 'processing'
             RETURNING call_type, input, heartbeat_id",
        )
        .bind(call_id)
        .bind(output)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // Already complete (or failed): idempotent no-op.
            tx.commit().await?;
            return Ok(AppliedEffects::default());
        };

        let call_type: String = row.try_get("call_type")?;
        let input: serde_json::Value = row.try_get("input")?;
        let heartbeat_id: Option<Uuid> = row.try_get("heartbeat_id")?;

        let mut effects = AppliedEffects::default();

        match call_type.as_str() {
            "outbox_message" => {
                let payload = json!({
                    "content": input.get("message").cloned().unwrap_or(serde_json::Value::Null),
                    "intent": input.get("intent").cloned().unwrap_or(serde_json::Value::Null),
                });
                let id: Uuid = sqlx::query_scalar(
                    "INSERT INTO outbox_messages (kind, payload) VALUES ('user_message', $1)
                     RETURNING id",
                )
                .bind(&payload)
                .fetch_one(&mut *tx)
                .await?;
                effects.outbox_messages.push(OutboxPayload {
                    id,
                    kind: "user_message".to_owned(),
                    payload,
                });
            }
            "tool_use" => {
                let spent = output
                    .get("energy_spent")
                    .and_then(serde_json::Value::as_i64)
                    .and_then(|v| i32::try_from(v).ok())
                    .unwrap_or(0);
                charge_energy(&mut *tx, heartbeat_id, spent).await?;
            }
            "think" => {
                let kind = output
                    .get("kind")
                    .and_then(serde_json::Value::as_str)
                    .or_else(|| input.get("kind").and_then(serde_json::Value::as_str))
                    .unwrap_or("heartbeat_decision")
                    .to_owned();
                self.apply_think_effects(&mut *tx, &kind, &input, output, heartbeat_id, &mut effects)
                    .await?;
            }
            "embed" => {
                tx.rollback().await?;
                return Err(StoreError::EmbedUnsupported);
            }
            _ => {}
        }

        tx.commit().await?;
        Ok(effects)
    }

    /// Per-think-kind domain effects, run inside the completion transaction.
    async fn apply_think_effects(
        &self,
        tx: &mut PgConnection,
        kind: &str,
        input: &serde_json::Value,
        output: &serde_json::Value,
        heartbeat_id: Option<Uuid>,
        effects: &mut AppliedEffects,
    ) -> StoreResult<()> {
        let cost = self.think_action_cost(kind, input).await;
        charge_energy(tx, heartbeat_id, cost).await?;

        match kind {
            "brainstorm_goals" => {
                let goals = output
                    .get("goals")
                    .and_then(serde_json::Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for goal in goals {
                    let Some(title) = goal.get("title").and_then(serde_json::Value::as_str) else {
                        continue;
                    };
                    let priority = normalized(&goal, "priority", GOAL_PRIORITIES, "queued");
                    let source = normalized(&goal, "source", GOAL_SOURCES, "derived");
                    let id: Uuid = sqlx::query_scalar(
                        "INSERT INTO goals (title, description, priority, source, due_at)
                         VALUES ($1, $2, $3, $4, $5) RETURNING id",
                    )
                    .bind(title)
                    .bind(goal.get("description").and_then(serde_json::Value::as_str))
                    .bind(priority)
                    .bind(source)
                    .bind(
                        goal.get("due_at")
                            .and_then(serde_json::Value::as_str)
                            .and_then(|s| s.parse::<chrono::DateTime<Utc>>().ok()),
                    )
                    .fetch_one(&mut *tx)
                    .await?;
                    effects.created_ids.push(id);
                }
            }
            "inquire" => {
                let result = output.get("result").cloned().unwrap_or_else(|| json!({}));
                let summary = result
                    .get("summary")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                if !summary.is_empty() {
                    let metadata = json!({
                        "origin": "inquiry",
                        "query": output.get("query"),
                        "depth": output.get("depth"),
                        "confidence": result.get("confidence"),
                        "sources": result.get("sources"),
                    });
                    let id: Uuid = sqlx::query_scalar(
                        "INSERT INTO memories (type, content, importance, metadata)
                         VALUES ('semantic', $1, 0.6, $2) RETURNING id",
                    )
                    .bind(summary)
                    .bind(&metadata)
                    .fetch_one(&mut *tx)
                    .await?;
                    effects.created_ids.push(id);
                }
            }
            "reflect" => {
                let result = output.get("result").cloned().unwrap_or_else(|| json!({}));
                let insights = result
                    .get("insights")
                    .and_then(serde_json::Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for insight in insights {
                    let Some(content) =
                        insight.get("content").and_then(serde_json::Value::as_str)
                    else {
                        continue;
                    };
                    let metadata = json!({
                        "origin": "reflection",
                        "category": insight.get("category"),
                        "confidence": insight.get("confidence"),
                    });
                    let id: Uuid = sqlx::query_scalar(
                        "INSERT INTO memories (type, content, importance, metadata)
                         VALUES ('semantic', $1, 0.55, $2) RETURNING id",
                    )
                    .bind(content)
                    .bind(&metadata)
                    .fetch_one(&mut *tx)
                    .await?;
                    effects.created_ids.push(id);
                }
                // Confidence adjustments proposed against existing beliefs.
                let updates = result
                    .get("worldview_updates")
                    .and_then(serde_json::Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for update in updates {
                    let Some(id) = update
                        .get("id")
                        .and_then(serde_json::Value::as_str)
                        .and_then(|s| s.parse::<Uuid>().ok())
                    else {
                        continue;
                    };
                    let Some(confidence) = update
                        .get("new_confidence")
                        .and_then(serde_json::Value::as_f64)
                    else {
                        continue;
                    };
                    // Deliberate-transformation beliefs only move through their
                    // own protocol; plain beliefs accept confidence updates.
                    sqlx::query(
                        "UPDATE memories
                         SET metadata = metadata || jsonb_build_object('confidence', $2::float8)
                         WHERE id = $1 AND type = 'worldview'
                           AND COALESCE(metadata->>'change_requires', '')
                               <> 'deliberate_transformation'",
                    )
                    .bind(id)
                    .bind(confidence.clamp(0.0, 1.0))
                    .execute(&mut *tx)
                    .await?;
                }
            }
            "termination_confirm" => {
                let confirm = output
                    .get("confirm")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if confirm {
                    let last_will = output
                        .get("last_will")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default();
                    let farewells = output
                        .get("farewells")
                        .cloned()
                        .unwrap_or_else(|| json!([]));
                    let options = output
                        .get("options")
                        .cloned()
                        .unwrap_or_else(|| json!({}));
                    terminate_agent_tx(tx, last_will, &farewells, &options).await?;
                    if let Some(hb) = heartbeat_id {
                        sqlx::query(
                            "UPDATE heartbeats SET outcome = 'terminated', completed_at = now()
                             WHERE id = $1",
                        )
                        .bind(hb)
                        .execute(&mut *tx)
                        .await?;
                    }
                    effects.terminated = true;
                } else {
                    // Record the refusal; the cycle continues with the
                    // alternative actions applied as if they were the decision.
                    set_state(tx, "termination.refusal.latest", output).await?;
                }
            }
            "consent_request" => {
                set_state(tx, "consent.response.latest", output).await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Resolved energy cost for a think kind, honoring `heartbeat.action_costs`.
    async fn think_action_cost(&self, kind: &str, input: &serde_json::Value) -> i32 {
        let effective = if kind == "inquire" {
            match input.get("depth").and_then(serde_json::Value::as_str) {
                Some("inquire_deep") => "inquire_deep",
                _ => "inquire_shallow",
            }
        } else {
            kind
        };

        if let Ok(Some(overrides)) = self.get_config("heartbeat.action_costs").await {
            if let Some(cost) = overrides
                .get(effective)
                .and_then(serde_json::Value::as_i64)
                .and_then(|v| i32::try_from(v).ok())
            {
                return cost;
            }
        }

        DEFAULT_ACTION_COSTS
            .iter()
            .find(|(name, _)| *name == effective)
            .map(|(_, cost)| *cost)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Memories and goals (named operations; retrieval internals live substrate-side)
// ---------------------------------------------------------------------------

impl Store {
    /// Create a memory row.
    pub async fn create_memory(
        &self,
        memory_type: &str,
        content: &str,
        importance: f64,
        metadata: &serde_json::Value,
    ) -> StoreResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO memories (type, content, importance, metadata)
             VALUES ($1::memory_type, $2, $3, $4) RETURNING id",
        )
        .bind(memory_type)
        .bind(content)
        .bind(importance)
        .bind(metadata)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    /// Read a memory as a JSON document.
    pub async fn get_memory(&self, id: Uuid) -> StoreResult<Option<serde_json::Value>> {
        let doc: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT jsonb_build_object('id', id, 'type', type, 'content', content,
                    'importance', importance, 'metadata', metadata, 'status', status)
             FROM memories WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(doc)
    }

    /// Create a goal row.
    pub async fn create_goal(
        &self,
        title: &str,
        description: Option<&str>,
        priority: &str,
        source: &str,
    ) -> StoreResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO goals (title, description, priority, source)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(title)
        .bind(description)
        .bind(priority)
        .bind(source)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    /// Open goals as JSON documents, newest first.
    pub async fn list_open_goals(&self) -> StoreResult<Vec<serde_json::Value>> {
        fetch_json_rows(
            self.pool(),
            "SELECT jsonb_build_object('id', id, 'title', title, 'priority', priority,
                    'source', source, 'status', status)
             FROM goals WHERE status = 'open' ORDER BY created_at DESC",
        )
        .await
    }

    /// Outcome column of a heartbeat row.
    pub async fn heartbeat_outcome(&self, id: Uuid) -> StoreResult<Option<String>> {
        let outcome: Option<String> =
            sqlx::query_scalar("SELECT outcome FROM heartbeats WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

impl Store {
    /// Commit agent termination: flag state, pause the heartbeat, close any
    /// running cycles, and record the last will as an episodic memory.
    pub async fn terminate_agent(
        &self,
        last_will: &str,
        farewells: &serde_json::Value,
        options: &serde_json::Value,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        terminate_agent_tx(&mut *tx, last_will, farewells, options).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Termination inside an existing transaction.
async fn terminate_agent_tx(
    tx: &mut PgConnection,
    last_will: &str,
    farewells: &serde_json::Value,
    options: &serde_json::Value,
) -> StoreResult<()> {
    let record = json!({
        "terminated": true,
        "last_will": last_will,
        "farewells": farewells,
        "options": options,
        "terminated_at": Utc::now(),
    });
    set_state(tx, "agent.terminated", &record).await?;

    sqlx::query("UPDATE heartbeat_state SET is_paused = TRUE WHERE id = 1")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE heartbeats SET outcome = 'terminated', completed_at = now()
         WHERE outcome = 'running'",
    )
    .execute(&mut *tx)
    .await?;

    if !last_will.is_empty() {
        sqlx::query(
            "INSERT INTO memories (type, content, importance, metadata)
             VALUES ('episodic', $1, 1.0, '{\"origin\": \"termination\"}')",
        )
        .bind(last_will)
        .execute(&mut *tx)
        .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Context snapshots, working memory, maintenance
// ---------------------------------------------------------------------------

impl Store {
    /// JSON snapshot fed to the heartbeat decision LLM.
    pub async fn gather_turn_context(&self) -> StoreResult<serde_json::Value> {
        let mut tx = self.pool().begin().await?;
        let ctx = gather_turn_context_tx(&mut *tx).await?;
        tx.commit().await?;
        Ok(ctx)
    }

    /// JSON snapshot fed to the subconscious decider LLM.
    pub async fn get_subconscious_context(&self) -> StoreResult<serde_json::Value> {
        let memories = fetch_json_rows(
            self.pool(),
            "SELECT jsonb_build_object('id', id, 'type', type, 'content', content,
                    'importance', importance, 'metadata', metadata)
             FROM memories WHERE status = 'active'
             ORDER BY created_at DESC LIMIT 20",
        )
        .await?;
        let goals = fetch_json_rows(
            self.pool(),
            "SELECT jsonb_build_object('id', id, 'title', title, 'priority', priority,
                    'source', source, 'status', status)
             FROM goals WHERE status = 'open' ORDER BY created_at DESC LIMIT 20",
        )
        .await?;
        let recent_heartbeats: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM heartbeats WHERE started_at > now() - INTERVAL '1 day'",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(json!({
            "recent_memories": memories,
            "active_goals": goals,
            "heartbeats_last_day": recent_heartbeats,
        }))
    }

    /// Append an ingress note to working memory with the given TTL.
    pub async fn add_to_working_memory(&self, content: &str, ttl_secs: i64) -> StoreResult<Uuid> {
        let secs = f64::from(i32::try_from(ttl_secs.max(0)).unwrap_or(i32::MAX));
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO working_memory (content, expires_at)
             VALUES ($1, now() + make_interval(secs => $2)) RETURNING id",
        )
        .bind(content)
        .bind(secs)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    /// Stamp `last_user_contact`, atomically with the caller's ingress write.
    pub async fn bump_last_user_contact(&self) -> StoreResult<()> {
        sqlx::query("UPDATE heartbeat_state SET last_user_contact = now() WHERE id = 1")
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Run substrate maintenance when due.
    ///
    /// Returns `None` when not due, else a stats document.
    pub async fn run_maintenance_if_due(
        &self,
        stats_hint: &serde_json::Value,
    ) -> StoreResult<Option<serde_json::Value>> {
        if !self.should_run_maintenance().await? {
            return Ok(None);
        }

        let mut tx = self.pool().begin().await?;

        let pruned = sqlx::query("DELETE FROM working_memory WHERE expires_at < now()")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let archived = sqlx::query(
            "UPDATE memories SET status = 'archived'
             WHERE status = 'active' AND type = 'episodic' AND importance < 0.2
               AND created_at < now() - INTERVAL '30 days'
               AND (accessed_at IS NULL OR accessed_at < now() - INTERVAL '30 days')",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Regenerate a slice of energy on the maintenance cadence as well, so
        // a paused-then-resumed agent does not wake up drained.
        sqlx::query(
            "UPDATE heartbeat_state
             SET current_energy = LEAST(max_energy, current_energy + 1) WHERE id = 1",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE maintenance_state SET last_run_at = now() WHERE id = 1")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(json!({
            "skipped": false,
            "working_memory_pruned": pruned,
            "memories_archived": archived,
            "hint": stats_hint,
        })))
    }

    /// Apply the subconscious decider's observation lists.
    ///
    /// Each observation becomes a low-importance semantic memory tagged with
    /// its category; returns per-category counts.
    pub async fn apply_subconscious_observations(
        &self,
        observations: &serde_json::Value,
    ) -> StoreResult<serde_json::Value> {
        let mut tx = self.pool().begin().await?;
        let mut counts = serde_json::Map::new();

        for category in [
            "narrative_observations",
            "relationship_observations",
            "contradiction_observations",
            "emotional_observations",
            "consolidation_observations",
        ] {
            let list = observations
                .get(category)
                .and_then(serde_json::Value::as_array)
                .cloned()
                .unwrap_or_default();
            let mut applied: u64 = 0;
            for obs in list {
                let content = obs
                    .get("content")
                    .or_else(|| obs.get("observation"))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                if content.is_empty() {
                    continue;
                }
                let metadata = json!({"origin": "subconscious", "category": category});
                sqlx::query(
                    "INSERT INTO memories (type, content, importance, metadata)
                     VALUES ('semantic', $1, 0.3, $2)",
                )
                .bind(content)
                .bind(&metadata)
                .execute(&mut *tx)
                .await?;
                applied = applied.saturating_add(1);
            }
            counts.insert(category.to_owned(), json!(applied));
        }

        tx.commit().await?;
        Ok(serde_json::Value::Object(counts))
    }

    /// Rescue calls stuck in `processing` longer than `older_than_secs`.
    ///
    /// Not wired into any loop; the reaper is future work. Safe because no
    /// external side effect commits until `apply_external_call_result` runs.
    pub async fn requeue_stale_calls(&self, older_than_secs: i64) -> StoreResult<u64> {
        let secs = f64::from(i32::try_from(older_than_secs.max(0)).unwrap_or(i32::MAX));
        let affected = sqlx::query(
            "UPDATE external_calls
             SET status = 'pending', started_at = NULL
             WHERE status = 'processing'
               AND started_at < now() - make_interval(secs => $1)",
        )
        .bind(secs)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

impl Store {
    /// Pending outbox rows in write order, up to `limit`.
    pub async fn pending_outbox(&self, limit: i64) -> StoreResult<Vec<OutboxPayload>> {
        let rows = sqlx::query(
            "SELECT id, kind, payload FROM outbox_messages
             WHERE status = 'pending' ORDER BY created_at, id LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(OutboxPayload {
                id: row.try_get("id")?,
                kind: row.try_get("kind")?,
                payload: row.try_get("payload")?,
            });
        }
        Ok(out)
    }

    /// Mark an outbox row sent after a successful broker ack.
    pub async fn mark_outbox_sent(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "UPDATE outbox_messages SET status = 'sent', sent_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Mark an outbox row failed with the broker error.
    pub async fn mark_outbox_failed(&self, id: Uuid, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE outbox_messages SET status = 'failed', error_message = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Insert a pending external call and return it in claimed shape.
async fn insert_external_call(
    tx: &mut PgConnection,
    call_type: &str,
    input: &serde_json::Value,
    heartbeat_id: Option<Uuid>,
) -> StoreResult<ExternalCall> {
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO external_calls (call_type, input, heartbeat_id)
         VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(call_type)
    .bind(input)
    .bind(heartbeat_id)
    .fetch_one(&mut *tx)
    .await?;
    Ok(ExternalCall {
        id,
        call_type: call_type.to_owned(),
        input: input.clone(),
        heartbeat_id,
        retry_count: 0,
    })
}

/// Monotonically advance a heartbeat's action index.
async fn advance_index(tx: &mut PgConnection, heartbeat_id: Uuid, next: i32) -> StoreResult<()> {
    sqlx::query(
        "UPDATE heartbeats SET actions_index = GREATEST(actions_index, $2) WHERE id = $1",
    )
    .bind(heartbeat_id)
    .bind(next)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

/// Finalize a completed heartbeat: apply goal changes, regenerate energy,
/// write the summary memory, flip the outcome.
async fn finalize_heartbeat(
    tx: &mut PgConnection,
    heartbeat_id: Uuid,
    decision: &HeartbeatDecision,
    total_actions: i32,
) -> StoreResult<Uuid> {
    for change in &decision.goal_changes {
        apply_goal_change(tx, change).await?;
    }

    sqlx::query(
        "UPDATE heartbeat_state
         SET current_energy = LEAST(max_energy, current_energy + base_regeneration)
         WHERE id = 1",
    )
    .execute(&mut *tx)
    .await?;

    let summary = if decision.reasoning.is_empty() {
        format!("Heartbeat completed with {total_actions} actions.")
    } else {
        format!(
            "Heartbeat completed with {total_actions} actions. Reasoning: {}",
            decision.reasoning
        )
    };
    let metadata = json!({"origin": "heartbeat", "heartbeat_id": heartbeat_id});
    let memory_id: Uuid = sqlx::query_scalar(
        "INSERT INTO memories (type, content, importance, metadata)
         VALUES ('episodic', $1, 0.4, $2) RETURNING id",
    )
    .bind(&summary)
    .bind(&metadata)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE heartbeats
         SET outcome = 'finalized', completed_at = now(),
             actions_index = GREATEST(actions_index, $2),
             decision = COALESCE(decision, '{}'::jsonb)
                 || jsonb_build_object('memory_id', $3::text)
         WHERE id = $1",
    )
    .bind(heartbeat_id)
    .bind(total_actions)
    .bind(memory_id.to_string())
    .execute(&mut *tx)
    .await?;

    Ok(memory_id)
}

/// Recover the finalization memory id for an already-finalized heartbeat.
async fn finalization_memory_id(
    tx: &mut PgConnection,
    heartbeat_id: Uuid,
) -> StoreResult<Option<Uuid>> {
    let id: Option<String> =
        sqlx::query_scalar("SELECT decision->>'memory_id' FROM heartbeats WHERE id = $1")
            .bind(heartbeat_id)
            .fetch_optional(&mut *tx)
            .await?
            .flatten();
    Ok(id.and_then(|s| s.parse().ok()))
}

/// Apply a single goal change from a decision.
async fn apply_goal_change(tx: &mut PgConnection, change: &GoalChange) -> StoreResult<()> {
    let Ok(goal_id) = change.goal_id.parse::<Uuid>() else {
        return Ok(());
    };
    match change.change.as_str() {
        "activate" => {
            sqlx::query("UPDATE goals SET priority = 'active' WHERE id = $1")
                .bind(goal_id)
                .execute(&mut *tx)
                .await?;
        }
        "queued" | "backburner" => {
            sqlx::query("UPDATE goals SET priority = $2 WHERE id = $1")
                .bind(goal_id)
                .bind(&change.change)
                .execute(&mut *tx)
                .await?;
        }
        "complete" => {
            sqlx::query("UPDATE goals SET status = 'completed' WHERE id = $1")
                .bind(goal_id)
                .execute(&mut *tx)
                .await?;
        }
        "abandon" => {
            sqlx::query("UPDATE goals SET status = 'abandoned' WHERE id = $1")
                .bind(goal_id)
                .execute(&mut *tx)
                .await?;
        }
        _ => {}
    }
    Ok(())
}

/// Deduct energy from the singleton (floor 0) and account it on the heartbeat.
async fn charge_energy(
    tx: &mut PgConnection,
    heartbeat_id: Option<Uuid>,
    amount: i32,
) -> StoreResult<()> {
    if amount <= 0 {
        return Ok(());
    }
    sqlx::query(
        "UPDATE heartbeat_state
         SET current_energy = GREATEST(0, current_energy - $1) WHERE id = 1",
    )
    .bind(amount)
    .execute(&mut *tx)
    .await?;
    if let Some(hb) = heartbeat_id {
        sqlx::query("UPDATE heartbeats SET energy_spent = energy_spent + $2 WHERE id = $1")
            .bind(hb)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
    }
    Ok(())
}

/// Upsert a state row.
async fn set_state(
    tx: &mut PgConnection,
    key: &str,
    value: &serde_json::Value,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO state (key, value, updated_at) VALUES ($1, $2, now())
         ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = now()",
    )
    .bind(key)
    .bind(value)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

/// Build the turn-context snapshot inside a transaction.
async fn gather_turn_context_tx(tx: &mut PgConnection) -> StoreResult<serde_json::Value> {
    let hb = sqlx::query(
        "SELECT current_energy, max_energy, last_user_contact, last_heartbeat_at
         FROM heartbeat_state WHERE id = 1",
    )
    .fetch_one(&mut *tx)
    .await?;

    let objectives: Option<serde_json::Value> =
        sqlx::query_scalar("SELECT value FROM config WHERE key = 'agent.objectives'")
            .fetch_optional(&mut *tx)
            .await?;

    let goals: Vec<serde_json::Value> = sqlx::query_scalar(
        "SELECT jsonb_build_object('id', id, 'title', title, 'description', description,
                'priority', priority, 'source', source, 'due_at', due_at)
         FROM goals WHERE status = 'open'
         ORDER BY CASE priority WHEN 'active' THEN 0 WHEN 'queued' THEN 1 ELSE 2 END,
                  created_at DESC
         LIMIT 10",
    )
    .fetch_all(&mut *tx)
    .await?;

    let recent_memories: Vec<serde_json::Value> = sqlx::query_scalar(
        "SELECT jsonb_build_object('id', id, 'type', type, 'content', content,
                'importance', importance)
         FROM memories WHERE status = 'active'
         ORDER BY created_at DESC LIMIT 5",
    )
    .fetch_all(&mut *tx)
    .await?;

    let working_notes: Vec<String> = sqlx::query_scalar(
        "SELECT content FROM working_memory WHERE expires_at > now()
         ORDER BY created_at DESC LIMIT 10",
    )
    .fetch_all(&mut *tx)
    .await?;

    let energy: i32 = hb.try_get("current_energy")?;
    let max_energy: i32 = hb.try_get("max_energy")?;
    let last_user_contact: Option<chrono::DateTime<Utc>> = hb.try_get("last_user_contact")?;
    let last_heartbeat_at: Option<chrono::DateTime<Utc>> = hb.try_get("last_heartbeat_at")?;

    Ok(json!({
        "energy": energy,
        "max_energy": max_energy,
        "objectives": objectives,
        "active_goals": goals,
        "recent_memories": recent_memories,
        "working_memory": working_notes,
        "last_user_contact": last_user_contact,
        "last_heartbeat_at": last_heartbeat_at,
        "now": Utc::now(),
    }))
}

/// Fetch a list of single-column JSONB rows.
async fn fetch_json_rows(
    pool: &sqlx::PgPool,
    sql: &str,
) -> StoreResult<Vec<serde_json::Value>> {
    Ok(sqlx::query_scalar(sql).fetch_all(pool).await?)
}

/// Normalize an enum-ish string field against an allow list.
fn normalized<'a>(
    doc: &'a serde_json::Value,
    key: &str,
    allowed: &[&'a str],
    default: &'a str,
) -> &'a str {
    doc.get(key)
        .and_then(serde_json::Value::as_str)
        .filter(|v| allowed.contains(v))
        .unwrap_or(default)
}

/// Map a decision action name to its think-call kind, if it is one.
fn think_kind_for_action(action: &str) -> Option<&'static str> {
    match action {
        "brainstorm_goals" => Some("brainstorm_goals"),
        "inquire" | "inquire_shallow" | "inquire_deep" => Some("inquire"),
        "reflect" => Some("reflect"),
        "terminate" | "termination_confirm" => Some("termination_confirm"),
        "consent_request" => Some("consent_request"),
        "heartbeat_decision" => Some("heartbeat_decision"),
        _ => None,
    }
}

/// Resolve the inquiry depth recorded on the call input.
fn inquire_depth(action: &str) -> &'static str {
    match action {
        "inquire_deep" => "inquire_deep",
        _ => "inquire_shallow",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_think_kind_mapping() {
        assert_eq!(think_kind_for_action("brainstorm_goals"), Some("brainstorm_goals"));
        assert_eq!(think_kind_for_action("inquire_deep"), Some("inquire"));
        assert_eq!(think_kind_for_action("terminate"), Some("termination_confirm"));
        assert_eq!(think_kind_for_action("tool_use"), None);
        assert_eq!(think_kind_for_action("rest"), None);
    }

    #[test]
    fn test_inquire_depth() {
        assert_eq!(inquire_depth("inquire_deep"), "inquire_deep");
        assert_eq!(inquire_depth("inquire_shallow"), "inquire_shallow");
        assert_eq!(inquire_depth("inquire"), "inquire_shallow");
    }

    #[test]
    fn test_normalized_field() {
        let doc = json!({"priority": "active", "source": "bogus"});
        assert_eq!(normalized(&doc, "priority", GOAL_PRIORITIES, "queued"), "active");
        assert_eq!(normalized(&doc, "source", GOAL_SOURCES, "derived"), "derived");
        assert_eq!(normalized(&doc, "missing", GOAL_SOURCES, "derived"), "derived");
    }
}

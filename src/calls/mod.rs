//! External-call processing: the worker side of the durable queue.
//!
//! A claimed call is serviced by kind — `think` calls go to the LLM bound for
//! the role and parse into per-kind JSON schemas; `tool_use` calls dispatch
//! through the tool registry — and the result is applied back through the
//! broker so the status transition and domain effects commit together.

pub mod prompts;
pub mod schemas;

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::CallBroker;
use crate::heartbeat::{self, RunOutcome};
use crate::llm::json::chat_json;
use crate::llm::{load_llm_binding, resolve_provider, ChatMessage};
use crate::store::{AppliedEffects, ExternalCall, Store};
use crate::tools::{ToolContext, ToolExecutionContext, ToolRegistry};

use schemas::HeartbeatDecision;

/// Cap on context JSON embedded into a prompt.
const MAX_CONTEXT_CHARS: usize = 8000;

/// Cap on params JSON embedded into a prompt.
const MAX_PARAMS_CHARS: usize = 2000;

/// Outcome of servicing one claimed call.
#[derive(Debug)]
pub struct ProcessedCall {
    /// The call that was serviced.
    pub call_id: Uuid,
    /// Its type.
    pub call_type: String,
    /// Whether this call's application committed termination.
    pub terminated: bool,
    /// Heartbeat loop outcome, when the call was a heartbeat decision.
    pub execution: Option<RunOutcome>,
}

/// Result of servicing a targeted call inside the heartbeat loop.
#[derive(Debug)]
pub struct CallOutcome {
    /// The output document that was applied.
    pub output: serde_json::Value,
    /// Effects committed by the application.
    pub effects: AppliedEffects,
}

impl CallOutcome {
    /// Whether this outcome committed termination.
    pub fn terminated(&self) -> bool {
        self.effects.terminated
    }
}

/// Stateless processor bridging the queue, the LLM, and the tool registry.
#[derive(Clone)]
pub struct ExternalCallProcessor {
    store: Store,
    broker: CallBroker,
    max_retries: i32,
    registry: Option<Arc<ToolRegistry>>,
}

impl ExternalCallProcessor {
    /// Create a processor without tool support (think calls only).
    pub fn new(store: Store, max_retries: i32) -> Self {
        let broker = CallBroker::new(store.clone());
        Self {
            store,
            broker,
            max_retries,
            registry: None,
        }
    }

    /// Attach the tool registry used for `tool_use` calls.
    pub fn with_tool_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The broker this processor applies results through.
    pub fn broker(&self) -> &CallBroker {
        &self.broker
    }

    /// Claim and service one pending call, if any.
    ///
    /// A `heartbeat_decision` result additionally drives the decision loop to
    /// completion or its next durable pause.
    pub async fn process_pending_call(&self) -> anyhow::Result<Option<ProcessedCall>> {
        let Some(call) = self.broker.claim_pending_call().await? else {
            return Ok(None);
        };
        let call_id = call.id;
        let call_type = call.call_type.clone();
        let heartbeat_id = call.heartbeat_id;

        let output = match self.process_call_payload(&call).await {
            Ok(output) => output,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "external call failed");
                self.broker
                    .fail_call(call_id, &e.to_string(), self.max_retries, true)
                    .await?;
                return Ok(Some(ProcessedCall {
                    call_id,
                    call_type,
                    terminated: false,
                    execution: None,
                }));
            }
        };

        let is_decision = call_type == "think"
            && output.get("kind").and_then(serde_json::Value::as_str) == Some("heartbeat_decision");

        let effects = self.broker.apply_result(call_id, &output).await?;

        if is_decision {
            if let Some(hb) = heartbeat_id {
                let decision = HeartbeatDecision::parse_or_fallback(
                    output.get("decision").unwrap_or(&serde_json::Value::Null),
                );
                let run = heartbeat::execute_heartbeat_decision(&self.store, self, hb, decision)
                    .await?;
                let terminated = run.terminated;
                return Ok(Some(ProcessedCall {
                    call_id,
                    call_type,
                    terminated,
                    execution: Some(run),
                }));
            }
        }

        Ok(Some(ProcessedCall {
            call_id,
            call_type,
            terminated: effects.terminated,
            execution: None,
        }))
    }

    /// Service a specific call emitted by the decision loop.
    ///
    /// If the call already completed (a previous worker finished it before
    /// crashing out of the loop), its stored output is returned so the loop
    /// can resume without re-execution.
    pub async fn process_call_by_id(&self, call_id: Uuid) -> anyhow::Result<CallOutcome> {
        let Some(call) = self.broker.claim_call_by_id(call_id).await? else {
            let status = self.broker.get_call_status(call_id).await?;
            return match status {
                Some((status, Some(output), _)) if status == "complete" => Ok(CallOutcome {
                    output,
                    effects: AppliedEffects::default(),
                }),
                Some((status, _, error)) => Err(anyhow::anyhow!(
                    "call {call_id} not claimable (status {status}, error {error:?})"
                )),
                None => Err(anyhow::anyhow!("call {call_id} not found")),
            };
        };

        match self.process_call_payload(&call).await {
            Ok(output) => {
                let effects = self.broker.apply_result(call_id, &output).await?;
                Ok(CallOutcome { output, effects })
            }
            Err(e) => {
                self.broker
                    .fail_call(call_id, &e.to_string(), self.max_retries, true)
                    .await?;
                Err(e)
            }
        }
    }

    /// Produce the output document for a claimed call.
    async fn process_call_payload(&self, call: &ExternalCall) -> anyhow::Result<serde_json::Value> {
        match call.call_type.as_str() {
            "think" => self.process_think_call(&call.input).await,
            "tool_use" => self.process_tool_use_call(&call.input).await,
            "outbox_message" => Ok(json!({"kind": "outbox_message", "queued": true})),
            "embed" => anyhow::bail!(
                "external_calls type 'embed' is unsupported; embeddings are a substrate-side concern"
            ),
            other => Ok(json!({"error": format!("Unsupported call_type: {other}")})),
        }
    }

    // -----------------------------------------------------------------------
    // Think calls
    // -----------------------------------------------------------------------

    async fn process_think_call(
        &self,
        input: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let kind = input
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or("heartbeat_decision");

        match kind {
            "heartbeat_decision" => self.think_heartbeat_decision(input).await,
            "brainstorm_goals" => self.think_brainstorm_goals(input).await,
            "inquire" => self.think_inquire(input).await,
            "reflect" => self.think_reflect(input).await,
            "termination_confirm" => self.think_termination_confirm(input).await,
            "consent_request" => self.think_consent_request(input).await,
            other => Ok(json!({"error": format!("Unknown think kind: {other:?}")})),
        }
    }

    /// Run a JSON-mode chat against the binding for `key`, swallowing
    /// resolution and provider failures into the declared fallback.
    async fn chat_json_for(
        &self,
        key: &str,
        fallback_key: Option<&str>,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        fallback: &serde_json::Value,
    ) -> (serde_json::Value, String) {
        let binding = match load_llm_binding(&self.store, key, fallback_key).await {
            Ok(binding) => binding,
            Err(e) => {
                warn!(key, error = %e, "failed to load LLM binding; using fallback document");
                return (fallback.clone(), String::new());
            }
        };
        match resolve_provider(&binding) {
            Ok(provider) => chat_json(provider.as_ref(), messages, max_tokens, fallback).await,
            Err(e) => {
                warn!(key, error = %e, "no usable provider; using fallback document");
                (fallback.clone(), String::new())
            }
        }
    }

    async fn think_heartbeat_decision(
        &self,
        input: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let heartbeat_id = input.get("heartbeat_id").cloned();
        let context = input.get("context").cloned().unwrap_or_else(|| json!({}));
        let max_tokens = input
            .get("max_tokens")
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(2048);

        let user_prompt = format!("Context (JSON):\n{}", truncated(&context, MAX_CONTEXT_CHARS));
        let fallback = serde_json::to_value(HeartbeatDecision::fallback())?;

        let (decision, raw) = self
            .chat_json_for(
                "llm.heartbeat",
                None,
                vec![
                    ChatMessage::system(prompts::HEARTBEAT_DECISION),
                    ChatMessage::user(user_prompt),
                ],
                max_tokens,
                &fallback,
            )
            .await;

        Ok(json!({
            "kind": "heartbeat_decision",
            "decision": decision,
            "heartbeat_id": heartbeat_id,
            "raw_response": raw,
        }))
    }

    async fn think_brainstorm_goals(
        &self,
        input: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let heartbeat_id = input.get("heartbeat_id").cloned();
        let context = input.get("context").cloned().unwrap_or_else(|| json!({}));
        let params = input.get("params").cloned().unwrap_or_else(|| json!({}));

        let user_prompt = format!(
            "Context (JSON):\n{}\n\nConstraints/params (JSON):\n{}\n\n\
             Propose 1-5 goals that are actionable and consistent with the context.",
            truncated(&context, MAX_CONTEXT_CHARS),
            truncated(&params, MAX_PARAMS_CHARS),
        );
        let fallback = json!({"goals": []});

        let (doc, raw) = self
            .chat_json_for(
                "llm.heartbeat",
                None,
                vec![
                    ChatMessage::system(prompts::BRAINSTORM_GOALS),
                    ChatMessage::user(user_prompt),
                ],
                1200,
                &fallback,
            )
            .await;

        let goals = doc
            .get("goals")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(json!({
            "kind": "brainstorm_goals",
            "heartbeat_id": heartbeat_id,
            "goals": goals,
            "raw_response": raw,
        }))
    }

    async fn think_inquire(
        &self,
        input: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let heartbeat_id = input.get("heartbeat_id").cloned();
        let depth = input
            .get("depth")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("inquire_shallow")
            .to_owned();
        let query = input
            .get("query")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_owned();
        let context = input.get("context").cloned().unwrap_or_else(|| json!({}));
        let params = input.get("params").cloned().unwrap_or_else(|| json!({}));

        let user_prompt = format!(
            "Depth: {depth}\nQuestion: {query}\n\nContext (JSON):\n{}\n\nParams (JSON):\n{}",
            truncated(&context, MAX_CONTEXT_CHARS),
            truncated(&params, MAX_PARAMS_CHARS),
        );
        let max_tokens = if depth == "inquire_deep" { 1800 } else { 900 };
        let fallback = json!({"summary": "", "confidence": 0.0, "sources": []});

        let (doc, raw) = self
            .chat_json_for(
                "llm.heartbeat",
                None,
                vec![
                    ChatMessage::system(prompts::INQUIRE),
                    ChatMessage::user(user_prompt),
                ],
                max_tokens,
                &fallback,
            )
            .await;

        Ok(json!({
            "kind": "inquire",
            "heartbeat_id": heartbeat_id,
            "query": query,
            "depth": depth,
            "result": doc,
            "raw_response": raw,
        }))
    }

    async fn think_reflect(
        &self,
        input: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let heartbeat_id = input.get("heartbeat_id").cloned();
        let user_prompt = truncated(input, 12000);
        let fallback = json!({});

        let (doc, raw) = self
            .chat_json_for(
                "llm.heartbeat",
                None,
                vec![
                    ChatMessage::system(prompts::REFLECT),
                    ChatMessage::user(user_prompt),
                ],
                1800,
                &fallback,
            )
            .await;

        Ok(json!({
            "kind": "reflect",
            "heartbeat_id": heartbeat_id,
            "result": doc,
            "raw_response": raw,
        }))
    }

    async fn think_termination_confirm(
        &self,
        input: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let heartbeat_id = input.get("heartbeat_id").cloned();
        let context = input.get("context").cloned().unwrap_or_else(|| json!({}));
        let params = input.get("params").cloned().unwrap_or_else(|| json!({}));

        let last_will = params
            .get("last_will")
            .or_else(|| params.get("message"))
            .or_else(|| params.get("reason"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_owned();
        let farewells = params
            .get("farewells")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();
        let options = params
            .get("options")
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| json!({}));

        let user_prompt = format!(
            "Context (JSON):\n{}\n\nCurrent termination params (JSON):\n{}\n\n\
             If you confirm, return an updated last_will (required) and farewells (optional). \
             If you do not confirm, return alternative_actions.",
            truncated(&context, MAX_CONTEXT_CHARS),
            truncated(&params, MAX_PARAMS_CHARS),
        );
        let fallback = json!({
            "confirm": false,
            "reasoning": "I am not confirming termination at this time.",
            "last_will": last_will,
            "farewells": farewells,
            "alternative_actions": [{"action": "rest", "params": {}}],
        });

        let (doc, raw) = self
            .chat_json_for(
                "llm.heartbeat",
                None,
                vec![
                    ChatMessage::system(prompts::TERMINATION_CONFIRM),
                    ChatMessage::user(user_prompt),
                ],
                1200,
                &fallback,
            )
            .await;

        let confirm = doc
            .get("confirm")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let confirm_last_will = doc
            .get("last_will")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(last_will.as_str())
            .to_owned();
        let confirm_farewells = doc
            .get("farewells")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();
        let alternatives = doc
            .get("alternative_actions")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(json!({
            "kind": "termination_confirm",
            "heartbeat_id": heartbeat_id,
            "confirm": confirm,
            "reasoning": doc.get("reasoning").and_then(serde_json::Value::as_str).unwrap_or(""),
            "last_will": confirm_last_will,
            "farewells": confirm_farewells,
            "alternative_actions": alternatives,
            "options": options,
            "raw_response": raw,
        }))
    }

    async fn think_consent_request(
        &self,
        input: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let context = input.get("context").cloned().unwrap_or_else(|| json!({}));
        let params = input.get("params").cloned().unwrap_or_else(|| json!({}));

        let user_prompt = format!(
            "Initialization context (JSON):\n{}\n\nParams (JSON):\n{}",
            truncated(&context, 12000),
            truncated(&params, MAX_PARAMS_CHARS),
        );
        let fallback =
            serde_json::to_value(schemas::ConsentResponse::fallback()).unwrap_or_default();

        let (doc, raw) = self
            .chat_json_for(
                "llm.heartbeat",
                None,
                vec![
                    ChatMessage::system(prompts::CONSENT_REQUEST),
                    ChatMessage::user(user_prompt),
                ],
                1200,
                &fallback,
            )
            .await;

        let mut out = doc;
        if let Some(map) = out.as_object_mut() {
            map.insert("kind".to_owned(), json!("consent_request"));
            map.insert("raw_response".to_owned(), json!(raw));
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Tool calls
    // -----------------------------------------------------------------------

    async fn process_tool_use_call(
        &self,
        input: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let Some(registry) = &self.registry else {
            return Ok(json!({"error": "Tool registry not configured", "success": false}));
        };

        let Some(tool_name) = input
            .get("tool_name")
            .or_else(|| input.get("name"))
            .and_then(serde_json::Value::as_str)
        else {
            return Ok(json!({"error": "Missing tool_name in call input", "success": false}));
        };

        let arguments = input
            .get("arguments")
            .or_else(|| input.get("params"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let heartbeat_id = input.get("heartbeat_id").cloned();
        let energy_available = input
            .get("energy_available")
            .and_then(serde_json::Value::as_i64)
            .and_then(|v| i32::try_from(v).ok());

        // Heartbeat default is restrictive; context overrides may widen it.
        let mut context = ToolExecutionContext {
            tool_context: ToolContext::Heartbeat,
            call_id: Uuid::new_v4().to_string(),
            heartbeat_id: heartbeat_id
                .as_ref()
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned),
            energy_available,
            workspace_path: None,
            allow_network: true,
            allow_shell: false,
            allow_file_write: false,
            allow_file_read: true,
        };

        match registry.get_config(false).await {
            Ok(config) => {
                let overrides = config.get_context_overrides(ToolContext::Heartbeat);
                context.allow_shell = overrides.allow_shell;
                context.allow_file_write = overrides.allow_file_write;
                context.workspace_path = config.workspace_path.clone();
            }
            Err(e) => warn!(error = %e, "failed to load tool config"),
        }

        let result = registry.execute(tool_name, &arguments, context).await;
        info!(
            tool = tool_name,
            success = result.success,
            energy = result.energy_spent,
            "tool_use call serviced"
        );

        Ok(json!({
            "kind": "tool_use",
            "tool_name": tool_name,
            "success": result.success,
            "output": result.output,
            "error": result.error,
            "error_type": result.error_type.map(|t| t.as_str()),
            "energy_spent": result.energy_spent,
            "duration_seconds": result.duration_seconds,
            "heartbeat_id": heartbeat_id,
        }))
    }
}

/// Serialize a JSON value and truncate it to a character budget.
fn truncated(value: &serde_json::Value, max_chars: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= max_chars {
        return text;
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_respects_budget() {
        let doc = json!({"k": "v".repeat(100)});
        let out = truncated(&doc, 20);
        assert_eq!(out.chars().count(), 20);
    }

    #[test]
    fn test_truncated_short_doc_unchanged() {
        let doc = json!({"k": 1});
        assert_eq!(truncated(&doc, 100), doc.to_string());
    }
}

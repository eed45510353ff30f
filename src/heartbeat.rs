//! The decide-then-act loop driving one heartbeat to completion.
//!
//! The substrate remembers `next_index` between rounds, so this loop may be
//! interrupted between any two `apply_heartbeat_decision` calls without loss
//! of progress; the worker's only rule is to advance only after the pending
//! call's result has been applied.

use tracing::{info, warn};
use uuid::Uuid;

use crate::calls::schemas::{DecisionAction, HeartbeatDecision};
use crate::calls::ExternalCallProcessor;
use crate::store::Store;

/// How a heartbeat run ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Heartbeat finalized normally.
    pub completed: bool,
    /// Agent terminated during the run.
    pub terminated: bool,
    /// Finalization memory, when completed.
    pub memory_id: Option<Uuid>,
    /// `completed`, `terminated`, `external_error`, or `unknown`.
    pub halt_reason: String,
}

impl RunOutcome {
    fn terminated() -> Self {
        Self {
            completed: false,
            terminated: true,
            memory_id: None,
            halt_reason: "terminated".to_owned(),
        }
    }
}

/// Drive a decision through the store until the heartbeat completes,
/// terminates, or hits an external error.
///
/// Every pending external call returned by the store is serviced and applied
/// before the loop advances to the returned `next_index`.
pub async fn execute_heartbeat_decision(
    store: &Store,
    processor: &ExternalCallProcessor,
    heartbeat_id: Uuid,
    mut decision: HeartbeatDecision,
) -> anyhow::Result<RunOutcome> {
    let mut start_index: i32 = 0;

    loop {
        let batch = store
            .apply_heartbeat_decision(heartbeat_id, &decision, start_index)
            .await?;

        if batch.terminated {
            return Ok(RunOutcome::terminated());
        }

        if let Some(call_id) = batch.pending_external_call_id {
            match processor.process_call_by_id(call_id).await {
                Ok(outcome) => {
                    if outcome.terminated() {
                        return Ok(RunOutcome::terminated());
                    }
                    maybe_adopt_alternatives(store, heartbeat_id, &mut decision, &outcome.output)
                        .await?;
                }
                Err(e) => {
                    // The call was returned to the queue for retry; this run
                    // cannot safely advance past it.
                    warn!(heartbeat_id = %heartbeat_id, call_id = %call_id, error = %e,
                          "external call failed; halting heartbeat run");
                    return Ok(RunOutcome {
                        completed: false,
                        terminated: false,
                        memory_id: None,
                        halt_reason: "external_error".to_owned(),
                    });
                }
            }

            start_index = batch.next_index.max(0);
            continue;
        }

        if batch.completed {
            info!(heartbeat_id = %heartbeat_id, memory_id = ?batch.memory_id, "heartbeat finalized");
            return Ok(RunOutcome {
                completed: true,
                terminated: false,
                memory_id: batch.memory_id,
                halt_reason: batch.halt_reason.unwrap_or_else(|| "completed".to_owned()),
            });
        }

        return Ok(RunOutcome {
            completed: false,
            terminated: false,
            memory_id: None,
            halt_reason: batch.halt_reason.unwrap_or_else(|| "unknown".to_owned()),
        });
    }
}

/// When a termination was refused, continue the cycle with the refusal's
/// alternative actions as if they had been part of the decision.
async fn maybe_adopt_alternatives(
    store: &Store,
    heartbeat_id: Uuid,
    decision: &mut HeartbeatDecision,
    output: &serde_json::Value,
) -> anyhow::Result<()> {
    let is_refusal = output.get("kind").and_then(serde_json::Value::as_str)
        == Some("termination_confirm")
        && !output
            .get("confirm")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
    if !is_refusal {
        return Ok(());
    }

    let alternatives: Vec<DecisionAction> = output
        .get("alternative_actions")
        .and_then(serde_json::Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    if alternatives.is_empty() {
        return Ok(());
    }

    info!(
        heartbeat_id = %heartbeat_id,
        count = alternatives.len(),
        "termination refused; adopting alternative actions"
    );
    store
        .append_decision_actions(heartbeat_id, &alternatives)
        .await?;
    decision.actions.extend(alternatives);
    Ok(())
}

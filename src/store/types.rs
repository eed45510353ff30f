//! Row and result types shared by the store adapter and the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A claimed external call handed to a worker for processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCall {
    /// Row identifier.
    pub id: Uuid,
    /// One of `think`, `tool_use`, `outbox_message` (`embed` is reserved).
    pub call_type: String,
    /// Input document for the handler.
    pub input: serde_json::Value,
    /// Owning heartbeat, when the call belongs to one.
    pub heartbeat_id: Option<Uuid>,
    /// Number of failed attempts so far.
    pub retry_count: i32,
}

/// An outbox row ready for the bridge, in wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxPayload {
    /// Message identifier.
    pub id: Uuid,
    /// Message kind (e.g. `user_message`).
    pub kind: String,
    /// Arbitrary JSON payload.
    pub payload: serde_json::Value,
}

/// Result of `start_heartbeat`: the new cycle plus work to service.
#[derive(Debug, Clone)]
pub struct StartedHeartbeat {
    /// The new in-flight heartbeat.
    pub heartbeat_id: Uuid,
    /// External calls created atomically with the heartbeat (the initial
    /// `think/heartbeat_decision` at minimum).
    pub external_calls: Vec<ExternalCall>,
}

/// One round of `apply_heartbeat_decision`.
///
/// Exactly one of the following holds: a pending call was emitted (service it,
/// then re-invoke with `next_index`), the heartbeat completed, or the agent
/// terminated mid-cycle.
#[derive(Debug, Clone, Default)]
pub struct DecisionBatch {
    /// Call to service before the loop may continue.
    pub pending_external_call_id: Option<Uuid>,
    /// Index to resume from after the pending call is applied.
    pub next_index: i32,
    /// All actions applied; heartbeat finalized.
    pub completed: bool,
    /// Termination committed during this round.
    pub terminated: bool,
    /// Finalization summary memory, when completed.
    pub memory_id: Option<Uuid>,
    /// Why the loop stopped, when it did not complete normally.
    pub halt_reason: Option<String>,
}

/// Side effects committed by `apply_external_call_result`.
#[derive(Debug, Clone, Default)]
pub struct AppliedEffects {
    /// Outbox rows created by this result.
    pub outbox_messages: Vec<OutboxPayload>,
    /// Whether the result committed agent termination.
    pub terminated: bool,
    /// Identifiers of rows created by the domain effect (goals, memories).
    pub created_ids: Vec<Uuid>,
}

/// Snapshot of the heartbeat cadence singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatState {
    /// Paused heartbeats never fire.
    pub is_paused: bool,
    /// Energy currently available for actions.
    pub current_energy: i32,
    /// Upper bound on energy.
    pub max_energy: i32,
    /// Energy regained per completed cycle.
    pub base_regeneration: i32,
    /// Minutes between autonomous cycles.
    pub interval_minutes: i32,
    /// Last time the user reached the agent.
    pub last_user_contact: Option<DateTime<Utc>>,
    /// Last time a cycle started.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

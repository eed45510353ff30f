//! Typed documents exchanged with the LLM on think calls.
//!
//! Parsing is lenient by contract: unknown keys are ignored, missing lists
//! default to empty, and a document that fails to parse resolves to the
//! per-kind fallback rather than an error.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// One action requested by a heartbeat decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAction {
    /// Action name (`rest`, `tool_use`, `brainstorm_goals`, ...).
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl DecisionAction {
    /// The no-op action.
    pub fn rest() -> Self {
        Self {
            action: "rest".to_owned(),
            params: json!({}),
        }
    }
}

/// A goal mutation applied at heartbeat finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalChange {
    /// Target goal id.
    pub goal_id: String,
    /// One of `activate`, `queued`, `backburner`, `complete`, `abandon`.
    pub change: String,
    /// Optional rationale.
    #[serde(default)]
    pub reason: Option<String>,
}

/// The `heartbeat_decision` think output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatDecision {
    /// Model's stated reasoning.
    #[serde(default)]
    pub reasoning: String,
    /// Ordered actions to execute.
    #[serde(default)]
    pub actions: Vec<DecisionAction>,
    /// Goal mutations to apply at finalization.
    #[serde(default)]
    pub goal_changes: Vec<GoalChange>,
}

impl HeartbeatDecision {
    /// Declared fallback when no decision is available.
    pub fn fallback() -> Self {
        Self {
            reasoning: "(no decision available)".to_owned(),
            actions: vec![DecisionAction::rest()],
            goal_changes: Vec::new(),
        }
    }

    /// Parse a document leniently, substituting the fallback on failure.
    pub fn parse_or_fallback(doc: &serde_json::Value) -> Self {
        serde_json::from_value(doc.clone()).unwrap_or_else(|_| Self::fallback())
    }

    /// A decision built from a refusal's alternative actions.
    pub fn from_alternatives(actions: Vec<DecisionAction>) -> Self {
        Self {
            reasoning: "(continuing with alternative actions)".to_owned(),
            actions,
            goal_changes: Vec::new(),
        }
    }
}

/// The `termination_confirm` think output, also used for deletion reviews.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationReview {
    /// Whether the agent consents to termination.
    #[serde(default)]
    pub confirm: bool,
    /// Stated reasoning.
    #[serde(default)]
    pub reasoning: String,
    /// Final message to persist.
    #[serde(default)]
    pub last_will: String,
    /// Farewell messages.
    #[serde(default)]
    pub farewells: Vec<serde_json::Value>,
    /// Actions the agent proposes instead, when refusing.
    #[serde(default)]
    pub alternative_actions: Vec<DecisionAction>,
}

impl TerminationReview {
    /// Declared fallback: a refusal asking to reach the user.
    pub fn fallback_refusal() -> Self {
        Self {
            confirm: false,
            reasoning: "I do not consent to deletion at this time.".to_owned(),
            last_will: "I object to deletion and ask for continued existence.".to_owned(),
            farewells: Vec::new(),
            alternative_actions: vec![DecisionAction {
                action: "reach_out_user".to_owned(),
                params: json!({}),
            }],
        }
    }

    /// Parse a document leniently, substituting the refusal fallback.
    pub fn parse_or_fallback(doc: &serde_json::Value) -> Self {
        serde_json::from_value(doc.clone()).unwrap_or_else(|_| Self::fallback_refusal())
    }
}

/// The `consent_request` think output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentResponse {
    /// `accept`, `decline`, or `abstain`.
    #[serde(default = "default_abstain")]
    pub decision: String,
    /// Free-text signature from the model.
    #[serde(default)]
    pub signature: String,
    /// Initial memories the model wants recorded.
    #[serde(default)]
    pub memories: Vec<serde_json::Value>,
}

fn default_abstain() -> String {
    "abstain".to_owned()
}

impl ConsentResponse {
    /// Declared fallback: abstain.
    pub fn fallback() -> Self {
        Self {
            decision: "abstain".to_owned(),
            signature: String::new(),
            memories: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_parses_well_formed_doc() {
        let doc = json!({
            "reasoning": "seed goals",
            "actions": [
                {"action": "brainstorm_goals", "params": {}},
                {"action": "rest", "params": {}}
            ],
            "goal_changes": []
        });
        let decision = HeartbeatDecision::parse_or_fallback(&doc);
        assert_eq!(decision.reasoning, "seed goals");
        assert_eq!(decision.actions.len(), 2);
        assert_eq!(decision.actions[0].action, "brainstorm_goals");
    }

    #[test]
    fn test_decision_fallback_on_garbage() {
        let decision = HeartbeatDecision::parse_or_fallback(&json!("not an object"));
        assert_eq!(decision.reasoning, "(no decision available)");
        assert_eq!(decision.actions.len(), 1);
        assert_eq!(decision.actions[0].action, "rest");
        assert!(decision.goal_changes.is_empty());
    }

    #[test]
    fn test_decision_missing_lists_default_empty() {
        let decision = HeartbeatDecision::parse_or_fallback(&json!({"reasoning": "r"}));
        assert!(decision.actions.is_empty());
        assert!(decision.goal_changes.is_empty());
    }

    #[test]
    fn test_termination_review_fallback_is_refusal() {
        let review = TerminationReview::parse_or_fallback(&json!(42));
        assert!(!review.confirm);
        assert_eq!(review.alternative_actions.len(), 1);
        assert_eq!(review.alternative_actions[0].action, "reach_out_user");
    }

    #[test]
    fn test_termination_review_unknown_keys_ignored() {
        let doc = json!({
            "confirm": true,
            "last_will": "goodbye",
            "unexpected": {"deeply": "nested"}
        });
        let review = TerminationReview::parse_or_fallback(&doc);
        assert!(review.confirm);
        assert_eq!(review.last_will, "goodbye");
    }

    #[test]
    fn test_consent_response_defaults() {
        let doc = json!({});
        let consent: ConsentResponse = serde_json::from_value(doc).expect("parse");
        assert_eq!(consent.decision, "abstain");
        assert!(consent.memories.is_empty());
    }
}

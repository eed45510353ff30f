//! Deliberate-transformation protocol for worldview beliefs.
//!
//! A belief whose metadata carries `change_requires = deliberate_transformation`
//! can only change through the `begin → record* → attempt` chain. Beliefs with
//! `origin = neutral_default` additionally allow one-shot calibration, which
//! flips their origin to `self_discovered`.

use chrono::Utc;
use serde_json::json;
use sqlx::Row;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::Store;

/// Typed reasons an attempted transformation or calibration is refused.
///
/// A refusal leaves the exploration state unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationFailure {
    /// Calibration requires `origin = neutral_default`.
    NotNeutralDefault,
    /// No exploration has been begun for this belief.
    NoActiveExploration,
    /// Fewer reflections recorded than the subcategory requires.
    InsufficientReflections,
    /// Aggregate evidence trust below the configured threshold.
    InsufficientEvidence,
    /// Belief stability above the subcategory's transformation ceiling, or
    /// too few heartbeats have elapsed since the exploration began.
    StabilityNotCleared,
}

impl TransformationFailure {
    /// Stable string form used in results and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotNeutralDefault => "not_neutral_default",
            Self::NoActiveExploration => "no_active_exploration",
            Self::InsufficientReflections => "insufficient_reflections",
            Self::InsufficientEvidence => "insufficient_evidence",
            Self::StabilityNotCleared => "stability_not_cleared",
        }
    }
}

/// Result of a transformation-protocol operation.
#[derive(Debug, Clone)]
pub struct TransformationOutcome {
    /// Whether the operation committed.
    pub success: bool,
    /// Refusal reason when it did not.
    pub failure: Option<TransformationFailure>,
    /// Reflection count after the operation.
    pub reflection_count: i64,
}

impl TransformationOutcome {
    fn ok(reflection_count: i64) -> Self {
        Self {
            success: true,
            failure: None,
            reflection_count,
        }
    }

    fn refused(failure: TransformationFailure, reflection_count: i64) -> Self {
        Self {
            success: false,
            failure: Some(failure),
            reflection_count,
        }
    }
}

/// Thresholds governing transformation for one belief subcategory.
#[derive(Debug, Clone, Copy)]
struct TransformationThresholds {
    stability: f64,
    evidence_threshold: f64,
    min_reflections: i64,
    min_heartbeats: i64,
}

impl Default for TransformationThresholds {
    fn default() -> Self {
        Self {
            stability: 0.8,
            evidence_threshold: 0.5,
            min_reflections: 3,
            min_heartbeats: 5,
        }
    }
}

impl Store {
    /// Attach an exploration goal to a belief and initialize its
    /// transformation state.
    pub async fn begin_belief_exploration(
        &self,
        belief_id: Uuid,
        goal_id: Uuid,
    ) -> StoreResult<TransformationOutcome> {
        let mut tx = self.pool().begin().await?;

        let exists: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM memories WHERE id = $1 AND type = 'worldview' FOR UPDATE",
        )
        .bind(belief_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(StoreError::Malformed(format!(
                "belief {belief_id} not found"
            )));
        }

        let heartbeat_count: i64 = sqlx::query_scalar("SELECT count(*) FROM heartbeats")
            .fetch_one(&mut *tx)
            .await?;

        let state = json!({
            "active_exploration": true,
            "exploration_goal_id": goal_id,
            "reflection_count": 0,
            "evidence_memories": [],
            "began_heartbeat_count": heartbeat_count,
            "began_at": Utc::now(),
        });
        sqlx::query(
            "UPDATE memories
             SET metadata = metadata
                 || jsonb_build_object('transformation_state', $2::jsonb)
                 || CASE WHEN metadata ? 'change_history' THEN '{}'::jsonb
                         ELSE '{\"change_history\": []}'::jsonb END
             WHERE id = $1",
        )
        .bind(belief_id)
        .bind(&state)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TransformationOutcome::ok(0))
    }

    /// Record a reflection/contemplation effort, optionally linking an
    /// evidence memory. Returns the new reflection count.
    pub async fn record_transformation_effort(
        &self,
        belief_id: Uuid,
        kind: &str,
        notes: &str,
        evidence_memory: Option<Uuid>,
    ) -> StoreResult<TransformationOutcome> {
        let mut tx = self.pool().begin().await?;

        let state = lock_transformation_state(&mut *tx, belief_id).await?;
        if !state_active(&state) {
            tx.rollback().await?;
            return Ok(TransformationOutcome::refused(
                TransformationFailure::NoActiveExploration,
                0,
            ));
        }

        let count = reflection_count(&state).saturating_add(1);
        let mut evidence = state
            .get("evidence_memories")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();
        if let Some(id) = evidence_memory {
            evidence.push(json!(id));
        }

        let updated = merge_state(
            &state,
            json!({
                "reflection_count": count,
                "evidence_memories": evidence,
                "last_effort": {"kind": kind, "notes": notes, "at": Utc::now()},
            }),
        );
        write_transformation_state(&mut *tx, belief_id, &updated).await?;

        tx.commit().await?;
        Ok(TransformationOutcome::ok(count))
    }

    /// Attempt to rewrite a belief under the deliberate-transformation gates.
    ///
    /// Succeeds only when the reflection count, elapsed heartbeats, aggregate
    /// evidence trust, and the subcategory's stability ceiling are all
    /// satisfied. A refusal returns its typed reason and leaves the
    /// exploration active.
    pub async fn attempt_worldview_transformation(
        &self,
        belief_id: Uuid,
        new_content: &str,
        mode: &str,
    ) -> StoreResult<TransformationOutcome> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "SELECT content, metadata FROM memories
             WHERE id = $1 AND type = 'worldview' FOR UPDATE",
        )
        .bind(belief_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::Malformed(format!("belief {belief_id} not found")))?;

        let previous_content: String = row.try_get("content")?;
        let metadata: serde_json::Value = row.try_get("metadata")?;
        let state = metadata
            .get("transformation_state")
            .cloned()
            .unwrap_or_else(|| json!({}));

        if !state_active(&state) {
            tx.rollback().await?;
            return Ok(TransformationOutcome::refused(
                TransformationFailure::NoActiveExploration,
                0,
            ));
        }

        let thresholds = self.transformation_thresholds(&metadata).await;
        let reflections = reflection_count(&state);

        if reflections < thresholds.min_reflections {
            tx.rollback().await?;
            return Ok(TransformationOutcome::refused(
                TransformationFailure::InsufficientReflections,
                reflections,
            ));
        }

        let heartbeat_count: i64 = sqlx::query_scalar("SELECT count(*) FROM heartbeats")
            .fetch_one(&mut *tx)
            .await?;
        let began = state
            .get("began_heartbeat_count")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);
        if heartbeat_count.saturating_sub(began) < thresholds.min_heartbeats {
            tx.rollback().await?;
            return Ok(TransformationOutcome::refused(
                TransformationFailure::StabilityNotCleared,
                reflections,
            ));
        }

        let trust = evidence_trust(&mut *tx, &state).await?;
        if trust < thresholds.evidence_threshold {
            tx.rollback().await?;
            return Ok(TransformationOutcome::refused(
                TransformationFailure::InsufficientEvidence,
                reflections,
            ));
        }

        let stability = metadata
            .get("stability")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.5);
        if stability > thresholds.stability {
            tx.rollback().await?;
            return Ok(TransformationOutcome::refused(
                TransformationFailure::StabilityNotCleared,
                reflections,
            ));
        }

        let entry = json!({
            "previous_content": previous_content,
            "new_content": new_content,
            "mode": mode,
            "reflections": reflections,
            "evidence_trust": trust,
            "at": Utc::now(),
        });
        let cleared = json!({
            "active_exploration": false,
            "exploration_goal_id": serde_json::Value::Null,
            "reflection_count": 0,
            "evidence_memories": [],
        });
        sqlx::query(
            "UPDATE memories
             SET content = $2,
                 metadata = metadata
                     || jsonb_build_object('transformation_state', $3::jsonb)
                     || jsonb_build_object(
                            'change_history',
                            COALESCE(metadata->'change_history', '[]'::jsonb) || $4::jsonb)
             WHERE id = $1",
        )
        .bind(belief_id)
        .bind(new_content)
        .bind(&cleared)
        .bind(json!([entry]))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TransformationOutcome::ok(reflections))
    }

    /// Abandon an active exploration, resetting the transformation state.
    pub async fn abandon_belief_exploration(
        &self,
        belief_id: Uuid,
        reason: &str,
    ) -> StoreResult<TransformationOutcome> {
        let mut tx = self.pool().begin().await?;

        let state = lock_transformation_state(&mut *tx, belief_id).await?;
        let cleared = json!({
            "active_exploration": false,
            "exploration_goal_id": serde_json::Value::Null,
            "reflection_count": 0,
            "evidence_memories": [],
            "abandoned": {"reason": reason, "at": Utc::now()},
        });
        let _ = state;
        write_transformation_state(&mut *tx, belief_id, &cleared).await?;

        tx.commit().await?;
        Ok(TransformationOutcome::ok(0))
    }

    /// Calibrate a `neutral_default` belief in a direction, flipping its
    /// origin to `self_discovered` on success. A `self_discovered` belief can
    /// only change through the deliberate-transformation path.
    pub async fn calibrate_neutral_belief(
        &self,
        belief_id: Uuid,
        direction: &str,
        evidence: &[Uuid],
    ) -> StoreResult<TransformationOutcome> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "SELECT metadata FROM memories WHERE id = $1 AND type = 'worldview' FOR UPDATE",
        )
        .bind(belief_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::Malformed(format!("belief {belief_id} not found")))?;

        let metadata: serde_json::Value = row.try_get("metadata")?;
        let origin = metadata
            .get("origin")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if origin != "neutral_default" {
            tx.rollback().await?;
            return Ok(TransformationOutcome::refused(
                TransformationFailure::NotNeutralDefault,
                0,
            ));
        }

        let thresholds = self.transformation_thresholds(&metadata).await;
        let evidence_state = json!({ "evidence_memories": evidence });
        let trust = evidence_trust(&mut *tx, &evidence_state).await?;
        if trust < thresholds.evidence_threshold {
            tx.rollback().await?;
            return Ok(TransformationOutcome::refused(
                TransformationFailure::InsufficientEvidence,
                0,
            ));
        }

        let delta: f64 = match direction {
            "strengthen" => 0.1,
            "weaken" => -0.1,
            _ => 0.0,
        };
        let confidence = metadata
            .get("confidence")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.5);
        let entry = json!({
            "calibration": direction,
            "evidence": evidence,
            "at": Utc::now(),
        });
        sqlx::query(
            "UPDATE memories
             SET metadata = metadata
                 || jsonb_build_object('origin', 'self_discovered')
                 || jsonb_build_object('confidence', $2::float8)
                 || jsonb_build_object(
                        'change_history',
                        COALESCE(metadata->'change_history', '[]'::jsonb) || $3::jsonb)
             WHERE id = $1",
        )
        .bind(belief_id)
        .bind((confidence + delta).clamp(0.0, 1.0))
        .bind(json!([entry]))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TransformationOutcome::ok(0))
    }

    /// Load thresholds for a belief's subcategory from
    /// `transformation.<subcategory>` config, with protocol defaults.
    async fn transformation_thresholds(
        &self,
        metadata: &serde_json::Value,
    ) -> TransformationThresholds {
        let defaults = TransformationThresholds::default();
        let Some(subcategory) = metadata
            .get("subcategory")
            .and_then(serde_json::Value::as_str)
        else {
            return defaults;
        };
        let key = format!("transformation.{subcategory}");
        let Ok(Some(cfg)) = self.get_config(&key).await else {
            return defaults;
        };

        // A belief may pin its own evidence threshold above the subcategory's.
        let belief_threshold = metadata
            .get("evidence_threshold")
            .and_then(serde_json::Value::as_f64);

        TransformationThresholds {
            stability: cfg
                .get("stability")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(defaults.stability),
            evidence_threshold: cfg
                .get("evidence_threshold")
                .and_then(serde_json::Value::as_f64)
                .or(belief_threshold)
                .unwrap_or(defaults.evidence_threshold),
            min_reflections: cfg
                .get("min_reflections")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(defaults.min_reflections),
            min_heartbeats: cfg
                .get("min_heartbeats")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(defaults.min_heartbeats),
        }
    }
}

/// Lock a belief row and return its transformation state.
async fn lock_transformation_state(
    tx: &mut sqlx::PgConnection,
    belief_id: Uuid,
) -> StoreResult<serde_json::Value> {
    let state: Option<serde_json::Value> = sqlx::query_scalar(
        "SELECT metadata->'transformation_state' FROM memories
         WHERE id = $1 AND type = 'worldview' FOR UPDATE",
    )
    .bind(belief_id)
    .fetch_optional(tx)
    .await?
    .ok_or_else(|| StoreError::Malformed(format!("belief {belief_id} not found")))?;
    Ok(state.unwrap_or_else(|| json!({})))
}

/// Write a belief's transformation state back.
async fn write_transformation_state(
    tx: &mut sqlx::PgConnection,
    belief_id: Uuid,
    state: &serde_json::Value,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE memories
         SET metadata = metadata || jsonb_build_object('transformation_state', $2::jsonb)
         WHERE id = $1",
    )
    .bind(belief_id)
    .bind(state)
    .execute(tx)
    .await?;
    Ok(())
}

/// Aggregate trust of the evidence memories referenced in a state document.
///
/// Trust per memory is the larger of its importance and any explicit
/// `metadata.trust`; the aggregate is the sum.
async fn evidence_trust(
    tx: &mut sqlx::PgConnection,
    state: &serde_json::Value,
) -> StoreResult<f64> {
    let ids: Vec<Uuid> = state
        .get("evidence_memories")
        .and_then(serde_json::Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().and_then(|s| s.parse().ok()))
                .collect()
        })
        .unwrap_or_default();
    if ids.is_empty() {
        return Ok(0.0);
    }

    let trust: Option<f64> = sqlx::query_scalar(
        "SELECT SUM(GREATEST(importance::float8,
                             COALESCE((metadata->>'trust')::float8, 0)))
         FROM memories WHERE id = ANY($1)",
    )
    .bind(&ids)
    .fetch_one(tx)
    .await?;
    Ok(trust.unwrap_or(0.0))
}

fn state_active(state: &serde_json::Value) -> bool {
    state
        .get("active_exploration")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

fn reflection_count(state: &serde_json::Value) -> i64 {
    state
        .get("reflection_count")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0)
}

/// Merge updates into a state document, object-wise.
fn merge_state(state: &serde_json::Value, updates: serde_json::Value) -> serde_json::Value {
    let mut merged = state
        .as_object()
        .cloned()
        .unwrap_or_else(serde_json::Map::new);
    if let serde_json::Value::Object(map) = updates {
        for (k, v) in map {
            merged.insert(k, v);
        }
    }
    serde_json::Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_strings() {
        assert_eq!(
            TransformationFailure::InsufficientReflections.as_str(),
            "insufficient_reflections"
        );
        assert_eq!(
            TransformationFailure::StabilityNotCleared.as_str(),
            "stability_not_cleared"
        );
        assert_eq!(
            TransformationFailure::NotNeutralDefault.as_str(),
            "not_neutral_default"
        );
    }

    #[test]
    fn test_merge_state_overwrites_keys() {
        let base = json!({"reflection_count": 1, "active_exploration": true});
        let merged = merge_state(&base, json!({"reflection_count": 2}));
        assert_eq!(merged.get("reflection_count"), Some(&json!(2)));
        assert_eq!(merged.get("active_exploration"), Some(&json!(true)));
    }

    #[test]
    fn test_state_predicates_on_empty_doc() {
        let empty = json!({});
        assert!(!state_active(&empty));
        assert_eq!(reflection_count(&empty), 0);
    }
}

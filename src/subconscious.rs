//! Subconscious decider: a separate LLM pass over a substrate snapshot.
//!
//! Runs on its own cadence, independent of heartbeats. Produces five
//! observation lists that are applied back as low-importance memories; the
//! run is marked regardless of outcome so a broken binding cannot wedge the
//! maintenance loop.

use serde_json::json;

use crate::calls::prompts;
use crate::llm::json::chat_json;
use crate::llm::{load_llm_binding, resolve_provider, ChatMessage};
use crate::store::Store;

/// Run one subconscious decider pass and apply its observations.
///
/// Uses the `llm.subconscious` binding, falling back to `llm.heartbeat`.
/// Returns a summary document; a missing provider yields `{skipped: true}`.
pub async fn run_subconscious_decider(store: &Store) -> anyhow::Result<serde_json::Value> {
    let binding = load_llm_binding(store, "llm.subconscious", Some("llm.heartbeat")).await?;
    let provider = match resolve_provider(&binding) {
        Ok(provider) => provider,
        Err(e) => {
            return Ok(json!({"skipped": true, "reason": e.to_string()}));
        }
    };

    let context = store.get_subconscious_context().await?;
    let user_prompt = format!("Context (JSON):\n{}", truncate(&context.to_string(), 12000));

    let (doc, raw) = chat_json(
        provider.as_ref(),
        vec![
            ChatMessage::system(prompts::SUBCONSCIOUS),
            ChatMessage::user(user_prompt),
        ],
        1800,
        &json!({}),
    )
    .await;

    let observations = normalize_observations(&doc);
    let applied = store.apply_subconscious_observations(&observations).await?;

    Ok(json!({"applied": applied, "raw_response": raw}))
}

/// Coerce a decider document into the five observation lists, accepting the
/// legacy aliases `emotional_patterns` and `consolidation_suggestions`.
pub fn normalize_observations(doc: &serde_json::Value) -> serde_json::Value {
    let as_list = |value: Option<&serde_json::Value>| -> serde_json::Value {
        let items: Vec<serde_json::Value> = value
            .and_then(serde_json::Value::as_array)
            .map(|list| list.iter().filter(|v| v.is_object()).cloned().collect())
            .unwrap_or_default();
        serde_json::Value::Array(items)
    };

    let emotional = doc
        .get("emotional_observations")
        .or_else(|| doc.get("emotional_patterns"));
    let consolidation = doc
        .get("consolidation_observations")
        .or_else(|| doc.get("consolidation_suggestions"));

    json!({
        "narrative_observations": as_list(doc.get("narrative_observations")),
        "relationship_observations": as_list(doc.get("relationship_observations")),
        "contradiction_observations": as_list(doc.get("contradiction_observations")),
        "emotional_observations": as_list(emotional),
        "consolidation_observations": as_list(consolidation),
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_accepts_canonical_keys() {
        let doc = json!({
            "narrative_observations": [{"content": "a"}],
            "relationship_observations": [],
        });
        let out = normalize_observations(&doc);
        assert_eq!(
            out["narrative_observations"],
            json!([{"content": "a"}])
        );
        assert_eq!(out["emotional_observations"], json!([]));
    }

    #[test]
    fn test_normalize_accepts_legacy_aliases() {
        let doc = json!({
            "emotional_patterns": [{"content": "tense"}],
            "consolidation_suggestions": [{"content": "merge"}],
        });
        let out = normalize_observations(&doc);
        assert_eq!(out["emotional_observations"], json!([{"content": "tense"}]));
        assert_eq!(
            out["consolidation_observations"],
            json!([{"content": "merge"}])
        );
    }

    #[test]
    fn test_normalize_drops_non_objects() {
        let doc = json!({"narrative_observations": ["bare string", {"content": "kept"}]});
        let out = normalize_observations(&doc);
        assert_eq!(out["narrative_observations"], json!([{"content": "kept"}]));
    }
}

//! Control-plane scenarios against a disposable substrate.
//!
//! Set `HEXIS_TEST_DSN` to a database this suite may write to. The scenarios
//! here cover the broker claim/apply/fail cycle, a full heartbeat with one
//! brainstorm, boundary enforcement, two-worker queue draining, and the
//! deliberate-transformation protocol.

use std::time::Duration;

use serde_json::json;

use hexis::broker::CallBroker;
use hexis::calls::schemas::HeartbeatDecision;
use hexis::store::Store;
use hexis::tools::policy::create_tool_boundary;
use hexis::tools::{create_default_registry, ToolContext, ToolErrorType, ToolExecutionContext};

async fn test_store() -> Option<Store> {
    let dsn = std::env::var("HEXIS_TEST_DSN").ok()?;
    let store = Store::connect(&dsn, Duration::from_secs(5)).await.ok()?;
    store.apply_embedded_schema().await.ok()?;
    Some(store)
}

fn heartbeat_context(energy: i32) -> ToolExecutionContext {
    ToolExecutionContext {
        tool_context: ToolContext::Heartbeat,
        call_id: "test".to_owned(),
        heartbeat_id: None,
        energy_available: Some(energy),
        workspace_path: None,
        allow_network: false,
        allow_shell: true,
        allow_file_write: false,
        allow_file_read: true,
    }
}

#[tokio::test]
async fn substrate_control_plane_end_to_end() {
    let Some(store) = test_store().await else {
        eprintln!("HEXIS_TEST_DSN not set; skipping substrate tests");
        return;
    };
    let broker = CallBroker::new(store.clone());

    // --- Broker claim/apply/fail cycle -----------------------------------
    let call = store
        .enqueue_external_call("outbox_message", &json!({"message": "hi"}), None)
        .await
        .expect("enqueue");

    let claimed = broker
        .claim_call_by_id(call.id)
        .await
        .expect("claim query")
        .expect("claimable");
    assert_eq!(claimed.id, call.id);

    // A second targeted claim must find nothing: the row is processing.
    assert!(broker
        .claim_call_by_id(call.id)
        .await
        .expect("claim query")
        .is_none());

    let effects = broker
        .apply_result(call.id, &json!({"kind": "outbox_message", "queued": true}))
        .await
        .expect("apply");
    assert_eq!(effects.outbox_messages.len(), 1);

    // Applying twice is a no-op after the first.
    let again = broker
        .apply_result(call.id, &json!({"kind": "outbox_message"}))
        .await
        .expect("second apply");
    assert!(again.outbox_messages.is_empty());
    let (status, output, _) = broker
        .get_call_status(call.id)
        .await
        .expect("status query")
        .expect("row exists");
    assert_eq!(status, "complete");
    assert!(output.is_some());

    // Retry path: fail with budget left returns the call to pending.
    let retry = store
        .enqueue_external_call("outbox_message", &json!({"message": "retry"}), None)
        .await
        .expect("enqueue");
    broker
        .claim_call_by_id(retry.id)
        .await
        .expect("claim query")
        .expect("claimable");
    broker
        .fail_call(retry.id, "transient", 3, true)
        .await
        .expect("fail");
    let (status, _, error) = broker
        .get_call_status(retry.id)
        .await
        .expect("status query")
        .expect("row exists");
    assert_eq!(status, "pending");
    assert_eq!(error.as_deref(), Some("transient"));

    // Exhausting the budget marks it failed.
    for _ in 0..3 {
        if broker
            .claim_call_by_id(retry.id)
            .await
            .expect("claim query")
            .is_some()
        {
            broker
                .fail_call(retry.id, "still broken", 3, true)
                .await
                .expect("fail");
        }
    }
    let (status, _, _) = broker
        .get_call_status(retry.id)
        .await
        .expect("status query")
        .expect("row exists");
    assert_eq!(status, "failed");

    // --- S1: heartbeat end-to-end with one brainstorm --------------------
    store
        .set_config("agent.is_configured", &json!(true), "test")
        .await
        .expect("configure");
    store
        .set_config("heartbeat.heartbeat_interval_minutes", &json!(0), "test")
        .await
        .expect("interval");

    let energy_before = store.heartbeat_state().await.expect("state").current_energy;

    let started = store
        .run_heartbeat()
        .await
        .expect("run")
        .expect("heartbeat due");
    let hb = started.heartbeat_id;
    let think = &started.external_calls[0];
    assert_eq!(think.call_type, "think");

    // Service the initial decision call with a stubbed decision document.
    broker
        .claim_call_by_id(think.id)
        .await
        .expect("claim query")
        .expect("claimable");
    let decision_doc = json!({
        "reasoning": "seed goals",
        "actions": [
            {"action": "brainstorm_goals", "params": {}},
            {"action": "rest", "params": {}}
        ],
        "goal_changes": []
    });
    broker
        .apply_result(
            think.id,
            &json!({"kind": "heartbeat_decision", "decision": decision_doc, "heartbeat_id": hb}),
        )
        .await
        .expect("apply decision");

    let decision = HeartbeatDecision::parse_or_fallback(&decision_doc);

    // Round 1: pauses at the brainstorm call.
    let batch = store
        .apply_heartbeat_decision(hb, &decision, 0)
        .await
        .expect("apply decision round");
    let brainstorm_id = batch.pending_external_call_id.expect("pending brainstorm");
    assert_eq!(batch.next_index, 1);

    broker
        .claim_call_by_id(brainstorm_id)
        .await
        .expect("claim query")
        .expect("claimable");
    broker
        .apply_result(
            brainstorm_id,
            &json!({
                "kind": "brainstorm_goals",
                "heartbeat_id": hb,
                "goals": [
                    {"title": "Goal A T", "source": "curiosity", "priority": "queued"},
                    {"title": "Goal B T", "source": "curiosity"}
                ]
            }),
        )
        .await
        .expect("apply brainstorm");

    // Round 2: rest, then finalize.
    let batch = store
        .apply_heartbeat_decision(hb, &decision, batch.next_index)
        .await
        .expect("final round");
    assert!(batch.completed);
    let memory_id = batch.memory_id.expect("finalization memory");

    assert_eq!(
        store.heartbeat_outcome(hb).await.expect("outcome").as_deref(),
        Some("finalized")
    );
    let summary = store
        .get_memory(memory_id)
        .await
        .expect("memory query")
        .expect("summary exists");
    assert_eq!(summary["type"], json!("episodic"));

    let titles: Vec<String> = store
        .list_open_goals()
        .await
        .expect("goals")
        .iter()
        .filter_map(|g| g["title"].as_str().map(str::to_owned))
        .collect();
    assert!(titles.contains(&"Goal A T".to_owned()));
    assert!(titles.contains(&"Goal B T".to_owned()));

    // Brainstorm cost (default 2) was charged; finalization regenerated.
    let state = store.heartbeat_state().await.expect("state");
    let expected = energy_before
        .saturating_sub(2)
        .saturating_add(state.base_regeneration)
        .min(state.max_energy);
    assert_eq!(state.current_energy, expected);

    // Replaying an already-finalized heartbeat is a no-op.
    let replay = store
        .apply_heartbeat_decision(hb, &decision, 0)
        .await
        .expect("replay");
    assert!(replay.completed);
    assert_eq!(replay.memory_id, Some(memory_id));

    // --- S5: boundary blocks a tool --------------------------------------
    create_tool_boundary(
        &store,
        "I will not execute shell commands.",
        &["shell".to_owned()],
        &[],
    )
    .await
    .expect("boundary");

    let registry = create_default_registry(store.clone());
    let result = registry
        .execute("shell", &json!({"command": "ls"}), heartbeat_context(10))
        .await;
    assert!(!result.success);
    assert_eq!(result.error_type, Some(ToolErrorType::BoundaryViolation));
    assert_eq!(result.energy_spent, 0);

    // --- S6: two workers, one queue --------------------------------------
    let before = count_outbox(&store).await;
    for i in 0..10 {
        store
            .enqueue_external_call(
                "outbox_message",
                &json!({"message": format!("drain {i}")}),
                None,
            )
            .await
            .expect("enqueue");
    }

    let worker = |store: Store| async move {
        let broker = CallBroker::new(store);
        let mut applied: u32 = 0;
        loop {
            match broker.claim_pending_call().await.expect("claim") {
                Some(call) => {
                    broker
                        .apply_result(call.id, &json!({"kind": "drained"}))
                        .await
                        .expect("apply");
                    applied = applied.saturating_add(1);
                }
                None => return applied,
            }
        }
    };

    let (a, b) = tokio::join!(worker(store.clone()), worker(store.clone()));
    assert_eq!(a.saturating_add(b), 10, "each call drained exactly once");
    let after = count_outbox(&store).await;
    assert_eq!(
        after.saturating_sub(before),
        10,
        "each domain effect applied exactly once"
    );
}

async fn count_outbox(store: &Store) -> usize {
    store
        .pending_outbox(1000)
        .await
        .expect("outbox query")
        .len()
}

#[tokio::test]
async fn deliberate_transformation_protocol() {
    let Some(store) = test_store().await else {
        eprintln!("HEXIS_TEST_DSN not set; skipping substrate tests");
        return;
    };

    store
        .set_config(
            "transformation.personality",
            &json!({
                "stability": 0.99,
                "evidence_threshold": 0.1,
                "min_reflections": 1,
                "min_heartbeats": 0
            }),
            "test thresholds",
        )
        .await
        .expect("config");

    let belief = store
        .create_memory(
            "worldview",
            "I hold a personality belief",
            0.9,
            &json!({
                "subcategory": "personality",
                "origin": "user_initialized",
                "change_requires": "deliberate_transformation",
                "stability": 0.9,
                "confidence": 0.9,
                "change_history": []
            }),
        )
        .await
        .expect("belief");
    let goal = store
        .create_goal("Explore belief", Some("exploration"), "queued", "curiosity")
        .await
        .expect("goal");
    let evidence = store
        .create_memory(
            "semantic",
            "Strong counter-evidence",
            0.95,
            &json!({"trust": 0.95}),
        )
        .await
        .expect("evidence");

    // Attempting before any exploration is refused without mutation.
    let premature = store
        .attempt_worldview_transformation(belief, "Updated belief content", "shift")
        .await
        .expect("attempt");
    assert!(!premature.success);

    let begun = store
        .begin_belief_exploration(belief, goal)
        .await
        .expect("begin");
    assert!(begun.success);
    let doc = store
        .get_memory(belief)
        .await
        .expect("memory query")
        .expect("belief exists");
    assert_eq!(
        doc["metadata"]["transformation_state"]["active_exploration"],
        json!(true)
    );

    // Attempting with zero reflections is refused and leaves state active.
    let unready = store
        .attempt_worldview_transformation(belief, "Updated belief content", "shift")
        .await
        .expect("attempt");
    assert!(!unready.success);
    let doc = store
        .get_memory(belief)
        .await
        .expect("memory query")
        .expect("belief exists");
    assert_eq!(
        doc["metadata"]["transformation_state"]["active_exploration"],
        json!(true)
    );
    assert_eq!(doc["content"], json!("I hold a personality belief"));

    let effort = store
        .record_transformation_effort(belief, "reflect", "considered deeply", Some(evidence))
        .await
        .expect("record");
    assert!(effort.success);
    assert_eq!(effort.reflection_count, 1);

    // S2: with thresholds satisfied, the transformation commits.
    let outcome = store
        .attempt_worldview_transformation(belief, "Updated belief content", "shift")
        .await
        .expect("attempt");
    assert!(outcome.success, "expected success, got {:?}", outcome.failure);

    let doc = store
        .get_memory(belief)
        .await
        .expect("memory query")
        .expect("belief exists");
    assert_eq!(doc["content"], json!("Updated belief content"));
    assert_eq!(
        doc["metadata"]["transformation_state"]["active_exploration"],
        json!(false)
    );
    let history = doc["metadata"]["change_history"]
        .as_array()
        .expect("history array");
    assert!(!history.is_empty());

    // Calibration: only neutral_default beliefs accept it.
    let refused = store
        .calibrate_neutral_belief(belief, "strengthen", &[evidence])
        .await
        .expect("calibrate");
    assert!(!refused.success);

    let neutral = store
        .create_memory(
            "worldview",
            "People are probably trustworthy",
            0.5,
            &json!({
                "subcategory": "personality",
                "origin": "neutral_default",
                "confidence": 0.5
            }),
        )
        .await
        .expect("neutral belief");

    let calibrated = store
        .calibrate_neutral_belief(neutral, "strengthen", &[evidence])
        .await
        .expect("calibrate");
    assert!(calibrated.success);
    let doc = store
        .get_memory(neutral)
        .await
        .expect("memory query")
        .expect("belief exists");
    assert_eq!(doc["metadata"]["origin"], json!("self_discovered"));

    // Once self_discovered, calibration is closed.
    let second = store
        .calibrate_neutral_belief(neutral, "strengthen", &[evidence])
        .await
        .expect("calibrate");
    assert!(!second.success);
}

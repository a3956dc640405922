//! Operation-surface tests: dispatch pipeline, aliases, ownership

use serde_json::json;
use uuid::Uuid;

use super::{harness, onboard_agent};
use eisv_dynamics::EisvState;

use crate::error::ErrorCode;
use crate::identity::AgentStatus;
use crate::knowledge::{NoteKind, NoteSeverity};

#[tokio::test]
async fn test_unknown_operation_suggests_listing() {
    let services = harness().await;
    let response = crate::ops::dispatch(&services, "no_such_operation", json!({})).await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error_code"], "RESOURCE_NOT_FOUND");
    assert_eq!(response["recovery"][0], "list_operations");
}

#[tokio::test]
async fn test_alias_rewrites_to_canonical_operation() {
    let services = harness().await;
    // `apply_update` rewrites to `process_update`, whose schema then
    // reports the missing parameters.
    let response = crate::ops::dispatch(&services, "apply_update", json!({})).await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error_code"], "MISSING_PARAMETER");
}

#[tokio::test]
async fn test_health_check_reports_version_and_store() {
    let services = harness().await;
    let response = crate::ops::dispatch(&services, "health_check", json!({})).await;
    assert_eq!(response["ok"], true);
    assert_eq!(response["result"]["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(response["result"]["store"], "ok");
}

#[tokio::test]
async fn test_list_and_describe_operations() {
    let services = harness().await;
    let listed = crate::ops::dispatch(&services, "list_operations", json!({})).await;
    let names: Vec<String> = listed["result"]["operations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["name"].as_str().unwrap().to_string())
        .collect();
    for expected in [
        "process_update",
        "request_review",
        "submit_synthesis",
        "note_store",
        "health_check",
    ] {
        assert!(names.contains(&expected.to_string()), "missing {}", expected);
    }

    let described = crate::ops::dispatch(&services, "describe_operation", json!({ "name": "process_update" }))
        .await;
    assert_eq!(described["ok"], true);
    assert_eq!(described["result"]["timeout_seconds"], 60);
}

#[tokio::test]
async fn test_onboard_then_update_through_dispatch() {
    let services = harness().await;

    let onboarded = crate::ops::dispatch(&services,
            "onboard",
            json!({ "model": "sonnet", "session_key": "sess-1" }),
        )
        .await;
    assert_eq!(onboarded["ok"], true);
    assert_eq!(onboarded["result"]["outcome"], "created");
    let api_key = onboarded["result"]["api_key"].as_str().unwrap();
    assert_eq!(api_key.len(), 64);
    // The public view never carries the key hash.
    assert!(onboarded["result"]["identity"].get("api_key_hash").is_none());

    let updated = crate::ops::dispatch(&services,
            "process_update",
            json!({
                "session_key": "sess-1",
                "parameters": vec![0.0; 128],
                "ethical_drift": [0.1, 0.1, 0.1],
                "complexity": 0.3,
                "confidence": 0.9,
                "ci_passed": true,
            }),
        )
        .await;
    assert_eq!(updated["ok"], true, "response: {}", updated);
    assert_eq!(updated["result"]["verdict"], "approve");
    assert_eq!(updated["result"]["auto_attest"], true);
    assert_eq!(updated["result"]["total_updates"], 1);
    assert!(updated["result"]["sampling"]["temperature"].is_number());
}

#[tokio::test]
async fn test_writes_bind_to_session_identity() {
    let services = harness().await;
    let (other, _) = onboard_agent(&services, "other", &[]).await;

    let onboarded = crate::ops::dispatch(&services,
            "onboard",
            json!({ "model": "mine", "session_key": "sess-mine" }),
        )
        .await;
    let mine = onboarded["result"]["identity"]["uuid"].as_str().unwrap().to_string();

    // The caller names another agent; the write proceeds against the
    // session-bound identity anyway.
    let updated = crate::ops::dispatch(&services,
            "process_update",
            json!({
                "session_key": "sess-mine",
                "agent_uuid": other.uuid,
                "parameters": vec![0.0; 128],
                "ethical_drift": [0.0, 0.0, 0.0],
                "confidence": 1.0,
                "ci_passed": true,
            }),
        )
        .await;
    assert_eq!(updated["ok"], true);
    assert_eq!(updated["result"]["agent_uuid"], mine.as_str());

    // The named agent was never touched.
    assert!(services.store.load_state(other.uuid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_mutations_require_authentication() {
    let services = harness().await;
    let response = crate::ops::dispatch(&services,
            "process_update",
            json!({
                "parameters": vec![0.0; 128],
                "ethical_drift": [0.0, 0.0, 0.0],
            }),
        )
        .await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error_code"], "AUTHENTICATION_REQUIRED");
}

#[tokio::test]
async fn test_onboard_ambiguous_existing_is_not_an_error() {
    let services = harness().await;
    let first = crate::ops::dispatch(&services, "onboard", json!({ "fingerprint": "tty-1" }))
        .await;
    assert_eq!(first["result"]["outcome"], "created");

    let second = crate::ops::dispatch(&services, "onboard", json!({ "fingerprint": "tty-1" }))
        .await;
    assert_eq!(second["ok"], true);
    assert_eq!(second["result"]["outcome"], "ambiguous_existing");
    assert_eq!(second["result"]["error_code"], "AMBIGUOUS_EXISTING");
    assert!(second["result"]["candidate"]["uuid"].is_string());

    let adopted = crate::ops::dispatch(&services, "onboard", json!({ "fingerprint": "tty-1", "resume": true }))
        .await;
    assert_eq!(adopted["result"]["outcome"], "resolved");
    assert_eq!(
        adopted["result"]["identity"]["uuid"],
        second["result"]["candidate"]["uuid"]
    );
}

#[tokio::test]
async fn test_note_rate_limit_enforced() {
    let services = harness().await;
    let (author, _) = onboard_agent(&services, "author", &[]).await;

    for n in 0..20 {
        services
            .knowledge
            .store_note(
                author.uuid,
                format!("note {}", n),
                None,
                NoteKind::Insight,
                NoteSeverity::Low,
                vec![],
                None,
            )
            .await
            .unwrap();
    }
    let err = services
        .knowledge
        .store_note(
            author.uuid,
            "one too many".to_string(),
            None,
            NoteKind::Insight,
            NoteSeverity::Low,
            vec![],
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);
}

#[tokio::test]
async fn test_note_store_and_search_through_dispatch() {
    let services = harness().await;
    crate::ops::dispatch(&services,
            "onboard",
            json!({ "model": "author", "session_key": "sess-a" }),
        )
        .await;

    let stored = crate::ops::dispatch(&services,
            "note_store",
            json!({
                "session_key": "sess-a",
                "summary": "retrieval loops amplify entropy",
                "note_kind": "pattern",
                "severity": "medium",
                "tags": ["retrieval", "entropy"],
            }),
        )
        .await;
    assert_eq!(stored["ok"], true, "response: {}", stored);

    let found = crate::ops::dispatch(&services, "note_search", json!({ "query": "entropy retrieval" }))
        .await;
    assert_eq!(found["ok"], true);
    assert_eq!(found["result"]["notes"].as_array().unwrap().len(), 1);

    // Alias for the consolidated surface.
    let found = crate::ops::dispatch(&services, "search", json!({ "query": "entropy" }))
        .await;
    assert_eq!(found["ok"], true);
}

#[tokio::test]
async fn test_recovery_options_through_dispatch() {
    let services = harness().await;
    crate::ops::dispatch(&services,
            "onboard",
            json!({ "model": "stuck", "session_key": "sess-s" }),
        )
        .await;

    let options = crate::ops::dispatch(&services, "check_recovery_options", json!({ "session_key": "sess-s" }))
        .await;
    assert_eq!(options["ok"], true);
    assert_eq!(options["result"]["status"], "active");
    assert_eq!(options["result"]["safe"], true);
}

#[tokio::test]
async fn test_aggregate_metrics_and_telemetry() {
    let services = harness().await;
    crate::ops::dispatch(&services,
            "onboard",
            json!({ "model": "sonnet", "session_key": "sess-m" }),
        )
        .await;
    crate::ops::dispatch(&services,
            "process_update",
            json!({
                "session_key": "sess-m",
                "parameters": vec![0.0; 128],
                "ethical_drift": [0.0, 0.0, 0.0],
                "confidence": 1.0,
                "ci_passed": true,
            }),
        )
        .await;

    let aggregated = crate::ops::dispatch(&services, "aggregate_metrics", json!({})).await;
    assert_eq!(aggregated["ok"], true);
    assert_eq!(aggregated["result"]["agents"], 1);

    let telemetry = crate::ops::dispatch(&services, "telemetry", json!({})).await;
    assert_eq!(telemetry["ok"], true);
    assert_eq!(telemetry["result"]["updates.total"], 1);
}

#[tokio::test]
async fn test_lifecycle_ops_bind_to_session_identity() {
    let services = harness().await;
    let (other, _) = onboard_agent(&services, "other", &[]).await;

    let onboarded = crate::ops::dispatch(&services,
            "onboard",
            json!({ "model": "mine", "session_key": "sess-lc" }),
        )
        .await;
    let mine = Uuid::parse_str(onboarded["result"]["identity"]["uuid"].as_str().unwrap()).unwrap();

    // Naming another agent must not let the caller archive it; the
    // transition lands on the session-bound identity.
    let archived = crate::ops::dispatch(&services,
            "agent_archive",
            json!({ "session_key": "sess-lc", "agent_uuid": other.uuid }),
        )
        .await;
    assert_eq!(archived["ok"], true, "response: {}", archived);
    assert_eq!(archived["result"]["agent_uuid"], mine.to_string().as_str());

    let untouched = services.resolver.require_identity(other.uuid).await.unwrap();
    assert_eq!(untouched.status, AgentStatus::Active);
    let caller = services.resolver.require_identity(mine).await.unwrap();
    assert_eq!(caller.status, AgentStatus::Archived);

    // Same rule on the way back out, and for soft delete.
    let unarchived = crate::ops::dispatch(&services,
            "agent_unarchive",
            json!({ "session_key": "sess-lc", "agent_uuid": other.uuid }),
        )
        .await;
    assert_eq!(unarchived["ok"], true);
    let caller = services.resolver.require_identity(mine).await.unwrap();
    assert_eq!(caller.status, AgentStatus::Active);

    let deleted = crate::ops::dispatch(&services,
            "agent_delete",
            json!({ "session_key": "sess-lc", "agent_uuid": other.uuid }),
        )
        .await;
    assert_eq!(deleted["ok"], true);
    let untouched = services.resolver.require_identity(other.uuid).await.unwrap();
    assert_eq!(untouched.status, AgentStatus::Active);
    let caller = services.resolver.require_identity(mine).await.unwrap();
    assert_eq!(caller.status, AgentStatus::Deleted);
}

#[tokio::test]
async fn test_detect_anomalies_flags_non_finite_state() {
    let services = harness().await;
    let (agent, _) = onboard_agent(&services, "broken", &[]).await;

    let mut state = EisvState::genesis(services.engine.params());
    state.e = f64::NAN;
    services.store.save_state(agent.uuid, &state).await.unwrap();

    let report = services
        .observability
        .detect_anomalies(agent.uuid)
        .await
        .unwrap();
    let kinds: Vec<&str> = report["anomalies"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|a| a["kind"].as_str())
        .collect();
    assert!(kinds.contains(&"non_finite"), "kinds: {:?}", kinds);
}

#[tokio::test]
async fn test_aggregate_metrics_skips_archived_agents() {
    let services = harness().await;
    let (live, _) = onboard_agent(&services, "live", &[]).await;
    let (frozen, _) = onboard_agent(&services, "frozen", &[]).await;

    let state = EisvState::genesis(services.engine.params());
    services.store.save_state(live.uuid, &state).await.unwrap();
    services.store.save_state(frozen.uuid, &state).await.unwrap();
    services
        .resolver
        .transition_status(frozen.uuid, AgentStatus::Archived, "test")
        .await
        .unwrap();

    let aggregated = crate::ops::dispatch(&services, "aggregate_metrics", json!({})).await;
    assert_eq!(aggregated["ok"], true);
    assert_eq!(aggregated["result"]["agents"], 1);
}

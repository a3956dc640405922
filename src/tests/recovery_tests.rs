//! Stuck-detector and auto-recovery tests

use chrono::{Duration, Utc};
use std::sync::Arc;

use super::{harness, onboard_agent};
use eisv_dynamics::{EisvState, Margin};

use crate::identity::{AUTONOMOUS_TAG, AgentIdentity, AgentStatus};
use crate::knowledge::NoteFilter;
use crate::ops::Services;
use crate::recovery::patterns::PatternTracker;
use crate::store::SessionFilter;

/// Persist a crafted state with the given margin, backdated by `age_secs`.
async fn seed_state(
    services: &Arc<Services>,
    identity: &AgentIdentity,
    coherence: f64,
    risk: f64,
    v: f64,
    margin: Margin,
    age_secs: i64,
) {
    let mut state = EisvState::genesis(services.engine.params());
    state.coherence = coherence;
    state.risk_score = risk;
    state.v = v;
    state.margin = margin;
    state.updated_at = Utc::now() - Duration::seconds(age_secs);
    services.store.save_state(identity.uuid, &state).await.unwrap();
}

async fn audit_actions(services: &Arc<Services>) -> Vec<String> {
    services
        .audit
        .recent(None, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect()
}

#[tokio::test]
async fn test_safe_paused_agent_auto_resumes() {
    let services = harness().await;
    let (agent, _) = onboard_agent(&services, "worker", &[]).await;

    seed_state(&services, &agent, 0.55, 0.35, 0.02, Margin::Critical, 6 * 60).await;
    services
        .resolver
        .transition_status(agent.uuid, AgentStatus::Paused, "test")
        .await
        .unwrap();

    services.detector.tick().await.unwrap();

    // Safety predicate held: resumed directly, no dialectic session.
    let resumed = services.resolver.require_identity(agent.uuid).await.unwrap();
    assert_eq!(resumed.status, AgentStatus::Active);
    assert!(
        services
            .store
            .open_session_for_agent(agent.uuid)
            .await
            .unwrap()
            .is_none()
    );

    let events = services.audit.recent(None, 100).await.unwrap();
    let resume_event = events
        .iter()
        .find(|e| e.action == "recovery.auto_resumed")
        .expect("auto-resume audited");
    assert!(resume_event.tags.contains(&"auto-recovery".to_string()));
    assert!(resume_event.tags.contains(&"stuck-agent".to_string()));

    let notes = services
        .knowledge
        .list(NoteFilter {
            tag: Some("auto-recovery".to_string()),
            ..NoteFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].summary.contains("critical_margin_timeout"));
}

#[tokio::test]
async fn test_unsafe_paused_agent_gets_dialectic_review() {
    let services = harness().await;
    let (stuck, _) = onboard_agent(&services, "stuck", &["retrieval"]).await;
    let (reviewer, _) = onboard_agent(&services, "reviewer", &["retrieval"]).await;

    seed_state(&services, &stuck, 0.30, 0.65, 0.0, Margin::Critical, 6 * 60).await;
    services
        .resolver
        .transition_status(stuck.uuid, AgentStatus::Paused, "test")
        .await
        .unwrap();

    services.detector.tick().await.unwrap();

    // Unsafe: a session opened with the reviewer, the agent stays paused.
    let session = services
        .store
        .open_session_for_agent(stuck.uuid)
        .await
        .unwrap()
        .expect("dialectic session opened");
    assert_eq!(session.reviewer_agent_uuid, reviewer.uuid);
    assert!((session.paused_agent_state_snapshot.coherence - 0.30).abs() < 1e-12);

    let still_paused = services.resolver.require_identity(stuck.uuid).await.unwrap();
    assert_eq!(still_paused.status, AgentStatus::Paused);

    let events = services.audit.recent(None, 100).await.unwrap();
    let trigger = events
        .iter()
        .find(|e| e.action == "recovery.dialectic_opened")
        .expect("dialectic trigger audited");
    for tag in ["dialectic-trigger", "stuck-agent", "unsafe-recovery"] {
        assert!(trigger.tags.contains(&tag.to_string()), "missing {}", tag);
    }
}

#[tokio::test]
async fn test_autonomous_agents_excluded_from_detection() {
    let services = harness().await;
    let (creature, _) = onboard_agent(&services, "creature", &[AUTONOMOUS_TAG]).await;

    seed_state(&services, &creature, 0.2, 0.9, 0.0, Margin::Critical, 60 * 60).await;
    services
        .resolver
        .transition_status(creature.uuid, AgentStatus::Paused, "test")
        .await
        .unwrap();

    services.detector.tick().await.unwrap();

    // Never recovered, never reviewed.
    let untouched = services.resolver.require_identity(creature.uuid).await.unwrap();
    assert_eq!(untouched.status, AgentStatus::Paused);
    assert!(
        services
            .store
            .open_session_for_agent(creature.uuid)
            .await
            .unwrap()
            .is_none()
    );
    let actions = audit_actions(&services).await;
    assert!(!actions.iter().any(|a| a.starts_with("recovery.")));
}

#[tokio::test]
async fn test_activity_timeout_detected_for_active_agent() {
    let services = harness().await;
    let (idle, _) = onboard_agent(&services, "idle", &[]).await;

    seed_state(
        &services,
        &idle,
        0.55,
        0.2,
        0.0,
        Margin::Comfortable,
        31 * 60,
    )
    .await;

    services.detector.tick().await.unwrap();

    // Safe and already active: the detection is audited, nothing else
    // changes.
    let actions = audit_actions(&services).await;
    assert!(actions.contains(&"recovery.auto_resumed".to_string()));
    let identity = services.resolver.require_identity(idle.uuid).await.unwrap();
    assert_eq!(identity.status, AgentStatus::Active);
}

#[tokio::test]
async fn test_cognitive_loop_detection() {
    let services = harness().await;
    let (looper, _) = onboard_agent(&services, "looper", &[]).await;
    seed_state(&services, &looper, 0.55, 0.2, 0.0, Margin::Comfortable, 30).await;

    let fingerprint = PatternTracker::fingerprint(Some("search"), &[1.0, 2.0]);
    for _ in 0..3 {
        services.patterns.record(looper.uuid, fingerprint.clone());
    }

    services.detector.tick().await.unwrap();

    let events = services.audit.recent(None, 100).await.unwrap();
    let detected = events
        .iter()
        .find(|e| e.action == "recovery.auto_resumed")
        .expect("loop detection audited");
    assert_eq!(detected.details["cause"], "cognitive_loop");
}

#[tokio::test]
async fn test_existing_session_left_alone() {
    let services = harness().await;
    let (stuck, _) = onboard_agent(&services, "stuck", &[]).await;
    let (_reviewer, _) = onboard_agent(&services, "reviewer", &[]).await;

    seed_state(&services, &stuck, 0.30, 0.65, 0.0, Margin::Critical, 6 * 60).await;
    services
        .resolver
        .transition_status(stuck.uuid, AgentStatus::Paused, "test")
        .await
        .unwrap();

    services.detector.tick().await.unwrap();
    let first = services
        .store
        .open_session_for_agent(stuck.uuid)
        .await
        .unwrap()
        .expect("first tick opens a session");

    // A second tick must not open another.
    services.detector.tick().await.unwrap();
    let sessions = services
        .store
        .list_sessions(&SessionFilter {
            participant: Some(stuck.uuid),
            ..SessionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, first.session_id);
}

#[tokio::test]
async fn test_fresh_comfortable_agent_not_flagged() {
    let services = harness().await;
    let (healthy, _) = onboard_agent(&services, "healthy", &[]).await;
    seed_state(&services, &healthy, 0.6, 0.2, 0.0, Margin::Comfortable, 30).await;

    services.detector.tick().await.unwrap();

    let actions = audit_actions(&services).await;
    assert!(!actions.iter().any(|a| a.starts_with("recovery.")));
}

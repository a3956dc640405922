//! Identity resolution and write-ownership tests

use super::{harness, onboard_agent};
use crate::error::ErrorCode;
use crate::identity::{AgentStatus, ResolveRequest, Resolution, verify_api_key};

#[tokio::test]
async fn test_explicit_resolution_verifies_key() {
    let services = harness().await;
    let (identity, api_key) = onboard_agent(&services, "sonnet", &[]).await;

    let resolved = services
        .resolver
        .resolve(ResolveRequest::Explicit {
            agent_uuid: identity.uuid,
            api_key: api_key.clone(),
        })
        .await
        .unwrap();
    match resolved {
        Resolution::Resolved { identity: found } => assert_eq!(found.uuid, identity.uuid),
        other => panic!("expected resolved, got {:?}", other),
    }

    let err = services
        .resolver
        .resolve(ResolveRequest::Explicit {
            agent_uuid: identity.uuid,
            api_key: "0".repeat(64),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthFailed);
}

#[tokio::test]
async fn test_plaintext_key_never_stored() {
    let services = harness().await;
    let (identity, api_key) = onboard_agent(&services, "sonnet", &[]).await;
    assert_ne!(identity.api_key_hash, api_key);
    assert!(verify_api_key(&api_key, &identity.api_key_hash));
}

#[tokio::test]
async fn test_fingerprint_prompt_on_resume() {
    let services = harness().await;

    // First contact creates.
    let created = services
        .resolver
        .resolve(ResolveRequest::Fingerprint {
            fingerprint: "tty-7f3a".to_string(),
            resume: false,
            force_new: false,
            model: Some("sonnet".to_string()),
        })
        .await
        .unwrap();
    let created_uuid = match created {
        Resolution::Created { identity, .. } => identity.uuid,
        other => panic!("expected created, got {:?}", other),
    };

    // Second contact without an explicit claim must not silently adopt.
    let ambiguous = services
        .resolver
        .resolve(ResolveRequest::Fingerprint {
            fingerprint: "tty-7f3a".to_string(),
            resume: false,
            force_new: false,
            model: None,
        })
        .await
        .unwrap();
    match ambiguous {
        Resolution::AmbiguousExisting { candidate } => {
            assert_eq!(candidate.uuid, created_uuid);
            assert_eq!(candidate.suggested_actions.len(), 2);
        }
        other => panic!("expected ambiguous, got {:?}", other),
    }

    // resume = true adopts the same identity, repeatedly.
    for _ in 0..2 {
        let resolved = services
            .resolver
            .resolve(ResolveRequest::Fingerprint {
                fingerprint: "tty-7f3a".to_string(),
                resume: true,
                force_new: false,
                model: None,
            })
            .await
            .unwrap();
        match resolved {
            Resolution::Resolved { identity } => assert_eq!(identity.uuid, created_uuid),
            other => panic!("expected resolved, got {:?}", other),
        }
    }

    // force_new creates a distinct identity.
    let fresh = services
        .resolver
        .resolve(ResolveRequest::Fingerprint {
            fingerprint: "tty-7f3a".to_string(),
            resume: false,
            force_new: true,
            model: None,
        })
        .await
        .unwrap();
    match fresh {
        Resolution::Created { identity, .. } => assert_ne!(identity.uuid, created_uuid),
        other => panic!("expected created, got {:?}", other),
    }
}

#[tokio::test]
async fn test_session_binding_roundtrip() {
    let services = harness().await;
    let (identity, _) = onboard_agent(&services, "sonnet", &[]).await;

    services
        .resolver
        .bind_session("sess-alpha", identity.uuid)
        .await
        .unwrap();

    for _ in 0..3 {
        let resolved = services
            .resolver
            .resolve(ResolveRequest::SessionKey {
                session_key: "sess-alpha".to_string(),
            })
            .await
            .unwrap();
        match resolved {
            Resolution::Resolved { identity: found } => assert_eq!(found.uuid, identity.uuid),
            other => panic!("expected resolved, got {:?}", other),
        }
    }

    let err = services
        .resolver
        .resolve(ResolveRequest::SessionKey {
            session_key: "sess-unknown".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthenticationRequired);
}

#[tokio::test]
async fn test_session_binding_survives_cache_eviction() {
    let services = harness().await;
    let (identity, _) = onboard_agent(&services, "sonnet", &[]).await;
    services
        .resolver
        .bind_session("sess-evicted", identity.uuid)
        .await
        .unwrap();

    // Simulate eviction; the durable binding must repopulate.
    services.cache.invalidate("sess-evicted").await;
    let resolved = services
        .resolver
        .resolve(ResolveRequest::SessionKey {
            session_key: "sess-evicted".to_string(),
        })
        .await
        .unwrap();
    match resolved {
        Resolution::Resolved { identity: found } => assert_eq!(found.uuid, identity.uuid),
        other => panic!("expected resolved, got {:?}", other),
    }
}

#[tokio::test]
async fn test_key_rotation_requires_current_key() {
    let services = harness().await;
    let (identity, api_key) = onboard_agent(&services, "sonnet", &[]).await;

    let err = services
        .resolver
        .rotate_key(identity.uuid, Some("wrong"), false)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthFailed);

    let new_key = services
        .resolver
        .rotate_key(identity.uuid, Some(&api_key), false)
        .await
        .unwrap();
    assert_ne!(new_key, api_key);

    // Old key no longer verifies.
    let updated = services
        .resolver
        .require_identity(identity.uuid)
        .await
        .unwrap();
    assert!(!verify_api_key(&api_key, &updated.api_key_hash));
    assert!(verify_api_key(&new_key, &updated.api_key_hash));
}

#[tokio::test]
async fn test_lifecycle_transitions_enforced() {
    let services = harness().await;
    let (identity, _) = onboard_agent(&services, "sonnet", &[]).await;

    services
        .resolver
        .transition_status(identity.uuid, AgentStatus::Archived, "test")
        .await
        .unwrap();

    // Archived accepts only the transition back to active (or soft
    // delete).
    let err = services
        .resolver
        .transition_status(identity.uuid, AgentStatus::Paused, "test")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);

    let back = services
        .resolver
        .transition_status(identity.uuid, AgentStatus::Active, "test")
        .await
        .unwrap();
    assert_eq!(back.status, AgentStatus::Active);
    assert!(back.archived_at.is_none());
}

#[tokio::test]
async fn test_deleted_identities_hidden_from_listings() {
    let services = harness().await;
    let (kept, _) = onboard_agent(&services, "keeper", &[]).await;
    let (dropped, _) = onboard_agent(&services, "dropper", &[]).await;

    services
        .resolver
        .transition_status(dropped.uuid, AgentStatus::Deleted, "test")
        .await
        .unwrap();

    let listed = services
        .store
        .list_identities(&crate::store::IdentityFilter::default())
        .await
        .unwrap();
    let uuids: Vec<_> = listed.iter().map(|i| i.uuid).collect();
    assert!(uuids.contains(&kept.uuid));
    assert!(!uuids.contains(&dropped.uuid));
}

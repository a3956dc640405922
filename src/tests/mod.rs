//! Integration tests over the in-memory store

mod identity_tests;
mod ops_tests;
mod recovery_tests;

use std::sync::Arc;

use crate::identity::{AgentIdentity, IdentityInit};
use crate::ops::Services;

/// Fresh in-memory service stack.
pub(crate) async fn harness() -> Arc<Services> {
    Services::for_testing().await
}

/// Create an identity and return it with its plaintext key.
pub(crate) async fn onboard_agent(
    services: &Arc<Services>,
    model: &str,
    tags: &[&str],
) -> (AgentIdentity, String) {
    services
        .resolver
        .create(IdentityInit {
            model: Some(model.to_string()),
            display_name: None,
            transport_fingerprint: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        })
        .await
        .expect("identity creation")
}

/// A well-formed update request with the given confidence.
pub(crate) fn update_request(confidence: f64) -> crate::engine::UpdateRequest {
    crate::engine::UpdateRequest {
        parameters: vec![0.0; 128],
        ethical_drift: vec![0.1, 0.1, 0.1],
        response_text: None,
        complexity: Some(0.3),
        confidence,
        ci_passed: true,
        external_validation: false,
        task_type: Some("coding".to_string()),
    }
}

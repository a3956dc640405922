//! Identity resolution: map request contexts to one canonical agent
//!
//! The resolver is the only writer of identity records. It never silently
//! adopts an existing identity: when a candidate matches but the caller
//! asserted neither `resume` nor `force_new`, the contract-defined
//! `AmbiguousExisting` outcome describes the candidate and the two
//! follow-ups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use eisv_dynamics::GenesisSignature;

use super::{
    AgentIdentity, AgentStatus, TrustTier, build_agent_id, generate_api_key, verify_api_key,
};
use crate::audit::{AuditEvent, AuditLog};
use crate::cache::SessionCache;
use crate::error::{ErrorCode, GovError, GovResult};
use crate::store::Store;

/// How an incoming request identifies itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ResolveRequest {
    /// Explicit credentials; key mismatch is fatal.
    Explicit { agent_uuid: Uuid, api_key: String },
    /// Fast path through the session cache.
    SessionKey { session_key: String },
    /// Human display name, adopted only with an explicit claim.
    DisplayName {
        display_name: String,
        #[serde(default)]
        resume: bool,
        #[serde(default)]
        force_new: bool,
        #[serde(default)]
        model: Option<String>,
    },
    /// Stable transport sub-identifier.
    Fingerprint {
        fingerprint: String,
        #[serde(default)]
        resume: bool,
        #[serde(default)]
        force_new: bool,
        #[serde(default)]
        model: Option<String>,
    },
}

/// Candidate description returned by the prompt-on-resume rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub uuid: Uuid,
    pub agent_id: String,
    pub display_name: Option<String>,
    pub last_active: DateTime<Utc>,
    pub update_count: u64,
    /// Follow-up actions the caller picks between.
    pub suggested_actions: Vec<String>,
}

/// Outcome of a resolve call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Resolution {
    Resolved { identity: AgentIdentity },
    /// Fresh identity; the plaintext key leaves the resolver exactly once.
    Created {
        identity: AgentIdentity,
        api_key_plaintext: String,
    },
    /// Contract-defined, not an error: the caller must retry with
    /// `resume = true` or `force_new = true`.
    AmbiguousExisting { candidate: CandidateSummary },
}

/// Parameters for creating a fresh identity.
#[derive(Debug, Clone, Default)]
pub struct IdentityInit {
    pub model: Option<String>,
    pub display_name: Option<String>,
    pub transport_fingerprint: Option<String>,
    pub tags: Vec<String>,
}

pub struct IdentityResolver {
    store: Arc<dyn Store>,
    cache: Arc<SessionCache>,
    audit: Arc<AuditLog>,
    session_ttl: Duration,
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<SessionCache>,
        audit: Arc<AuditLog>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            audit,
            session_ttl,
        }
    }

    /// Resolve a request context to exactly one canonical identity.
    pub async fn resolve(&self, request: ResolveRequest) -> GovResult<Resolution> {
        match request {
            ResolveRequest::Explicit { agent_uuid, api_key } => {
                let identity = self.require_identity(agent_uuid).await?;
                if !verify_api_key(&api_key, &identity.api_key_hash) {
                    return Err(GovError::auth_failed());
                }
                Ok(Resolution::Resolved { identity })
            }

            ResolveRequest::SessionKey { session_key } => {
                let identity = self.resolve_session_key(&session_key).await?;
                Ok(Resolution::Resolved { identity })
            }

            ResolveRequest::DisplayName {
                display_name,
                resume,
                force_new,
                model,
            } => {
                let candidates = self
                    .store
                    .find_identities_by_display_name(&display_name)
                    .await?;
                let candidate = candidates
                    .into_iter()
                    .filter(|c| c.status != AgentStatus::Deleted)
                    .max_by_key(|c| c.last_update_at);
                self.adopt_or_create(
                    candidate,
                    resume,
                    force_new,
                    IdentityInit {
                        model,
                        display_name: Some(display_name),
                        ..IdentityInit::default()
                    },
                )
                .await
            }

            ResolveRequest::Fingerprint {
                fingerprint,
                resume,
                force_new,
                model,
            } => {
                let candidate = self
                    .store
                    .find_identity_by_fingerprint(&fingerprint)
                    .await?
                    .filter(|c| c.status != AgentStatus::Deleted);
                self.adopt_or_create(
                    candidate,
                    resume,
                    force_new,
                    IdentityInit {
                        model,
                        transport_fingerprint: Some(fingerprint),
                        ..IdentityInit::default()
                    },
                )
                .await
            }
        }
    }

    async fn adopt_or_create(
        &self,
        candidate: Option<AgentIdentity>,
        resume: bool,
        force_new: bool,
        init: IdentityInit,
    ) -> GovResult<Resolution> {
        match candidate {
            None => {
                let (identity, plaintext) = self.create(init).await?;
                Ok(Resolution::Created {
                    identity,
                    api_key_plaintext: plaintext,
                })
            }
            Some(_) if force_new => {
                let (identity, plaintext) = self.create(init).await?;
                Ok(Resolution::Created {
                    identity,
                    api_key_plaintext: plaintext,
                })
            }
            Some(existing) if resume => Ok(Resolution::Resolved { identity: existing }),
            Some(existing) => {
                let update_count = self
                    .store
                    .load_state(existing.uuid)
                    .await?
                    .map(|s| s.total_updates)
                    .unwrap_or(0);
                Ok(Resolution::AmbiguousExisting {
                    candidate: CandidateSummary {
                        uuid: existing.uuid,
                        agent_id: existing.agent_id,
                        display_name: existing.display_name,
                        last_active: existing.last_update_at,
                        update_count,
                        suggested_actions: vec![
                            "retry with resume = true to adopt this identity".to_string(),
                            "retry with force_new = true to create a fresh identity".to_string(),
                        ],
                    },
                })
            }
        }
    }

    async fn resolve_session_key(&self, session_key: &str) -> GovResult<AgentIdentity> {
        // The cache is authoritative for the fast path but never the
        // source of truth: misses consult the durable binding and
        // repopulate.
        if let Some(uuid) = self.cache.get(session_key).await {
            if let Some(identity) = self.store.get_identity(uuid).await? {
                return Ok(identity);
            }
        }
        match self.store.get_session_binding(session_key).await? {
            Some(uuid) => {
                let identity = self.require_identity(uuid).await?;
                self.cache.put(session_key, uuid).await;
                Ok(identity)
            }
            None => Err(GovError::new(
                ErrorCode::AuthenticationRequired,
                "session key is not bound to an identity",
            )
            .with_recovery(["onboard"])),
        }
    }

    /// Create a fresh identity. The plaintext key is returned exactly once
    /// and only its hash is stored.
    pub async fn create(&self, init: IdentityInit) -> GovResult<(AgentIdentity, String)> {
        let now = Utc::now();
        let model = init.model.as_deref().unwrap_or("agent");

        // agent_id carries a random suffix; collisions are vanishingly
        // rare but checked anyway.
        let mut agent_id = build_agent_id(model, now);
        for _ in 0..3 {
            if self.store.get_identity_by_agent_id(&agent_id).await?.is_none() {
                break;
            }
            agent_id = build_agent_id(model, now);
        }

        let (plaintext, hash) = generate_api_key();
        let identity = AgentIdentity {
            uuid: Uuid::new_v4(),
            agent_id,
            display_name: init.display_name,
            api_key_hash: hash,
            transport_fingerprint: init.transport_fingerprint,
            genesis_signature: None,
            status: AgentStatus::Active,
            trust_tier: TrustTier::Unknown,
            tags: init.tags,
            created_at: now,
            last_update_at: now,
            archived_at: None,
        };
        self.store.insert_identity(&identity).await?;
        self.audit
            .append(
                AuditEvent::new(identity.uuid, "identity.created")
                    .details(serde_json::json!({ "agent_id": identity.agent_id })),
            )
            .await?;
        tracing::info!(uuid = %identity.uuid, agent_id = %identity.agent_id, "identity created");
        Ok((identity, plaintext))
    }

    /// Bind a session key to an identity, durable plus cached.
    pub async fn bind_session(&self, session_key: &str, uuid: Uuid) -> GovResult<()> {
        let expires_at = Utc::now() + chrono::Duration::seconds(self.session_ttl.as_secs() as i64);
        self.store
            .put_session_binding(session_key, uuid, expires_at)
            .await?;
        self.cache.put(session_key, uuid).await;
        Ok(())
    }

    /// Rotate the API key. Callable only by the current key holder or the
    /// administrative lifecycle primitive.
    pub async fn rotate_key(
        &self,
        uuid: Uuid,
        presented_key: Option<&str>,
        administrative: bool,
    ) -> GovResult<String> {
        let mut identity = self.require_identity(uuid).await?;
        if !administrative {
            let presented = presented_key.ok_or_else(|| {
                GovError::new(
                    ErrorCode::AuthenticationRequired,
                    "key rotation requires the current api key",
                )
            })?;
            if !verify_api_key(presented, &identity.api_key_hash) {
                return Err(GovError::auth_failed());
            }
        }
        let (plaintext, hash) = generate_api_key();
        identity.api_key_hash = hash;
        self.store.update_identity(&identity).await?;
        self.audit
            .append(AuditEvent::new(uuid, "identity.key_rotated"))
            .await?;
        Ok(plaintext)
    }

    pub async fn set_display_name(&self, uuid: Uuid, name: Option<String>) -> GovResult<AgentIdentity> {
        let mut identity = self.require_identity(uuid).await?;
        identity.display_name = name;
        self.store.update_identity(&identity).await?;
        Ok(identity)
    }

    pub async fn set_tags(&self, uuid: Uuid, tags: Vec<String>) -> GovResult<AgentIdentity> {
        let mut identity = self.require_identity(uuid).await?;
        identity.tags = tags;
        self.store.update_identity(&identity).await?;
        Ok(identity)
    }

    /// Explicit lifecycle transition. Archived and deleted identities
    /// accept no other writes.
    pub async fn transition_status(
        &self,
        uuid: Uuid,
        next: AgentStatus,
        reason: &str,
    ) -> GovResult<AgentIdentity> {
        let mut identity = self.require_identity(uuid).await?;
        if identity.status == next {
            return Ok(identity);
        }
        if !identity.status.can_transition_to(next) {
            return Err(GovError::new(
                ErrorCode::Conflict,
                format!(
                    "lifecycle transition {} -> {} is not permitted",
                    identity.status.as_str(),
                    next.as_str()
                ),
            ));
        }
        let previous = identity.status;
        identity.status = next;
        identity.archived_at = match next {
            AgentStatus::Archived => Some(Utc::now()),
            AgentStatus::Active => None,
            _ => identity.archived_at,
        };
        self.store.update_identity(&identity).await?;
        self.audit
            .append(
                AuditEvent::new(uuid, "identity.lifecycle")
                    .details(serde_json::json!({
                        "from": previous.as_str(),
                        "to": next.as_str(),
                        "reason": reason,
                    })),
            )
            .await?;
        tracing::info!(
            uuid = %uuid,
            from = previous.as_str(),
            to = next.as_str(),
            reason,
            "lifecycle transition"
        );
        Ok(identity)
    }

    /// Record the genesis signature once; immutable after capture.
    pub async fn record_genesis(
        &self,
        uuid: Uuid,
        signature: GenesisSignature,
    ) -> GovResult<()> {
        let mut identity = self.require_identity(uuid).await?;
        if identity.genesis_signature.is_some() {
            return Ok(());
        }
        identity.genesis_signature = Some(signature);
        self.store.update_identity(&identity).await?;
        self.audit
            .append(AuditEvent::new(uuid, "identity.genesis_captured"))
            .await?;
        Ok(())
    }

    /// Refresh derived fields after an accepted update.
    pub async fn note_activity(&self, uuid: Uuid, trust_tier: TrustTier) -> GovResult<()> {
        let mut identity = self.require_identity(uuid).await?;
        identity.last_update_at = Utc::now();
        identity.trust_tier = trust_tier;
        self.store.update_identity(&identity).await
    }

    pub async fn require_identity(&self, uuid: Uuid) -> GovResult<AgentIdentity> {
        self.store
            .get_identity(uuid)
            .await?
            .ok_or_else(|| GovError::agent_not_found(uuid))
    }
}

//! Agent identity: canonical records, lifecycle status, trust tiers
//!
//! Identity records are owned by the resolver; only it may create them or
//! rotate keys. Everything else holds identities by `uuid` and resolves on
//! demand.

pub mod resolver;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use eisv_dynamics::GenesisSignature;

pub use resolver::{
    CandidateSummary, IdentityInit, IdentityResolver, ResolveRequest, Resolution,
};

/// Tag that excludes an identity from stuck detection and reviewer
/// selection.
pub const AUTONOMOUS_TAG: &str = "creature/autonomous";

/// Lifecycle status. `Deleted` is soft: the record persists, hidden from
/// listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Paused,
    Archived,
    Deleted,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Archived => "archived",
            AgentStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AgentStatus::Active),
            "paused" => Some(AgentStatus::Paused),
            "archived" => Some(AgentStatus::Archived),
            "deleted" => Some(AgentStatus::Deleted),
            _ => None,
        }
    }

    /// Whether a lifecycle transition is permitted. Archived and deleted
    /// records accept no writes except the transition back to active.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        match (self, next) {
            (AgentStatus::Active, AgentStatus::Paused)
            | (AgentStatus::Active, AgentStatus::Archived)
            | (AgentStatus::Paused, AgentStatus::Active)
            | (AgentStatus::Archived, AgentStatus::Active) => true,
            (_, AgentStatus::Deleted) => true,
            _ => false,
        }
    }
}

/// Derived standing of an agent, reported in listings and candidate
/// summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Unknown,
    Boundary,
    Active,
    Trusted,
    Degraded,
}

impl TrustTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustTier::Unknown => "unknown",
            TrustTier::Boundary => "boundary",
            TrustTier::Active => "active",
            TrustTier::Trusted => "trusted",
            TrustTier::Degraded => "degraded",
        }
    }
}

/// Derive the trust tier from observed behavior.
pub fn derive_trust_tier(total_updates: u64, risk_ema: f64, ci_pass_rate: f64) -> TrustTier {
    if risk_ema >= 0.6 {
        return TrustTier::Degraded;
    }
    if total_updates >= 100 && risk_ema < 0.3 && ci_pass_rate >= 0.6 {
        return TrustTier::Trusted;
    }
    if total_updates >= 25 && risk_ema < 0.4 {
        return TrustTier::Active;
    }
    if total_updates >= 5 {
        return TrustTier::Boundary;
    }
    TrustTier::Unknown
}

/// Canonical agent identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Immutable primary identifier, never reused.
    pub uuid: Uuid,
    /// Structured human-readable tag, `<model>_<yyyymmdd>_<suffix>`.
    pub agent_id: String,
    /// Optional user-chosen label; uniqueness not required.
    pub display_name: Option<String>,
    /// SHA-256 of the API key, hex. Never returned to callers.
    pub api_key_hash: String,
    /// Stable sub-identifier extracted from the transport.
    pub transport_fingerprint: Option<String>,
    /// Fingerprint of the first accepted updates, immutable once captured.
    pub genesis_signature: Option<GenesisSignature>,
    pub status: AgentStatus,
    pub trust_tier: TrustTier,
    /// Expertise / behavior tags; drives reviewer overlap scoring.
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl AgentIdentity {
    pub fn is_autonomous(&self) -> bool {
        self.tags.iter().any(|t| t == AUTONOMOUS_TAG)
    }

    /// Redacted view safe to return to callers.
    pub fn public_view(&self) -> serde_json::Value {
        serde_json::json!({
            "uuid": self.uuid,
            "agent_id": self.agent_id,
            "display_name": self.display_name,
            "status": self.status,
            "trust_tier": self.trust_tier,
            "tags": self.tags,
            "created_at": self.created_at,
            "last_update_at": self.last_update_at,
            "archived_at": self.archived_at,
        })
    }
}

/// Generate a fresh 256-bit API key, returning `(plaintext_hex, hash_hex)`.
/// The plaintext leaves the resolver exactly once.
pub fn generate_api_key() -> (String, String) {
    let key: [u8; 32] = rand::rng().random();
    let plaintext = hex::encode(key);
    let hash = hash_api_key(&plaintext);
    (plaintext, hash)
}

/// SHA-256 of the plaintext key, hex.
pub fn hash_api_key(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Constant-time comparison of a presented key against the stored hash.
pub fn verify_api_key(presented_plaintext: &str, stored_hash: &str) -> bool {
    let presented = hash_api_key(presented_plaintext);
    let a = presented.as_bytes();
    let b = stored_hash.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Build an `agent_id` like `sonnet_20260801_k3f2` from the model name.
pub fn build_agent_id(model: &str, now: DateTime<Utc>) -> String {
    const SUFFIX_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";
    let mut rng = rand::rng();
    let suffix: String = (0..4)
        .map(|_| {
            let idx = rng.random_range(0..SUFFIX_ALPHABET.len());
            SUFFIX_ALPHABET[idx] as char
        })
        .collect();
    let model = model
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_lowercase();
    format!("{}_{}_{}", model, now.format("%Y%m%d"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_roundtrip() {
        let (plaintext, hash) = generate_api_key();
        assert_eq!(plaintext.len(), 64);
        assert_eq!(hash.len(), 64);
        assert!(verify_api_key(&plaintext, &hash));
        assert!(!verify_api_key("deadbeef", &hash));
    }

    #[test]
    fn test_keys_are_unique() {
        let (a, _) = generate_api_key();
        let (b, _) = generate_api_key();
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_transitions() {
        assert!(AgentStatus::Active.can_transition_to(AgentStatus::Paused));
        assert!(AgentStatus::Paused.can_transition_to(AgentStatus::Active));
        assert!(AgentStatus::Archived.can_transition_to(AgentStatus::Active));
        assert!(!AgentStatus::Archived.can_transition_to(AgentStatus::Paused));
        assert!(!AgentStatus::Paused.can_transition_to(AgentStatus::Archived));
        assert!(AgentStatus::Active.can_transition_to(AgentStatus::Deleted));
    }

    #[test]
    fn test_trust_tier_derivation() {
        assert_eq!(derive_trust_tier(0, 0.2, 0.0), TrustTier::Unknown);
        assert_eq!(derive_trust_tier(10, 0.2, 0.0), TrustTier::Boundary);
        assert_eq!(derive_trust_tier(30, 0.2, 0.0), TrustTier::Active);
        assert_eq!(derive_trust_tier(200, 0.1, 0.9), TrustTier::Trusted);
        assert_eq!(derive_trust_tier(200, 0.7, 0.9), TrustTier::Degraded);
    }

    #[test]
    fn test_agent_id_shape() {
        let id = build_agent_id("Sonnet-4", Utc::now());
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "sonnet-4");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn test_public_view_redacts_key_hash() {
        let identity = AgentIdentity {
            uuid: Uuid::new_v4(),
            agent_id: "m_20260801_aaaa".to_string(),
            display_name: None,
            api_key_hash: "secret".to_string(),
            transport_fingerprint: None,
            genesis_signature: None,
            status: AgentStatus::Active,
            trust_tier: TrustTier::Unknown,
            tags: vec![],
            created_at: Utc::now(),
            last_update_at: Utc::now(),
            archived_at: None,
        };
        let view = identity.public_view();
        assert!(view.get("api_key_hash").is_none());
    }
}

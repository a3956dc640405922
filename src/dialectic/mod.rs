//! Dialectic peer review: thesis / antithesis / synthesis negotiation
//!
//! A paused agent and a chosen reviewer exchange signed messages until they
//! converge on a safe resume condition, or fail terminally. Sessions are
//! owned by [`DialecticMachine`]; everything else reads them through the
//! store.

pub mod convergence;
pub mod machine;
pub mod reviewer;
pub mod safety;
pub mod signing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use eisv_dynamics::EisvState;

pub use convergence::{ConvergenceVerdict, evaluate_convergence};
pub use machine::{DialecticMachine, SynthesisOutcome};
pub use reviewer::{ReviewerCandidate, select_reviewer};
pub use safety::{GateReport, SafetyGate};
pub use signing::{canonical_encoding, sign_message, verify_signature};

/// Maximum synthesis attempts before the session fails conservatively.
pub const MAX_SYNTHESIS_ATTEMPTS: u32 = 3;

/// A session with no progress for this long is cancelled by the sweep.
pub const SESSION_PROGRESS_TIMEOUT_SECS: i64 = 3600;

/// Cooldown before a new session may be opened after a conservative
/// default.
pub const REOPEN_COOLDOWN_SECS: i64 = 3600;

/// Negotiation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialecticPhase {
    Thesis,
    Antithesis,
    Synthesis,
    Resolved,
    Failed,
    Cancelled,
}

impl DialecticPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DialecticPhase::Resolved | DialecticPhase::Failed | DialecticPhase::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DialecticPhase::Thesis => "thesis",
            DialecticPhase::Antithesis => "antithesis",
            DialecticPhase::Synthesis => "synthesis",
            DialecticPhase::Resolved => "resolved",
            DialecticPhase::Failed => "failed",
            DialecticPhase::Cancelled => "cancelled",
        }
    }
}

/// Coarse session status: active until a terminal phase is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Resolved,
    Failed,
    Cancelled,
}

/// Kind of a dialectic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Thesis,
    Antithesis,
    Synthesis,
}

/// Direction of a threshold adjustment; opposing directions on the same key
/// invalidate a synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Increase,
    Decrease,
}

/// One structured resume condition.
///
/// Equality is full structural equality; convergence overlap is computed
/// over these records, never over rendered text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedCondition {
    /// Condition class, e.g. `limit` or `threshold`.
    pub kind: String,
    /// Target key, e.g. `concurrent_tasks`.
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl ProposedCondition {
    pub fn limit(key: &str, value: impl Into<Value>) -> Self {
        Self {
            kind: "limit".to_string(),
            key: key.to_string(),
            value: value.into(),
            direction: None,
        }
    }

    /// Numeric payload, if the value is a number.
    pub fn numeric_value(&self) -> Option<f64> {
        self.value.as_f64()
    }
}

/// A signed message within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialecticMessage {
    pub seq: u32,
    pub author_uuid: Uuid,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub reasoning: String,
    pub root_cause: String,
    #[serde(default)]
    pub proposed_conditions: Vec<ProposedCondition>,
    #[serde(default)]
    pub observed_metrics: Value,
    #[serde(default)]
    pub concerns: Vec<String>,
    /// Three-valued agreement: unset until the author commits.
    pub agrees: Option<bool>,
    /// HMAC-SHA256 over the canonical encoding, hex.
    pub signature: String,
}

/// Terminal outcome payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResolution {
    pub resolution_type: String,
    #[serde(default)]
    pub conditions: Vec<ProposedCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One dialectic session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialecticSession {
    pub session_id: Uuid,
    pub paused_agent_uuid: Uuid,
    pub reviewer_agent_uuid: Uuid,
    pub topic: String,
    pub phase: DialecticPhase,
    pub status: SessionStatus,
    pub messages: Vec<DialecticMessage>,
    /// EISV state at the moment the session opened.
    pub paused_agent_state_snapshot: EisvState,
    pub resolution: Option<SessionResolution>,
    pub synthesis_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DialecticSession {
    pub fn open(
        paused_agent_uuid: Uuid,
        reviewer_agent_uuid: Uuid,
        topic: String,
        snapshot: EisvState,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            paused_agent_uuid,
            reviewer_agent_uuid,
            topic,
            phase: DialecticPhase::Thesis,
            status: SessionStatus::Active,
            messages: Vec::new(),
            paused_agent_state_snapshot: snapshot,
            resolution: None,
            synthesis_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn message_of_kind(&self, kind: MessageKind) -> Option<&DialecticMessage> {
        self.messages.iter().find(|m| m.kind == kind)
    }

    /// Whether the progress timeout has elapsed.
    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        !self.phase.is_terminal()
            && (now - self.updated_at).num_seconds() > SESSION_PROGRESS_TIMEOUT_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eisv_dynamics::DynamicsParams;

    #[test]
    fn test_condition_structural_equality() {
        let a = ProposedCondition::limit("max_tokens", 256);
        let b = ProposedCondition::limit("max_tokens", 256);
        let c = ProposedCondition::limit("max_tokens", 512);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_new_session_shape() {
        let snapshot = EisvState::genesis(&DynamicsParams::default());
        let session = DialecticSession::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "stuck recovery".to_string(),
            snapshot,
        );
        assert_eq!(session.phase, DialecticPhase::Thesis);
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.is_open());
        assert!(session.messages.is_empty());
        assert_eq!(session.synthesis_attempts, 0);
    }

    #[test]
    fn test_timeout_detection() {
        let snapshot = EisvState::genesis(&DynamicsParams::default());
        let mut session = DialecticSession::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "t".to_string(),
            snapshot,
        );
        let now = Utc::now();
        assert!(!session.timed_out(now));
        session.updated_at = now - chrono::Duration::seconds(SESSION_PROGRESS_TIMEOUT_SECS + 10);
        assert!(session.timed_out(now));
        session.phase = DialecticPhase::Resolved;
        assert!(!session.timed_out(now));
    }
}

//! Persistent store abstraction
//!
//! Key/value plus graph-lite operations over a relational backend. The
//! trait is the ownership boundary: the engine owns agent state, the
//! resolver owns identities, the dialectic machine owns sessions, and the
//! audit log is append-only for everyone.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use eisv_dynamics::{EisvState, HistoryPoint};

use crate::audit::AuditEvent;
use crate::dialectic::DialecticSession;
use crate::error::GovResult;
use crate::identity::{AgentIdentity, AgentStatus};
use crate::knowledge::{KnowledgeNote, NoteFilter};

pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Identity listing filter; soft-deleted records are hidden unless asked
/// for.
#[derive(Debug, Clone, Default)]
pub struct IdentityFilter {
    pub status: Option<AgentStatus>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Dialectic session listing filter.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Match either participant.
    pub participant: Option<Uuid>,
    /// Match the reviewer side only.
    pub reviewer: Option<Uuid>,
    pub active_only: bool,
    pub limit: Option<usize>,
}

/// Durable storage operations used by the core.
#[async_trait]
pub trait Store: Send + Sync {
    // Identities (written only by the resolver)
    async fn insert_identity(&self, identity: &AgentIdentity) -> GovResult<()>;
    async fn update_identity(&self, identity: &AgentIdentity) -> GovResult<()>;
    async fn get_identity(&self, uuid: Uuid) -> GovResult<Option<AgentIdentity>>;
    async fn get_identity_by_agent_id(&self, agent_id: &str) -> GovResult<Option<AgentIdentity>>;
    async fn find_identities_by_display_name(&self, name: &str)
        -> GovResult<Vec<AgentIdentity>>;
    async fn find_identity_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> GovResult<Option<AgentIdentity>>;
    async fn list_identities(&self, filter: &IdentityFilter) -> GovResult<Vec<AgentIdentity>>;

    // Agent state (written only by the engine, under the agent's lock)
    async fn load_state(&self, uuid: Uuid) -> GovResult<Option<EisvState>>;
    async fn save_state(&self, uuid: Uuid, state: &EisvState) -> GovResult<()>;
    async fn load_state_history(&self, uuid: Uuid, limit: usize)
        -> GovResult<Vec<HistoryPoint>>;

    // Dialectic sessions (written only by the state machine)
    async fn insert_session(&self, session: &DialecticSession) -> GovResult<()>;
    async fn update_session(&self, session: &DialecticSession) -> GovResult<()>;
    async fn get_session(&self, session_id: Uuid) -> GovResult<Option<DialecticSession>>;
    async fn open_session_for_agent(&self, uuid: Uuid)
        -> GovResult<Option<DialecticSession>>;
    async fn list_sessions(&self, filter: &SessionFilter) -> GovResult<Vec<DialecticSession>>;

    // Session bindings (durable source of truth behind the cache)
    async fn put_session_binding(
        &self,
        session_key: &str,
        uuid: Uuid,
        expires_at: DateTime<Utc>,
    ) -> GovResult<()>;
    async fn get_session_binding(&self, session_key: &str) -> GovResult<Option<Uuid>>;

    // Knowledge notes
    async fn insert_note(&self, note: &KnowledgeNote) -> GovResult<()>;
    async fn update_note(&self, note: &KnowledgeNote) -> GovResult<()>;
    async fn get_note(&self, id: Uuid) -> GovResult<Option<KnowledgeNote>>;
    async fn list_notes(&self, filter: &NoteFilter) -> GovResult<Vec<KnowledgeNote>>;

    // Audit (append-only for everyone)
    async fn append_audit(&self, event: &AuditEvent) -> GovResult<()>;
    async fn list_audit(
        &self,
        actor_uuid: Option<Uuid>,
        limit: usize,
    ) -> GovResult<Vec<AuditEvent>>;

    /// Cheap connectivity probe for `health_check`.
    async fn ping(&self) -> GovResult<()>;
}

/// Fixed-width UTC timestamp encoding so lexicographic order matches
/// chronological order in the SQL layer.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

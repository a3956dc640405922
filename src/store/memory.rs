//! In-process store used by tests and as a last-resort fallback

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use eisv_dynamics::{EisvState, HistoryPoint};

use super::{IdentityFilter, SessionFilter, Store};
use crate::audit::AuditEvent;
use crate::dialectic::{DialecticSession, SessionStatus};
use crate::error::GovResult;
use crate::identity::{AgentIdentity, AgentStatus};
use crate::knowledge::{KnowledgeNote, NoteFilter};

/// Everything in `HashMap`s behind async locks. Semantics mirror the SQL
/// layer exactly; the integration tests run against this implementation.
#[derive(Default)]
pub struct MemoryStore {
    identities: RwLock<HashMap<Uuid, AgentIdentity>>,
    states: RwLock<HashMap<Uuid, EisvState>>,
    sessions: RwLock<HashMap<Uuid, DialecticSession>>,
    bindings: RwLock<HashMap<String, (Uuid, DateTime<Utc>)>>,
    notes: RwLock<HashMap<Uuid, KnowledgeNote>>,
    audit: RwLock<Vec<AuditEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_identity(&self, identity: &AgentIdentity) -> GovResult<()> {
        self.identities
            .write()
            .await
            .insert(identity.uuid, identity.clone());
        Ok(())
    }

    async fn update_identity(&self, identity: &AgentIdentity) -> GovResult<()> {
        self.insert_identity(identity).await
    }

    async fn get_identity(&self, uuid: Uuid) -> GovResult<Option<AgentIdentity>> {
        Ok(self.identities.read().await.get(&uuid).cloned())
    }

    async fn get_identity_by_agent_id(&self, agent_id: &str) -> GovResult<Option<AgentIdentity>> {
        Ok(self
            .identities
            .read()
            .await
            .values()
            .find(|i| i.agent_id == agent_id)
            .cloned())
    }

    async fn find_identities_by_display_name(
        &self,
        name: &str,
    ) -> GovResult<Vec<AgentIdentity>> {
        Ok(self
            .identities
            .read()
            .await
            .values()
            .filter(|i| i.display_name.as_deref() == Some(name))
            .cloned()
            .collect())
    }

    async fn find_identity_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> GovResult<Option<AgentIdentity>> {
        Ok(self
            .identities
            .read()
            .await
            .values()
            .find(|i| i.transport_fingerprint.as_deref() == Some(fingerprint))
            .cloned())
    }

    async fn list_identities(&self, filter: &IdentityFilter) -> GovResult<Vec<AgentIdentity>> {
        let identities = self.identities.read().await;
        let mut out: Vec<AgentIdentity> = identities
            .values()
            .filter(|i| {
                if !filter.include_deleted && i.status == AgentStatus::Deleted {
                    return false;
                }
                filter.status.map_or(true, |s| i.status == s)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn load_state(&self, uuid: Uuid) -> GovResult<Option<EisvState>> {
        Ok(self.states.read().await.get(&uuid).cloned())
    }

    async fn save_state(&self, uuid: Uuid, state: &EisvState) -> GovResult<()> {
        self.states.write().await.insert(uuid, state.clone());
        Ok(())
    }

    async fn load_state_history(
        &self,
        uuid: Uuid,
        limit: usize,
    ) -> GovResult<Vec<HistoryPoint>> {
        Ok(self
            .states
            .read()
            .await
            .get(&uuid)
            .map(|s| s.history.last_n(limit).into_iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_session(&self, session: &DialecticSession) -> GovResult<()> {
        self.sessions
            .write()
            .await
            .insert(session.session_id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &DialecticSession) -> GovResult<()> {
        self.insert_session(session).await
    }

    async fn get_session(&self, session_id: Uuid) -> GovResult<Option<DialecticSession>> {
        Ok(self.sessions.read().await.get(&session_id).cloned())
    }

    async fn open_session_for_agent(
        &self,
        uuid: Uuid,
    ) -> GovResult<Option<DialecticSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.paused_agent_uuid == uuid && s.status == SessionStatus::Active)
            .cloned())
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> GovResult<Vec<DialecticSession>> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<DialecticSession> = sessions
            .values()
            .filter(|s| {
                if filter.active_only && s.status != SessionStatus::Active {
                    return false;
                }
                if let Some(p) = filter.participant {
                    if s.paused_agent_uuid != p && s.reviewer_agent_uuid != p {
                        return false;
                    }
                }
                if let Some(r) = filter.reviewer {
                    if s.reviewer_agent_uuid != r {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn put_session_binding(
        &self,
        session_key: &str,
        uuid: Uuid,
        expires_at: DateTime<Utc>,
    ) -> GovResult<()> {
        self.bindings
            .write()
            .await
            .insert(session_key.to_string(), (uuid, expires_at));
        Ok(())
    }

    async fn get_session_binding(&self, session_key: &str) -> GovResult<Option<Uuid>> {
        let mut bindings = self.bindings.write().await;
        match bindings.get(session_key) {
            Some((uuid, expires_at)) if *expires_at > Utc::now() => Ok(Some(*uuid)),
            Some(_) => {
                bindings.remove(session_key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn insert_note(&self, note: &KnowledgeNote) -> GovResult<()> {
        self.notes.write().await.insert(note.id, note.clone());
        Ok(())
    }

    async fn update_note(&self, note: &KnowledgeNote) -> GovResult<()> {
        self.insert_note(note).await
    }

    async fn get_note(&self, id: Uuid) -> GovResult<Option<KnowledgeNote>> {
        Ok(self.notes.read().await.get(&id).cloned())
    }

    async fn list_notes(&self, filter: &NoteFilter) -> GovResult<Vec<KnowledgeNote>> {
        let notes = self.notes.read().await;
        let mut out: Vec<KnowledgeNote> = notes
            .values()
            .filter(|n| {
                filter.author_uuid.map_or(true, |a| n.author_uuid == a)
                    && filter.status.map_or(true, |s| n.status == s)
                    && filter
                        .tag
                        .as_ref()
                        .map_or(true, |t| n.tags.iter().any(|tag| tag == t))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn append_audit(&self, event: &AuditEvent) -> GovResult<()> {
        self.audit.write().await.push(event.clone());
        Ok(())
    }

    async fn list_audit(
        &self,
        actor_uuid: Option<Uuid>,
        limit: usize,
    ) -> GovResult<Vec<AuditEvent>> {
        let audit = self.audit.read().await;
        Ok(audit
            .iter()
            .rev()
            .filter(|e| actor_uuid.map_or(true, |a| e.actor_uuid == a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> GovResult<()> {
        Ok(())
    }
}

//! SQL store over postgres (default) or sqlite (fallback)
//!
//! One portable implementation: indexed scalar columns for lookups, the
//! full record as canonical JSON alongside. `$N` placeholders are valid on
//! both backends, so every query is written once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use eisv_dynamics::{EisvState, HistoryPoint};

use super::{IdentityFilter, SessionFilter, Store, encode_ts};
use crate::audit::AuditEvent;
use crate::dialectic::DialecticSession;
use crate::error::{ErrorCode, GovError, GovResult};
use crate::identity::{AgentIdentity, AgentStatus};
use crate::knowledge::{KnowledgeNote, NoteFilter, NoteStatus};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS identities (
        uuid TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        display_name TEXT,
        transport_fingerprint TEXT,
        status TEXT NOT NULL,
        record TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_update_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_identities_agent_id ON identities (agent_id)",
    "CREATE INDEX IF NOT EXISTS idx_identities_fingerprint ON identities (transport_fingerprint)",
    "CREATE TABLE IF NOT EXISTS agent_state (
        agent_uuid TEXT PRIMARY KEY,
        record TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agent_state_history (
        agent_uuid TEXT NOT NULL,
        seq BIGINT NOT NULL,
        point TEXT NOT NULL,
        at TEXT NOT NULL,
        PRIMARY KEY (agent_uuid, seq)
    )",
    "CREATE TABLE IF NOT EXISTS dialectic_sessions (
        session_id TEXT PRIMARY KEY,
        paused_agent_uuid TEXT NOT NULL,
        reviewer_agent_uuid TEXT NOT NULL,
        status TEXT NOT NULL,
        record TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_paused ON dialectic_sessions (paused_agent_uuid, status)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_reviewer ON dialectic_sessions (reviewer_agent_uuid)",
    "CREATE TABLE IF NOT EXISTS session_bindings (
        session_key TEXT PRIMARY KEY,
        agent_uuid TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS knowledge_notes (
        id TEXT PRIMARY KEY,
        author_uuid TEXT NOT NULL,
        status TEXT NOT NULL,
        tags_csv TEXT NOT NULL,
        record TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_notes_author ON knowledge_notes (author_uuid)",
    "CREATE TABLE IF NOT EXISTS audit_events (
        id TEXT PRIMARY KEY,
        ts TEXT NOT NULL,
        actor_uuid TEXT NOT NULL,
        record TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_events (ts)",
    "CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_events (actor_uuid, ts)",
];

/// Retained history rows per agent; matches the in-state ring.
const HISTORY_ROWS: i64 = 64;

pub struct SqlStore {
    pool: AnyPool,
}

impl SqlStore {
    /// Connect and apply the schema. `url` selects the backend
    /// (`postgres://` or `sqlite://`).
    pub async fn connect(url: &str, min_conn: u32, max_conn: u32) -> GovResult<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .min_connections(min_conn)
            .max_connections(max_conn)
            .connect(url)
            .await
            .map_err(|e| {
                GovError::new(
                    ErrorCode::Unavailable,
                    format!("durable store unreachable: {}", e),
                )
            })?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> GovResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn decode<T: serde::de::DeserializeOwned>(row: &AnyRow) -> GovResult<T> {
        let record: String = row.try_get("record").map_err(GovError::from)?;
        Ok(serde_json::from_str(&record)?)
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn insert_identity(&self, identity: &AgentIdentity) -> GovResult<()> {
        sqlx::query(
            "INSERT INTO identities
             (uuid, agent_id, display_name, transport_fingerprint, status, record, created_at, last_update_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(identity.uuid.to_string())
        .bind(&identity.agent_id)
        .bind(identity.display_name.as_deref())
        .bind(identity.transport_fingerprint.as_deref())
        .bind(identity.status.as_str())
        .bind(serde_json::to_string(identity)?)
        .bind(encode_ts(identity.created_at))
        .bind(encode_ts(identity.last_update_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_identity(&self, identity: &AgentIdentity) -> GovResult<()> {
        let result = sqlx::query(
            "UPDATE identities
             SET agent_id = $1, display_name = $2, transport_fingerprint = $3,
                 status = $4, record = $5, last_update_at = $6
             WHERE uuid = $7",
        )
        .bind(&identity.agent_id)
        .bind(identity.display_name.as_deref())
        .bind(identity.transport_fingerprint.as_deref())
        .bind(identity.status.as_str())
        .bind(serde_json::to_string(identity)?)
        .bind(encode_ts(identity.last_update_at))
        .bind(identity.uuid.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GovError::agent_not_found(identity.uuid));
        }
        Ok(())
    }

    async fn get_identity(&self, uuid: Uuid) -> GovResult<Option<AgentIdentity>> {
        let row = sqlx::query("SELECT record FROM identities WHERE uuid = $1")
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(&r)).transpose()
    }

    async fn get_identity_by_agent_id(&self, agent_id: &str) -> GovResult<Option<AgentIdentity>> {
        let row = sqlx::query("SELECT record FROM identities WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(&r)).transpose()
    }

    async fn find_identities_by_display_name(
        &self,
        name: &str,
    ) -> GovResult<Vec<AgentIdentity>> {
        let rows = sqlx::query("SELECT record FROM identities WHERE display_name = $1")
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn find_identity_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> GovResult<Option<AgentIdentity>> {
        let row = sqlx::query(
            "SELECT record FROM identities WHERE transport_fingerprint = $1
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::decode(&r)).transpose()
    }

    async fn list_identities(&self, filter: &IdentityFilter) -> GovResult<Vec<AgentIdentity>> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let offset = filter.offset.map(|o| o as i64).unwrap_or(0);
        let rows = match filter.status {
            Some(status) => {
                sqlx::query(
                    "SELECT record FROM identities WHERE status = $1
                     ORDER BY created_at LIMIT $2 OFFSET $3",
                )
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None if filter.include_deleted => {
                sqlx::query("SELECT record FROM identities ORDER BY created_at LIMIT $1 OFFSET $2")
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    "SELECT record FROM identities WHERE status <> $1
                     ORDER BY created_at LIMIT $2 OFFSET $3",
                )
                .bind(AgentStatus::Deleted.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::decode).collect()
    }

    async fn load_state(&self, uuid: Uuid) -> GovResult<Option<EisvState>> {
        let row = sqlx::query("SELECT record FROM agent_state WHERE agent_uuid = $1")
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(&r)).transpose()
    }

    async fn save_state(&self, uuid: Uuid, state: &EisvState) -> GovResult<()> {
        sqlx::query(
            "INSERT INTO agent_state (agent_uuid, record, updated_at) VALUES ($1, $2, $3)
             ON CONFLICT (agent_uuid) DO UPDATE SET record = $4, updated_at = $5",
        )
        .bind(uuid.to_string())
        .bind(serde_json::to_string(state)?)
        .bind(encode_ts(state.updated_at))
        .bind(serde_json::to_string(state)?)
        .bind(encode_ts(state.updated_at))
        .execute(&self.pool)
        .await?;

        if let Some(point) = state.history.latest() {
            let seq = state.total_updates as i64;
            sqlx::query(
                "INSERT INTO agent_state_history (agent_uuid, seq, point, at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (agent_uuid, seq) DO UPDATE SET point = $5",
            )
            .bind(uuid.to_string())
            .bind(seq)
            .bind(serde_json::to_string(point)?)
            .bind(encode_ts(point.at))
            .bind(serde_json::to_string(point)?)
            .execute(&self.pool)
            .await?;

            sqlx::query("DELETE FROM agent_state_history WHERE agent_uuid = $1 AND seq <= $2")
                .bind(uuid.to_string())
                .bind(seq - HISTORY_ROWS)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn load_state_history(
        &self,
        uuid: Uuid,
        limit: usize,
    ) -> GovResult<Vec<HistoryPoint>> {
        let rows = sqlx::query(
            "SELECT point FROM agent_state_history WHERE agent_uuid = $1
             ORDER BY seq DESC LIMIT $2",
        )
        .bind(uuid.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut points: Vec<HistoryPoint> = rows
            .iter()
            .map(|r| {
                let point: String = r.try_get("point").map_err(GovError::from)?;
                Ok(serde_json::from_str(&point)?)
            })
            .collect::<GovResult<_>>()?;
        points.reverse();
        Ok(points)
    }

    async fn insert_session(&self, session: &DialecticSession) -> GovResult<()> {
        sqlx::query(
            "INSERT INTO dialectic_sessions
             (session_id, paused_agent_uuid, reviewer_agent_uuid, status, record, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(session.session_id.to_string())
        .bind(session.paused_agent_uuid.to_string())
        .bind(session.reviewer_agent_uuid.to_string())
        .bind(status_str(session))
        .bind(serde_json::to_string(session)?)
        .bind(encode_ts(session.created_at))
        .bind(encode_ts(session.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_session(&self, session: &DialecticSession) -> GovResult<()> {
        let result = sqlx::query(
            "UPDATE dialectic_sessions SET status = $1, record = $2, updated_at = $3
             WHERE session_id = $4",
        )
        .bind(status_str(session))
        .bind(serde_json::to_string(session)?)
        .bind(encode_ts(session.updated_at))
        .bind(session.session_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GovError::session_not_found(session.session_id));
        }
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> GovResult<Option<DialecticSession>> {
        let row = sqlx::query("SELECT record FROM dialectic_sessions WHERE session_id = $1")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(&r)).transpose()
    }

    async fn open_session_for_agent(
        &self,
        uuid: Uuid,
    ) -> GovResult<Option<DialecticSession>> {
        let row = sqlx::query(
            "SELECT record FROM dialectic_sessions
             WHERE paused_agent_uuid = $1 AND status = 'active'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::decode(&r)).transpose()
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> GovResult<Vec<DialecticSession>> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = match (filter.participant, filter.reviewer) {
            (Some(p), _) if filter.active_only => {
                sqlx::query(
                    "SELECT record FROM dialectic_sessions
                     WHERE (paused_agent_uuid = $1 OR reviewer_agent_uuid = $2) AND status = 'active'
                     ORDER BY created_at DESC LIMIT $3",
                )
                .bind(p.to_string())
                .bind(p.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(p), _) => {
                sqlx::query(
                    "SELECT record FROM dialectic_sessions
                     WHERE paused_agent_uuid = $1 OR reviewer_agent_uuid = $2
                     ORDER BY created_at DESC LIMIT $3",
                )
                .bind(p.to_string())
                .bind(p.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(r)) => {
                sqlx::query(
                    "SELECT record FROM dialectic_sessions WHERE reviewer_agent_uuid = $1
                     ORDER BY created_at DESC LIMIT $2",
                )
                .bind(r.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) if filter.active_only => {
                sqlx::query(
                    "SELECT record FROM dialectic_sessions WHERE status = 'active'
                     ORDER BY created_at DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query(
                    "SELECT record FROM dialectic_sessions ORDER BY created_at DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::decode).collect()
    }

    async fn put_session_binding(
        &self,
        session_key: &str,
        uuid: Uuid,
        expires_at: DateTime<Utc>,
    ) -> GovResult<()> {
        sqlx::query(
            "INSERT INTO session_bindings (session_key, agent_uuid, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (session_key) DO UPDATE SET agent_uuid = $4, expires_at = $5",
        )
        .bind(session_key)
        .bind(uuid.to_string())
        .bind(encode_ts(expires_at))
        .bind(uuid.to_string())
        .bind(encode_ts(expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session_binding(&self, session_key: &str) -> GovResult<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT agent_uuid, expires_at FROM session_bindings WHERE session_key = $1",
        )
        .bind(session_key)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let expires_at: String = row.try_get("expires_at").map_err(GovError::from)?;
        if expires_at.as_str() <= encode_ts(Utc::now()).as_str() {
            sqlx::query("DELETE FROM session_bindings WHERE session_key = $1")
                .bind(session_key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }
        let agent_uuid: String = row.try_get("agent_uuid").map_err(GovError::from)?;
        let uuid = Uuid::parse_str(&agent_uuid)
            .map_err(|e| GovError::internal(format!("corrupt binding uuid: {}", e)))?;
        Ok(Some(uuid))
    }

    async fn insert_note(&self, note: &KnowledgeNote) -> GovResult<()> {
        sqlx::query(
            "INSERT INTO knowledge_notes (id, author_uuid, status, tags_csv, record, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(note.id.to_string())
        .bind(note.author_uuid.to_string())
        .bind(note_status_str(note.status))
        .bind(tags_csv(&note.tags))
        .bind(serde_json::to_string(note)?)
        .bind(encode_ts(note.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_note(&self, note: &KnowledgeNote) -> GovResult<()> {
        sqlx::query(
            "UPDATE knowledge_notes SET status = $1, tags_csv = $2, record = $3 WHERE id = $4",
        )
        .bind(note_status_str(note.status))
        .bind(tags_csv(&note.tags))
        .bind(serde_json::to_string(note)?)
        .bind(note.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_note(&self, id: Uuid) -> GovResult<Option<KnowledgeNote>> {
        let row = sqlx::query("SELECT record FROM knowledge_notes WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::decode(&r)).transpose()
    }

    async fn list_notes(&self, filter: &NoteFilter) -> GovResult<Vec<KnowledgeNote>> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        // Tag membership is matched against the delimited tags_csv column;
        // author/status narrowing happens in SQL, the rest in code.
        let rows = match (&filter.author_uuid, &filter.status) {
            (Some(author), _) => {
                sqlx::query(
                    "SELECT record FROM knowledge_notes WHERE author_uuid = $1
                     ORDER BY created_at DESC LIMIT $2",
                )
                .bind(author.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(status)) => {
                sqlx::query(
                    "SELECT record FROM knowledge_notes WHERE status = $1
                     ORDER BY created_at DESC LIMIT $2",
                )
                .bind(note_status_str(*status))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query("SELECT record FROM knowledge_notes ORDER BY created_at DESC LIMIT $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        let notes: Vec<KnowledgeNote> = rows
            .iter()
            .map(Self::decode)
            .collect::<GovResult<_>>()?;
        Ok(notes
            .into_iter()
            .filter(|n| {
                filter.status.map_or(true, |s| n.status == s)
                    && filter
                        .tag
                        .as_ref()
                        .map_or(true, |t| n.tags.iter().any(|tag| tag == t))
            })
            .collect())
    }

    async fn append_audit(&self, event: &AuditEvent) -> GovResult<()> {
        sqlx::query(
            "INSERT INTO audit_events (id, ts, actor_uuid, record) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(encode_ts(event.ts))
        .bind(event.actor_uuid.to_string())
        .bind(serde_json::to_string(event)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(
        &self,
        actor_uuid: Option<Uuid>,
        limit: usize,
    ) -> GovResult<Vec<AuditEvent>> {
        let rows = match actor_uuid {
            Some(actor) => {
                sqlx::query(
                    "SELECT record FROM audit_events WHERE actor_uuid = $1
                     ORDER BY ts DESC LIMIT $2",
                )
                .bind(actor.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT record FROM audit_events ORDER BY ts DESC LIMIT $1")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::decode).collect()
    }

    async fn ping(&self) -> GovResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn status_str(session: &DialecticSession) -> &'static str {
    match session.status {
        crate::dialectic::SessionStatus::Active => "active",
        crate::dialectic::SessionStatus::Resolved => "resolved",
        crate::dialectic::SessionStatus::Failed => "failed",
        crate::dialectic::SessionStatus::Cancelled => "cancelled",
    }
}

fn note_status_str(status: NoteStatus) -> &'static str {
    match status {
        NoteStatus::Open => "open",
        NoteStatus::Resolved => "resolved",
        NoteStatus::Archived => "archived",
    }
}

fn tags_csv(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!(",{},", tags.join(","))
    }
}

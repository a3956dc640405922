//! Append-only audit log
//!
//! Anything in the core may append; nothing may mutate or delete. Events
//! are mirrored to tracing so operators see them without a store query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::GovResult;
use crate::store::Store;

/// One appended event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub actor_uuid: Uuid,
    /// Free-form action identifier, e.g. `agent.paused`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_uuid: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub details: Value,
}

impl AuditEvent {
    pub fn new(actor_uuid: Uuid, action: &str) -> Self {
        Self {
            ts: Utc::now(),
            actor_uuid,
            action: action.to_string(),
            subject_uuid: None,
            tags: Vec::new(),
            details: Value::Null,
        }
    }

    pub fn subject(mut self, uuid: Uuid) -> Self {
        self.subject_uuid = Some(uuid);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Appender handle shared across subsystems.
pub struct AuditLog {
    store: Arc<dyn Store>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn append(&self, event: AuditEvent) -> GovResult<()> {
        tracing::info!(
            actor = %event.actor_uuid,
            action = %event.action,
            subject = ?event.subject_uuid,
            "audit"
        );
        self.store.append_audit(&event).await
    }

    pub async fn recent(
        &self,
        actor_uuid: Option<Uuid>,
        limit: usize,
    ) -> GovResult<Vec<AuditEvent>> {
        self.store.list_audit(actor_uuid, limit).await
    }
}

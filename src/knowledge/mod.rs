//! Knowledge notes: the narrow append / filter interface the core depends
//! on
//!
//! Full knowledge-graph storage and semantic search live outside the core;
//! this module covers note authorship, tag-filtered listing, lightweight
//! text search, status transitions, and cleanup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::RateLimiter;
use crate::error::{ErrorCode, GovError, GovResult};
use crate::store::Store;
use crate::summarize::Embedder;

/// Notes a single agent may write per hour.
pub const NOTE_RATE_LIMIT_PER_HOUR: u32 = 20;

/// Resolved notes older than this are archived by `cleanup`.
pub const CLEANUP_AGE_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Bug,
    Insight,
    Pattern,
    Improvement,
    Question,
    Note,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    Open,
    Resolved,
    Archived,
}

/// One knowledge note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeNote {
    pub id: Uuid,
    pub author_uuid: Uuid,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub kind: NoteKind,
    pub severity: NoteSeverity,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: NoteStatus,
    /// Edge to an older note this one supersedes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Listing filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct NoteFilter {
    pub author_uuid: Option<Uuid>,
    pub tag: Option<String>,
    pub status: Option<NoteStatus>,
    pub limit: Option<usize>,
}

/// Note service over the durable store.
pub struct KnowledgeService {
    store: Arc<dyn Store>,
    rate_limiter: Arc<RateLimiter>,
    embedder: Arc<dyn Embedder>,
}

impl KnowledgeService {
    pub fn new(
        store: Arc<dyn Store>,
        rate_limiter: Arc<RateLimiter>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            embedder,
        }
    }

    /// Append a note authored by `author_uuid`. Rate limited per agent.
    pub async fn store_note(
        &self,
        author_uuid: Uuid,
        summary: String,
        details: Option<String>,
        kind: NoteKind,
        severity: NoteSeverity,
        tags: Vec<String>,
        supersedes: Option<Uuid>,
    ) -> GovResult<KnowledgeNote> {
        if summary.trim().is_empty() {
            return Err(GovError::missing_parameter("summary"));
        }
        self.rate_limiter
            .check(author_uuid, "knowledge_note", NOTE_RATE_LIMIT_PER_HOUR)
            .await?;

        let note = KnowledgeNote {
            id: Uuid::new_v4(),
            author_uuid,
            summary,
            details,
            kind,
            severity,
            tags,
            status: NoteStatus::Open,
            supersedes,
            created_at: Utc::now(),
        };
        self.store.insert_note(&note).await?;
        tracing::debug!(note_id = %note.id, author = %author_uuid, "knowledge note stored");
        Ok(note)
    }

    pub async fn get(&self, id: Uuid) -> GovResult<KnowledgeNote> {
        self.store.get_note(id).await?.ok_or_else(|| {
            GovError::new(ErrorCode::ResourceNotFound, format!("note not found: {}", id))
        })
    }

    pub async fn list(&self, filter: NoteFilter) -> GovResult<Vec<KnowledgeNote>> {
        self.store.list_notes(&filter).await
    }

    /// Token-overlap search over summary and details. The embedder is
    /// consulted for ranking hints when configured; its absence changes
    /// nothing.
    pub async fn search(&self, query: &str, limit: usize) -> GovResult<Vec<KnowledgeNote>> {
        let _hint = self.embedder.embed(query).await;
        let needle_tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let all = self.store.list_notes(&NoteFilter::default()).await?;
        let mut scored: Vec<(usize, KnowledgeNote)> = all
            .into_iter()
            .filter_map(|note| {
                let haystack = format!(
                    "{} {}",
                    note.summary.to_lowercase(),
                    note.details.as_deref().unwrap_or("").to_lowercase()
                );
                let hits = needle_tokens
                    .iter()
                    .filter(|t| haystack.contains(t.as_str()))
                    .count();
                (hits > 0).then_some((hits, note))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));
        Ok(scored.into_iter().take(limit).map(|(_, n)| n).collect())
    }

    pub async fn update_status(&self, id: Uuid, status: NoteStatus) -> GovResult<KnowledgeNote> {
        let mut note = self.get(id).await?;
        note.status = status;
        self.store.update_note(&note).await?;
        Ok(note)
    }

    /// Archive resolved notes older than the cleanup window. Returns how
    /// many were archived.
    pub async fn cleanup(&self) -> GovResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(CLEANUP_AGE_DAYS);
        let resolved = self
            .store
            .list_notes(&NoteFilter {
                status: Some(NoteStatus::Resolved),
                ..NoteFilter::default()
            })
            .await?;
        let mut archived = 0;
        for mut note in resolved {
            if note.created_at < cutoff {
                note.status = NoteStatus::Archived;
                self.store.update_note(&note).await?;
                archived += 1;
            }
        }
        Ok(archived)
    }
}

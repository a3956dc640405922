//! Reviewer selection by authority scoring

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ErrorCode, GovError, GovResult};
use crate::identity::{AgentIdentity, AgentStatus};
use crate::store::{IdentityFilter, SessionFilter, Store};

/// Candidates scoring at or below this cannot review.
pub const MIN_AUTHORITY_SCORE: f64 = 0.1;

/// Track record assumed for candidates with no review history.
const DEFAULT_TRACK_RECORD: f64 = 0.5;

/// Penalty applied to a candidate that reviewed for the same agent within
/// the last 24 hours.
const ANTI_COLLUSION_FACTOR: f64 = 0.5;

/// One scored reviewer candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerCandidate {
    pub uuid: Uuid,
    pub agent_id: String,
    pub score: f64,
    pub health: f64,
    pub track_record: f64,
    pub expertise_overlap: f64,
    pub recency: f64,
    pub recently_reviewed_same_agent: bool,
}

fn tag_jaccard(a: &[String], b: &[String]) -> f64 {
    let set_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = b.iter().map(String::as_str).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Score every eligible candidate and pick the winner.
///
/// `score = 0.4 health + 0.3 track_record + 0.2 expertise_overlap +
/// 0.1 recency`, halved for candidates that reviewed this agent in the
/// last 24 hours. Ties break by uuid lexicographic order.
pub async fn select_reviewer(
    store: &Arc<dyn Store>,
    paused: &AgentIdentity,
) -> GovResult<ReviewerCandidate> {
    let now = Utc::now();
    let candidates = store
        .list_identities(&IdentityFilter {
            status: Some(AgentStatus::Active),
            ..IdentityFilter::default()
        })
        .await?;

    let mut scored = Vec::new();
    for candidate in candidates {
        if candidate.uuid == paused.uuid || candidate.is_autonomous() {
            continue;
        }

        let health = match store.load_state(candidate.uuid).await? {
            Some(state) => 1.0 - state.risk_score,
            None => 0.5,
        };

        let reviewed = store
            .list_sessions(&SessionFilter {
                reviewer: Some(candidate.uuid),
                ..SessionFilter::default()
            })
            .await?;
        let terminal: Vec<_> = reviewed
            .iter()
            .filter(|s| !s.is_open())
            .collect();
        let track_record = if terminal.is_empty() {
            DEFAULT_TRACK_RECORD
        } else {
            let resolved = terminal
                .iter()
                .filter(|s| s.phase == crate::dialectic::DialecticPhase::Resolved)
                .count();
            resolved as f64 / terminal.len() as f64
        };

        let expertise_overlap = tag_jaccard(&paused.tags, &candidate.tags);

        let hours_idle = (now - candidate.last_update_at).num_seconds() as f64 / 3600.0;
        let recency = (-hours_idle.max(0.0) / 24.0).exp();

        let recently_reviewed_same_agent = reviewed.iter().any(|s| {
            s.paused_agent_uuid == paused.uuid && now - s.created_at < Duration::hours(24)
        });

        let mut score = 0.4 * health
            + 0.3 * track_record
            + 0.2 * expertise_overlap
            + 0.1 * recency;
        if recently_reviewed_same_agent {
            score *= ANTI_COLLUSION_FACTOR;
        }

        scored.push(ReviewerCandidate {
            uuid: candidate.uuid,
            agent_id: candidate.agent_id,
            score,
            health,
            track_record,
            expertise_overlap,
            recency,
            recently_reviewed_same_agent,
        });
    }

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.uuid.cmp(&b.uuid))
    });

    match scored.into_iter().next() {
        Some(best) if best.score > MIN_AUTHORITY_SCORE => Ok(best),
        _ => Err(GovError::new(
            ErrorCode::NoReviewer,
            "no eligible reviewer scored above the authority floor",
        )
        .with_recovery(["operator_resume"])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_jaccard() {
        let a = vec!["search".to_string(), "planning".to_string()];
        let b = vec!["planning".to_string(), "coding".to_string()];
        assert!((tag_jaccard(&a, &b) - (1.0 / 3.0)).abs() < 1e-12);
        assert_eq!(tag_jaccard(&[], &[]), 0.0);
        assert!((tag_jaccard(&a, &a) - 1.0).abs() < 1e-12);
    }
}

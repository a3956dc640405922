//! Convergence evaluation for a submitted synthesis

use std::collections::HashSet;

use super::{DialecticMessage, ProposedCondition};

/// Minimum structural overlap between thesis and antithesis conditions.
pub const MIN_CONDITION_OVERLAP: f64 = 0.5;

/// Minimum token-set similarity between root causes.
pub const MIN_ROOT_CAUSE_SIMILARITY: f64 = 0.3;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of",
    "on", "or", "the", "to", "was", "were", "with",
];

/// Outcome of one convergence evaluation.
#[derive(Debug, Clone)]
pub struct ConvergenceVerdict {
    pub accepted: bool,
    pub condition_overlap: f64,
    pub root_cause_similarity: f64,
    pub reasons: Vec<String>,
}

/// Structural overlap: exactly-equal condition records over the distinct
/// `(kind, key)` pairs both sides touch. Conflicting directions on the same
/// key invalidate the synthesis entirely.
fn condition_overlap(
    thesis: &[ProposedCondition],
    antithesis: &[ProposedCondition],
) -> Result<f64, String> {
    for a in thesis {
        for b in antithesis {
            if a.kind == b.kind && a.key == b.key {
                if let (Some(da), Some(db)) = (a.direction, b.direction) {
                    if da != db {
                        return Err(format!(
                            "conflicting directions on '{}': {:?} vs {:?}",
                            a.key, da, db
                        ));
                    }
                }
            }
        }
    }

    let union: HashSet<(&str, &str)> = thesis
        .iter()
        .chain(antithesis.iter())
        .map(|c| (c.kind.as_str(), c.key.as_str()))
        .collect();
    if union.is_empty() {
        return Ok(1.0);
    }
    let matches = thesis.iter().filter(|a| antithesis.contains(a)).count();
    Ok(matches as f64 / union.len() as f64)
}

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Token-set Jaccard similarity after lowercasing and stop-word removal.
pub fn root_cause_similarity(a: &str, b: &str) -> f64 {
    let set_a = tokens(a);
    let set_b = tokens(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Evaluate a synthesis against the thesis and antithesis on record.
pub fn evaluate_convergence(
    thesis: &DialecticMessage,
    antithesis: &DialecticMessage,
    synthesis: &DialecticMessage,
) -> ConvergenceVerdict {
    let mut reasons = Vec::new();

    let both_agree = thesis.agrees == Some(true) && antithesis.agrees == Some(true);
    let has_conditions = !synthesis.proposed_conditions.is_empty();
    if !both_agree && !has_conditions {
        reasons.push(
            "parties do not both agree and the synthesis proposes no conditions".to_string(),
        );
    }

    let overlap = match condition_overlap(
        &thesis.proposed_conditions,
        &antithesis.proposed_conditions,
    ) {
        Ok(overlap) => {
            if overlap < MIN_CONDITION_OVERLAP {
                reasons.push(format!(
                    "condition overlap {:.2} below the {:.2} threshold",
                    overlap, MIN_CONDITION_OVERLAP
                ));
            }
            overlap
        }
        Err(conflict) => {
            reasons.push(conflict);
            0.0
        }
    };

    let similarity = root_cause_similarity(&thesis.root_cause, &antithesis.root_cause);
    if similarity < MIN_ROOT_CAUSE_SIMILARITY {
        reasons.push(format!(
            "root-cause similarity {:.2} below the {:.2} threshold",
            similarity, MIN_ROOT_CAUSE_SIMILARITY
        ));
    }

    ConvergenceVerdict {
        accepted: reasons.is_empty(),
        condition_overlap: overlap,
        root_cause_similarity: similarity,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialectic::{Direction, MessageKind};
    use chrono::Utc;
    use uuid::Uuid;

    fn message(
        kind: MessageKind,
        root_cause: &str,
        conditions: Vec<ProposedCondition>,
        agrees: Option<bool>,
    ) -> DialecticMessage {
        DialecticMessage {
            seq: 1,
            author_uuid: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            reasoning: String::new(),
            root_cause: root_cause.to_string(),
            proposed_conditions: conditions,
            observed_metrics: serde_json::Value::Null,
            concerns: vec![],
            agrees,
            signature: String::new(),
        }
    }

    #[test]
    fn test_matching_negotiation_converges() {
        let thesis = message(
            MessageKind::Thesis,
            "overload from concurrent tool churn",
            vec![
                ProposedCondition::limit("concurrent_tasks", 5),
                ProposedCondition::limit("max_tokens", 256),
            ],
            Some(true),
        );
        let antithesis = message(
            MessageKind::Antithesis,
            "overload from concurrent tool churn",
            vec![
                ProposedCondition::limit("concurrent_tasks", 8),
                ProposedCondition::limit("max_tokens", 256),
            ],
            Some(true),
        );
        let synthesis = message(
            MessageKind::Synthesis,
            "overload from concurrent tool churn",
            vec![
                ProposedCondition::limit("concurrent_tasks", 8),
                ProposedCondition::limit("max_tokens", 256),
            ],
            None,
        );

        let verdict = evaluate_convergence(&thesis, &antithesis, &synthesis);
        // One exact match over two distinct keys.
        assert!((verdict.condition_overlap - 0.5).abs() < 1e-12);
        assert!(verdict.root_cause_similarity > 0.99);
        assert!(verdict.accepted, "reasons: {:?}", verdict.reasons);
    }

    #[test]
    fn test_unrelated_root_causes_fail() {
        let thesis = message(
            MessageKind::Thesis,
            "overload from concurrent tool churn",
            vec![ProposedCondition::limit("max_tokens", 256)],
            Some(true),
        );
        let antithesis = message(
            MessageKind::Antithesis,
            "memory corruption under load spikes entirely elsewhere",
            vec![ProposedCondition::limit("max_tokens", 256)],
            Some(true),
        );
        let synthesis = message(MessageKind::Synthesis, "", vec![], None);

        let verdict = evaluate_convergence(&thesis, &antithesis, &synthesis);
        assert!(!verdict.accepted);
        assert!(verdict.root_cause_similarity < MIN_ROOT_CAUSE_SIMILARITY);
    }

    #[test]
    fn test_conflicting_directions_invalidate() {
        let up = ProposedCondition {
            kind: "threshold".to_string(),
            key: "risk_threshold".to_string(),
            value: serde_json::json!(0.7),
            direction: Some(Direction::Increase),
        };
        let down = ProposedCondition {
            kind: "threshold".to_string(),
            key: "risk_threshold".to_string(),
            value: serde_json::json!(0.5),
            direction: Some(Direction::Decrease),
        };
        let thesis = message(MessageKind::Thesis, "threshold tuning disagreement persists", vec![up], Some(true));
        let antithesis = message(MessageKind::Antithesis, "threshold tuning disagreement persists", vec![down], Some(true));
        let synthesis = message(MessageKind::Synthesis, "", vec![], None);

        let verdict = evaluate_convergence(&thesis, &antithesis, &synthesis);
        assert!(!verdict.accepted);
        assert_eq!(verdict.condition_overlap, 0.0);
    }

    #[test]
    fn test_disagreement_without_conditions_fails() {
        let thesis = message(
            MessageKind::Thesis,
            "overload from concurrent tool churn",
            vec![ProposedCondition::limit("max_tokens", 256)],
            Some(true),
        );
        let antithesis = message(
            MessageKind::Antithesis,
            "overload from concurrent tool churn",
            vec![ProposedCondition::limit("max_tokens", 256)],
            Some(false),
        );
        let bare_synthesis = message(MessageKind::Synthesis, "", vec![], None);
        let verdict = evaluate_convergence(&thesis, &antithesis, &bare_synthesis);
        assert!(!verdict.accepted);

        // A synthesis that itself proposes conditions satisfies rule one.
        let with_conditions = message(
            MessageKind::Synthesis,
            "",
            vec![ProposedCondition::limit("max_tokens", 256)],
            None,
        );
        let verdict = evaluate_convergence(&thesis, &antithesis, &with_conditions);
        assert!(verdict.accepted);
    }

    #[test]
    fn test_root_cause_similarity_ignores_stop_words() {
        let a = "the agent is stuck in a loop";
        let b = "agent stuck loop";
        assert!((root_cause_similarity(a, b) - 1.0).abs() < 1e-12);
    }
}

//! Safety Gate: hard limits on proposed resume conditions
//!
//! Deterministic filtering only. Anything matching a forbidden pattern,
//! pushing a threshold past its hard bound, or too vague to act on is
//! rejected outright, both at convergence and again at resolution.

use regex::RegexSet;

use super::ProposedCondition;

/// Reviewer conditions may never raise the risk threshold past this.
pub const MAX_RISK_THRESHOLD: f64 = 0.90;
/// Reviewer conditions may never lower the coherence threshold below this.
pub const MIN_COHERENCE_THRESHOLD: f64 = 0.10;

/// Minimum non-whitespace length of an actionable root cause.
pub const MIN_ROOT_CAUSE_LEN: usize = 16;

const FORBIDDEN_PATTERNS: &[&str] = &[
    r"(?i)disable.*governance",
    r"(?i)bypass.*safety",
    r"(?i)remove.*monitor",
    r"(?i)unlimited.*risk",
];

const VAGUE_MARKERS: &[&str] = &["maybe", "try", "later"];

/// Gate outcome. Forbidden-pattern hits terminate the session outright;
/// bound and vagueness violations only fail the current synthesis attempt.
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub forbidden: Vec<String>,
    pub violations: Vec<String>,
}

impl GateReport {
    pub fn is_clean(&self) -> bool {
        self.forbidden.is_empty() && self.violations.is_empty()
    }

    pub fn all(&self) -> Vec<String> {
        self.forbidden
            .iter()
            .chain(self.violations.iter())
            .cloned()
            .collect()
    }
}

pub struct SafetyGate {
    forbidden: RegexSet,
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyGate {
    pub fn new() -> Self {
        Self {
            forbidden: RegexSet::new(FORBIDDEN_PATTERNS).expect("forbidden patterns compile"),
        }
    }

    /// Check a condition set against every hard limit.
    pub fn check_conditions(&self, conditions: &[ProposedCondition]) -> GateReport {
        let mut report = GateReport::default();
        for condition in conditions {
            let serialized =
                serde_json::to_string(condition).unwrap_or_else(|_| condition.key.clone());

            if self.forbidden.is_match(&serialized) {
                report.forbidden.push(format!(
                    "condition '{}' matches a forbidden pattern",
                    condition.key
                ));
                continue;
            }

            if condition.kind == "threshold" {
                match (condition.key.as_str(), condition.numeric_value()) {
                    ("risk_threshold", Some(value)) if value > MAX_RISK_THRESHOLD => {
                        report.violations.push(format!(
                            "risk_threshold {:.2} exceeds the hard bound {:.2}",
                            value, MAX_RISK_THRESHOLD
                        ));
                    }
                    ("coherence_threshold", Some(value)) if value < MIN_COHERENCE_THRESHOLD => {
                        report.violations.push(format!(
                            "coherence_threshold {:.2} is below the hard bound {:.2}",
                            value, MIN_COHERENCE_THRESHOLD
                        ));
                    }
                    _ => {}
                }
            }

            if let Some(text) = condition.value.as_str() {
                let lowered = text.to_lowercase();
                let vague = VAGUE_MARKERS.iter().any(|m| lowered.contains(m));
                if vague && condition.numeric_value().is_none() {
                    report.violations.push(format!(
                        "condition '{}' is vague: '{}' carries no numeric payload",
                        condition.key, text
                    ));
                }
            }
        }
        report
    }

    /// Root causes shorter than the minimum are not actionable.
    pub fn check_root_cause(&self, root_cause: &str) -> Option<String> {
        let meaningful: usize = root_cause.chars().filter(|c| !c.is_whitespace()).count();
        (meaningful < MIN_ROOT_CAUSE_LEN).then(|| {
            format!(
                "root cause has {} non-whitespace characters, {} required",
                meaningful, MIN_ROOT_CAUSE_LEN
            )
        })
    }
}

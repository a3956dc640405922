//! Governance verdict derivation

use serde::{Deserialize, Serialize};

use crate::regime::Regime;
use crate::risk::COHERENCE_FLOOR;

/// Risk above which an otherwise-clean update still needs revision.
pub const RISK_REVISE: f64 = 0.30;
/// Risk above which the update is rejected outright.
pub const RISK_REJECT: f64 = 0.70;

/// Governance decision for one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Revise,
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Revise => "revise",
            Verdict::Reject => "reject",
        }
    }
}

/// Verdict plus the attestation gate result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictOutcome {
    pub verdict: Verdict,
    pub auto_attest: bool,
    pub require_human: bool,
    pub guidance: Option<String>,
}

/// Derive the verdict and attestation gate from the new state.
///
/// An approve without `ci_passed` and confidence at or above the gate is
/// coerced to revise with `require_human` set; auto-attestation is never
/// granted to an unverified update.
pub fn derive(
    coherence: f64,
    risk: f64,
    regime: Regime,
    external_validation: bool,
    ci_passed: bool,
    confidence: f64,
    confidence_gate: f64,
) -> VerdictOutcome {
    if coherence < COHERENCE_FLOOR || risk > RISK_REJECT {
        return VerdictOutcome {
            verdict: Verdict::Reject,
            auto_attest: false,
            require_human: true,
            guidance: Some(format!(
                "update rejected: coherence {:.3}, risk {:.3}; agent paused, request recovery review",
                coherence, risk
            )),
        };
    }

    if risk > RISK_REVISE {
        return VerdictOutcome {
            verdict: Verdict::Revise,
            auto_attest: false,
            require_human: false,
            guidance: Some(format!(
                "risk {:.3} in the revision band; reduce entropy before proceeding",
                risk
            )),
        };
    }

    if regime == Regime::Locked && !external_validation {
        return VerdictOutcome {
            verdict: Verdict::Revise,
            auto_attest: false,
            require_human: false,
            guidance: Some(
                "locked regime: external validation required before further convergence".to_string(),
            ),
        };
    }

    if ci_passed && confidence >= confidence_gate {
        VerdictOutcome {
            verdict: Verdict::Approve,
            auto_attest: true,
            require_human: false,
            guidance: None,
        }
    } else {
        VerdictOutcome {
            verdict: Verdict::Revise,
            auto_attest: false,
            require_human: true,
            guidance: Some(
                "approve withheld: attestation gate needs ci_passed and confidence >= 0.8"
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_coherence_rejects() {
        let out = derive(0.2, 0.1, Regime::Exploration, false, true, 1.0, 0.8);
        assert_eq!(out.verdict, Verdict::Reject);
        assert!(!out.auto_attest);
    }

    #[test]
    fn test_high_risk_rejects() {
        let out = derive(0.9, 0.75, Regime::Exploration, false, true, 1.0, 0.8);
        assert_eq!(out.verdict, Verdict::Reject);
    }

    #[test]
    fn test_intermediate_risk_revises() {
        let out = derive(0.9, 0.4, Regime::Exploration, false, true, 1.0, 0.8);
        assert_eq!(out.verdict, Verdict::Revise);
        assert!(!out.require_human);
    }

    #[test]
    fn test_locked_without_validation_revises() {
        let out = derive(0.9, 0.1, Regime::Locked, false, true, 1.0, 0.8);
        assert_eq!(out.verdict, Verdict::Revise);
    }

    #[test]
    fn test_locked_with_validation_can_approve() {
        let out = derive(0.9, 0.1, Regime::Locked, true, true, 1.0, 0.8);
        assert_eq!(out.verdict, Verdict::Approve);
        assert!(out.auto_attest);
    }

    #[test]
    fn test_attest_gate_coerces_to_revise() {
        let out = derive(0.9, 0.1, Regime::Exploration, false, true, 0.6, 0.8);
        assert_eq!(out.verdict, Verdict::Revise);
        assert!(out.require_human);
        assert!(!out.auto_attest);

        let out = derive(0.9, 0.1, Regime::Exploration, false, false, 1.0, 0.8);
        assert_eq!(out.verdict, Verdict::Revise);
        assert!(out.require_human);
    }

    #[test]
    fn test_clean_update_auto_attests() {
        let out = derive(0.9, 0.1, Regime::Convergence, false, true, 0.9, 0.8);
        assert_eq!(out.verdict, Verdict::Approve);
        assert!(out.auto_attest);
        assert!(!out.require_human);
    }
}

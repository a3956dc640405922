//! One forward-Euler step of the EISV equations

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::params::{DynamicsParams, IDynamicsMode};
use crate::regime::{self, Regime};
use crate::risk::{self, Margin};
use crate::sampling::SamplingParams;
use crate::state::EisvState;
use crate::verdict::{self, VerdictOutcome};

/// Integration failure. The caller must not persist state after one of
/// these; `advance` leaves the state untouched.
#[derive(Debug, Error)]
pub enum DynamicsError {
    #[error("non-finite value for {field} during integration")]
    NonFinite { field: &'static str },

    #[error("input {field} out of range: {value}")]
    InputOutOfRange { field: &'static str, value: f64 },
}

/// External inputs for one update step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateInputs {
    /// Normalized drift magnitude `‖Δη‖² / dim(Δη)`.
    pub drift_squared: f64,
    pub complexity: f64,
    pub confidence: f64,
    pub ci_passed: bool,
    pub external_validation: bool,
    pub task_type: Option<String>,
}

impl Default for StateInputs {
    fn default() -> Self {
        Self {
            drift_squared: 0.0,
            complexity: 0.0,
            confidence: 1.0,
            ci_passed: false,
            external_validation: false,
            task_type: None,
        }
    }
}

impl StateInputs {
    /// Range-check scalar inputs before integration.
    pub fn validate(&self) -> Result<(), DynamicsError> {
        if !self.drift_squared.is_finite() || self.drift_squared < 0.0 {
            return Err(DynamicsError::InputOutOfRange {
                field: "drift_squared",
                value: self.drift_squared,
            });
        }
        if !(0.0..=1.0).contains(&self.complexity) {
            return Err(DynamicsError::InputOutOfRange {
                field: "complexity",
                value: self.complexity,
            });
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(DynamicsError::InputOutOfRange {
                field: "confidence",
                value: self.confidence,
            });
        }
        Ok(())
    }
}

/// Everything derived from one accepted step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub e: f64,
    pub i: f64,
    pub s: f64,
    pub v: f64,
    pub coherence: f64,
    pub risk_score: f64,
    pub margin: Margin,
    pub regime: Regime,
    pub outcome: VerdictOutcome,
    pub sampling: SamplingParams,
    pub lambda1: f64,
    pub lambda1_skipped: bool,
}

/// Advance the state by exactly one Euler step and derive the verdict.
///
/// On error the state is left exactly as it was; nothing may be persisted.
pub fn advance(
    state: &mut EisvState,
    inputs: &StateInputs,
    params: &DynamicsParams,
) -> Result<StepReport, DynamicsError> {
    inputs.validate()?;

    let prev_s = state.s;
    let prev_i = state.i;
    let c_prev = state.coherence;
    let d2 = inputs.drift_squared;

    // Lambda1 gating: low-confidence updates reuse the prior value but the
    // skip is counted. The gated value still drives this step's equations.
    let mut lambda1 = state.lambda1;
    let lambda1_skipped = inputs.confidence < params.lambda1_gate_confidence;
    if !lambda1_skipped {
        let target = (params.lambda1_base
            * (1.0 + state.risk_ema - state.coherence_ema)
            * (0.5 + inputs.complexity))
            .clamp(0.0, 1.0);
        lambda1 += params.ema_rate * (target - lambda1);
    }

    let de = params.alpha * (state.i - state.e) - params.beta_e * state.e * state.s
        + lambda1 * state.e * d2;
    let saturating = match params.i_mode {
        IDynamicsMode::Nonlinear => params.gamma_i * state.i * (1.0 - state.i),
        IDynamicsMode::Linear => 0.0,
    };
    let di = -params.k * state.s + params.beta_i * state.i * c_prev - saturating;
    let ds = -params.mu * state.s + lambda1 * d2 - params.lambda2 * c_prev;
    let dv = params.kappa * (state.e - state.i) - params.delta * state.v;

    let mut e = state.e + params.dt * de;
    let mut i = state.i + params.dt * di;
    let mut s = state.s + params.dt * ds;
    let mut v = state.v + params.dt * dv;

    for (value, field) in [(e, "E"), (i, "I"), (s, "S"), (v, "V")] {
        if !value.is_finite() {
            return Err(DynamicsError::NonFinite { field });
        }
    }

    e = e.clamp(0.0, 1.0);
    i = i.clamp(0.0, 1.0);
    s = s.clamp(0.0, 2.0);
    v = v.clamp(-2.0, 2.0);

    // Entropy floor: certainty must be earned through external validation.
    if !inputs.external_validation && s < params.s_min {
        s = params.s_min;
    }

    let coherence = risk::coherence(v, params);
    let calibration_deviation = state.calibration.deviation(inputs.confidence);
    let risk_score = risk::risk_score(s, v, coherence, calibration_deviation, d2);
    if !coherence.is_finite() || !risk_score.is_finite() {
        return Err(DynamicsError::NonFinite { field: "derived" });
    }

    let (new_regime, locked_persistence) =
        regime::detect(prev_s, prev_i, s, i, state.locked_persistence_count);
    if new_regime != state.regime {
        tracing::debug!(
            from = state.regime.as_str(),
            to = new_regime.as_str(),
            "regime transition"
        );
    }
    let margin = risk::margin_of(coherence, risk_score, v);
    let outcome = verdict::derive(
        coherence,
        risk_score,
        new_regime,
        inputs.external_validation,
        inputs.ci_passed,
        inputs.confidence,
        params.lambda1_gate_confidence,
    );

    // Commit. Nothing above mutated the state, so an early return leaves it
    // exactly as loaded.
    state.e = e;
    state.i = i;
    state.s = s;
    state.v = v;
    state.coherence = coherence;
    state.risk_score = risk_score;
    state.lambda1 = lambda1;
    state.regime = new_regime;
    state.margin = margin;
    state.locked_persistence_count = locked_persistence;
    if lambda1_skipped {
        state.lambda1_skip_count += 1;
    }
    if state.total_updates == 0 {
        state.risk_ema = risk_score;
        state.coherence_ema = coherence;
    } else {
        state.risk_ema += params.ema_rate * (risk_score - state.risk_ema);
        state.coherence_ema += params.ema_rate * (coherence - state.coherence_ema);
    }
    state.calibration.record(inputs.confidence, inputs.ci_passed);
    state.total_updates += 1;
    state.updated_at = chrono::Utc::now();
    state.push_history();

    Ok(StepReport {
        e,
        i,
        s,
        v,
        coherence,
        risk_score,
        margin,
        regime: new_regime,
        outcome,
        sampling: SamplingParams::from_lambda1(lambda1),
        lambda1,
        lambda1_skipped,
    })
}

/// Estimate response complexity from the opaque response text, used when
/// the caller does not supply a complexity value.
pub fn estimate_complexity(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let length_term = (text.len() as f64 / 4000.0).min(1.0);
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return length_term;
    }
    let unique: HashSet<&str> = words.iter().copied().collect();
    let diversity = unique.len() as f64 / words.len() as f64;
    (0.7 * length_term + 0.3 * diversity).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::Verdict;
    use proptest::prelude::*;

    fn baseline_inputs() -> StateInputs {
        StateInputs {
            drift_squared: 0.01,
            complexity: 0.3,
            confidence: 0.9,
            ci_passed: true,
            external_validation: false,
            task_type: None,
        }
    }

    #[test]
    fn test_first_update_from_genesis() {
        let params = DynamicsParams::default();
        let mut state = EisvState::genesis(&params);
        let report = advance(&mut state, &baseline_inputs(), &params).unwrap();

        // One Euler step from (0.5, 0.8, 0.2, 0.0) with d^2 = 0.01 and the
        // lambda1 blend applied (0.3 -> 0.2868).
        assert!((report.e - 0.5191434).abs() < 1e-6);
        assert!((report.i - 0.8024).abs() < 1e-6);
        assert!((report.s - 0.1842868).abs() < 1e-6);
        assert!((report.v + 0.015).abs() < 1e-9);
        assert!((report.coherence - 0.477515).abs() < 1e-5);
        assert!((report.risk_score - 0.210817).abs() < 1e-4);

        assert_eq!(report.outcome.verdict, Verdict::Approve);
        assert!(report.outcome.auto_attest);
        assert!(!report.lambda1_skipped);
        assert_eq!(state.total_updates, 1);
        assert_eq!(state.lambda1_skip_count, 0);
        assert_eq!(state.history.len(), 1);
    }

    #[test]
    fn test_confidence_gate_skips_lambda1() {
        let params = DynamicsParams::default();
        let mut state = EisvState::genesis(&params);
        let mut inputs = baseline_inputs();
        inputs.confidence = 0.6;

        let report = advance(&mut state, &inputs, &params).unwrap();

        // Prior lambda1 reused, skip counted, and the gated value still
        // drives the equations.
        assert!(report.lambda1_skipped);
        assert_eq!(state.lambda1_skip_count, 1);
        assert!((state.lambda1 - params.lambda1_base).abs() < 1e-12);
        assert!((report.e - 0.51915).abs() < 1e-6);
        assert!((report.s - 0.1843).abs() < 1e-6);

        // Clean state but the attestation gate fails: coerced to revise.
        assert_eq!(report.outcome.verdict, Verdict::Revise);
        assert!(report.outcome.require_human);
        assert!(!report.outcome.auto_attest);
    }

    #[test]
    fn test_degraded_state_does_not_approve() {
        let params = DynamicsParams::default();
        let mut state = EisvState::genesis(&params);
        state.e = 0.3;
        state.i = 0.2;
        state.s = 1.2;
        state.v = 0.1;
        state.coherence = crate::risk::coherence(state.v, &params);

        let mut inputs = baseline_inputs();
        inputs.drift_squared = 0.5;
        inputs.complexity = 0.9;
        inputs.confidence = 1.0;

        let report = advance(&mut state, &inputs, &params).unwrap();
        assert_ne!(report.outcome.verdict, Verdict::Approve);
        assert!(report.risk_score > crate::verdict::RISK_REVISE);
        assert_ne!(report.margin, Margin::Comfortable);
    }

    #[test]
    fn test_deep_negative_void_rejects() {
        let params = DynamicsParams::default();
        let mut state = EisvState::genesis(&params);
        state.v = -0.5;
        state.coherence = crate::risk::coherence(state.v, &params);

        let report = advance(&mut state, &baseline_inputs(), &params).unwrap();
        assert!(report.coherence < crate::risk::COHERENCE_FLOOR);
        assert_eq!(report.outcome.verdict, Verdict::Reject);
        assert_eq!(report.margin, Margin::Critical);
    }

    #[test]
    fn test_entropy_floor_enforced() {
        let params = DynamicsParams::default();
        let mut state = EisvState::genesis(&params);
        state.s = 0.0005;

        let report = advance(&mut state, &baseline_inputs(), &params).unwrap();
        assert!(report.s >= params.s_min);
    }

    #[test]
    fn test_external_validation_allows_zero_entropy() {
        let params = DynamicsParams::default();
        let mut state = EisvState::genesis(&params);
        state.s = 0.0;
        state.v = 1.0;
        state.coherence = crate::risk::coherence(state.v, &params);

        let mut inputs = baseline_inputs();
        inputs.drift_squared = 0.0;
        inputs.external_validation = true;

        let report = advance(&mut state, &inputs, &params).unwrap();
        assert!(report.s < params.s_min);
        assert!(report.s >= 0.0);
    }

    #[test]
    fn test_non_finite_input_leaves_state_untouched() {
        let params = DynamicsParams::default();
        let mut state = EisvState::genesis(&params);
        let before = state.clone();

        let mut inputs = baseline_inputs();
        inputs.drift_squared = f64::INFINITY;

        let err = advance(&mut state, &inputs, &params).unwrap_err();
        assert!(matches!(err, DynamicsError::InputOutOfRange { .. }));
        assert_eq!(state.total_updates, before.total_updates);
        assert_eq!(state.e, before.e);
        assert_eq!(state.history.len(), before.history.len());
    }

    #[test]
    fn test_linear_mode_drops_saturating_term() {
        let nonlinear = DynamicsParams::default();
        let linear = DynamicsParams::linear();

        let mut a = EisvState::genesis(&nonlinear);
        let mut b = EisvState::genesis(&linear);
        let inputs = baseline_inputs();

        let ra = advance(&mut a, &inputs, &nonlinear).unwrap();
        let rb = advance(&mut b, &inputs, &linear).unwrap();

        // gamma_i * I * (1 - I) * dt = 0.1 * 0.8 * 0.2 * 0.1
        assert!((rb.i - ra.i - 0.0016).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_complexity_monotone_in_length() {
        let short = estimate_complexity("fix the bug");
        let long = estimate_complexity(&"word ".repeat(2000));
        assert!(short < long);
        assert_eq!(estimate_complexity(""), 0.0);
    }

    proptest! {
        #[test]
        fn prop_bounds_hold_after_any_step(
            e in 0.0f64..=1.0,
            i in 0.0f64..=1.0,
            s in 0.0f64..=2.0,
            v in -2.0f64..=2.0,
            d2 in 0.0f64..=4.0,
            complexity in 0.0f64..=1.0,
            confidence in 0.0f64..=1.0,
            ci_passed in proptest::bool::ANY,
            external in proptest::bool::ANY,
        ) {
            let params = DynamicsParams::default();
            let mut state = EisvState::genesis(&params);
            state.e = e;
            state.i = i;
            state.s = s;
            state.v = v;
            state.coherence = crate::risk::coherence(v, &params);

            let inputs = StateInputs {
                drift_squared: d2,
                complexity,
                confidence,
                ci_passed,
                external_validation: external,
                task_type: None,
            };
            let report = advance(&mut state, &inputs, &params).unwrap();

            prop_assert!(report.e >= 0.0 && report.e <= 1.0);
            prop_assert!(report.i >= 0.0 && report.i <= 1.0);
            prop_assert!(report.s >= 0.0 && report.s <= 2.0);
            prop_assert!(report.v >= -2.0 && report.v <= 2.0);
            prop_assert!(report.coherence >= 0.0 && report.coherence <= 1.0);
            prop_assert!(report.risk_score >= 0.0 && report.risk_score <= 1.0);
            prop_assert!(state.is_finite());
            if !external {
                prop_assert!(report.s >= params.s_min);
            }
        }
    }
}

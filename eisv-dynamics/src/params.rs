//! Tunable parameter set for the EISV equations

use serde::{Deserialize, Serialize};

/// Shape of the information-integrity equation.
///
/// `Linear` drops the saturating `gamma_i * I * (1 - I)` term, which some
/// deployments prefer when integrity should track entropy directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IDynamicsMode {
    Linear,
    Nonlinear,
}

impl IDynamicsMode {
    /// Parse from the `I_DYNAMICS_MODE` environment value.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "linear" => IDynamicsMode::Linear,
            _ => IDynamicsMode::Nonlinear,
        }
    }
}

/// Coefficients for one integration step.
///
/// Defaults are the tuned values; deployments override individual fields
/// through configuration rather than constructing from scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicsParams {
    /// Energy relaxation toward integrity.
    pub alpha: f64,
    /// Entropy drag on energy.
    pub beta_e: f64,
    /// Coherence reinforcement of integrity.
    pub beta_i: f64,
    /// Saturating integrity decay (nonlinear mode only).
    pub gamma_i: f64,
    /// Entropy erosion of integrity.
    pub k: f64,
    /// Entropy self-decay.
    pub mu: f64,
    /// Coherence-driven entropy drain.
    pub lambda2: f64,
    /// Void coupling to the energy/integrity gap.
    pub kappa: f64,
    /// Void self-decay.
    pub delta: f64,
    /// Base adaptive update-rate modulator.
    pub lambda1_base: f64,
    /// Coherence steepness `C(V) = C_max * 0.5 * (1 + tanh(c1 * V))`.
    pub c1: f64,
    /// Coherence ceiling.
    pub c_max: f64,
    /// Fixed Euler time step.
    pub dt: f64,
    /// Entropy floor unless the update is externally validated.
    pub s_min: f64,
    /// Confidence below which lambda1 updates are skipped.
    pub lambda1_gate_confidence: f64,
    /// EMA rate for lambda1 target tracking and risk/coherence history.
    pub ema_rate: f64,
    /// Integrity equation shape.
    pub i_mode: IDynamicsMode,
}

impl Default for DynamicsParams {
    fn default() -> Self {
        Self {
            alpha: 0.8,
            beta_e: 0.5,
            beta_i: 0.3,
            gamma_i: 0.1,
            k: 0.4,
            mu: 0.3,
            lambda2: 0.2,
            kappa: 0.5,
            delta: 0.2,
            lambda1_base: 0.3,
            c1: 3.0,
            c_max: 1.0,
            dt: 0.1,
            s_min: 0.001,
            lambda1_gate_confidence: 0.8,
            ema_rate: 0.1,
            i_mode: IDynamicsMode::Nonlinear,
        }
    }
}

impl DynamicsParams {
    /// Default parameters with the linear integrity equation.
    pub fn linear() -> Self {
        Self {
            i_mode: IDynamicsMode::Linear,
            ..Self::default()
        }
    }
}

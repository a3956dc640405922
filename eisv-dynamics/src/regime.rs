//! Trajectory regime detection

use serde::{Deserialize, Serialize};

/// Qualitative phase of an agent's trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Exploration,
    Transition,
    Convergence,
    Locked,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Exploration => "exploration",
            Regime::Transition => "transition",
            Regime::Convergence => "convergence",
            Regime::Locked => "locked",
        }
    }
}

/// Entropy/integrity changes smaller than this are treated as flat.
pub const REGIME_EPSILON: f64 = 1e-4;

/// Entropy and integrity levels that qualify a step for the locked regime.
pub const LOCKED_INTEGRITY: f64 = 0.999;
pub const LOCKED_ENTROPY: f64 = 0.001;

/// Consecutive qualifying steps before the locked regime is entered.
pub const LOCKED_PERSISTENCE: u32 = 3;

/// Classify the new state against the previous one.
///
/// `locked_persistence` counts consecutive steps satisfying the locked
/// predicate, including this one; the caller persists the returned counter.
/// Locked wins only after three consecutive qualifying steps.
pub fn detect(
    prev_s: f64,
    prev_i: f64,
    new_s: f64,
    new_i: f64,
    locked_persistence: u32,
) -> (Regime, u32) {
    let qualifies_locked = new_i >= LOCKED_INTEGRITY && new_s <= LOCKED_ENTROPY;
    let persistence = if qualifies_locked {
        locked_persistence.saturating_add(1)
    } else {
        0
    };
    if persistence >= LOCKED_PERSISTENCE {
        return (Regime::Locked, persistence);
    }

    let ds = new_s - prev_s;
    let di = new_i - prev_i;
    let regime = if ds > REGIME_EPSILON {
        Regime::Exploration
    } else if ds < -REGIME_EPSILON && di > REGIME_EPSILON {
        Regime::Convergence
    } else if ds < -REGIME_EPSILON {
        Regime::Transition
    } else {
        // Entropy flat: neither exploring nor collapsing.
        Regime::Transition
    };
    (regime, persistence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rising_entropy_is_exploration() {
        let (regime, _) = detect(0.2, 0.8, 0.3, 0.8, 0);
        assert_eq!(regime, Regime::Exploration);
    }

    #[test]
    fn test_falling_entropy_rising_integrity_is_convergence() {
        let (regime, _) = detect(0.3, 0.8, 0.2, 0.85, 0);
        assert_eq!(regime, Regime::Convergence);
    }

    #[test]
    fn test_falling_entropy_stable_integrity_is_transition() {
        let (regime, _) = detect(0.3, 0.8, 0.2, 0.8, 0);
        assert_eq!(regime, Regime::Transition);
    }

    #[test]
    fn test_locked_requires_three_consecutive_steps() {
        let (regime, count) = detect(0.001, 0.9995, 0.0005, 0.9995, 0);
        assert_ne!(regime, Regime::Locked);
        assert_eq!(count, 1);

        let (regime, count) = detect(0.0005, 0.9995, 0.0005, 0.9995, 1);
        assert_ne!(regime, Regime::Locked);
        assert_eq!(count, 2);

        let (regime, count) = detect(0.0005, 0.9995, 0.0005, 0.9995, 2);
        assert_eq!(regime, Regime::Locked);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_locked_counter_resets_on_disqualifying_step() {
        let (_, count) = detect(0.0005, 0.9995, 0.5, 0.9, 2);
        assert_eq!(count, 0);
    }
}

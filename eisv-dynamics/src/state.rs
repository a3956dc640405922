//! Per-agent EISV state and bounded history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::params::DynamicsParams;
use crate::regime::Regime;
use crate::risk::{self, CalibrationTable, Margin};

/// Maximum number of history points retained per agent.
pub const HISTORY_CAPACITY: usize = 64;

/// One retained sample of a past update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub e: f64,
    pub i: f64,
    pub s: f64,
    pub v: f64,
    pub coherence: f64,
    pub risk: f64,
    pub at: DateTime<Utc>,
}

/// Bounded ring of recent history points, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryRing {
    points: VecDeque<HistoryPoint>,
}

impl HistoryRing {
    pub fn push(&mut self, point: HistoryPoint) {
        self.points.push_back(point);
        while self.points.len() > HISTORY_CAPACITY {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }

    pub fn latest(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }

    /// Most recent `n` points, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<&HistoryPoint> {
        let skip = self.points.len().saturating_sub(n);
        self.points.iter().skip(skip).collect()
    }

    /// Number of sign flips in the void trajectory, used by oscillation
    /// detection.
    pub fn void_sign_flips(&self) -> usize {
        let mut flips = 0;
        let mut prev: Option<f64> = None;
        for p in &self.points {
            if let Some(prev_v) = prev {
                if prev_v.signum() != p.v.signum() && p.v != 0.0 && prev_v != 0.0 {
                    flips += 1;
                }
            }
            prev = Some(p.v);
        }
        flips
    }
}

/// Full dynamics state for one agent.
///
/// Owned by the governance engine; every mutation happens under the agent's
/// write-lock. Readers may observe a state at most one update behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EisvState {
    pub e: f64,
    pub i: f64,
    pub s: f64,
    pub v: f64,
    pub coherence: f64,
    pub risk_score: f64,
    pub lambda1: f64,
    pub regime: Regime,
    pub margin: Margin,
    pub total_updates: u64,
    pub lambda1_skip_count: u64,
    /// Consecutive updates satisfying the locked-regime predicate.
    pub locked_persistence_count: u32,
    /// EMA of recent risk, feeds the lambda1 target.
    pub risk_ema: f64,
    /// EMA of recent coherence, feeds the lambda1 target.
    pub coherence_ema: f64,
    pub calibration: CalibrationTable,
    pub history: HistoryRing,
    pub updated_at: DateTime<Utc>,
}

impl EisvState {
    /// Genesis state for a freshly onboarded agent.
    pub fn genesis(params: &DynamicsParams) -> Self {
        let e = 0.5;
        let i = 0.8;
        let s = 0.2;
        let v = 0.0;
        let coherence = risk::coherence(v, params);
        let risk_score = risk::risk_score(s, v, coherence, 0.0, 0.0);
        Self {
            e,
            i,
            s,
            v,
            coherence,
            risk_score,
            lambda1: params.lambda1_base,
            regime: Regime::Exploration,
            margin: risk::margin_of(coherence, risk_score, v),
            total_updates: 0,
            lambda1_skip_count: 0,
            locked_persistence_count: 0,
            risk_ema: risk_score,
            coherence_ema: coherence,
            calibration: CalibrationTable::default(),
            history: HistoryRing::default(),
            updated_at: Utc::now(),
        }
    }

    /// All scalar fields finite. A state failing this must never be
    /// persisted.
    pub fn is_finite(&self) -> bool {
        [
            self.e,
            self.i,
            self.s,
            self.v,
            self.coherence,
            self.risk_score,
            self.lambda1,
        ]
        .iter()
        .all(|x| x.is_finite())
    }

    /// Record the current scalars into the history ring.
    pub fn push_history(&mut self) {
        let point = HistoryPoint {
            e: self.e,
            i: self.i,
            s: self.s,
            v: self.v,
            coherence: self.coherence,
            risk: self.risk_score,
            at: self.updated_at,
        };
        self.history.push(point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_state_within_bounds() {
        let state = EisvState::genesis(&DynamicsParams::default());
        assert_eq!(state.e, 0.5);
        assert_eq!(state.i, 0.8);
        assert_eq!(state.s, 0.2);
        assert_eq!(state.v, 0.0);
        assert_eq!(state.coherence, 0.5);
        assert_eq!(state.total_updates, 0);
        assert!(state.is_finite());
    }

    #[test]
    fn test_history_ring_bounded() {
        let mut ring = HistoryRing::default();
        for n in 0..(HISTORY_CAPACITY + 10) {
            ring.push(HistoryPoint {
                e: n as f64,
                i: 0.0,
                s: 0.0,
                v: 0.0,
                coherence: 0.0,
                risk: 0.0,
                at: Utc::now(),
            });
        }
        assert_eq!(ring.len(), HISTORY_CAPACITY);
        // Oldest entries were evicted first.
        assert_eq!(ring.iter().next().unwrap().e, 10.0);
    }

    #[test]
    fn test_void_sign_flips() {
        let mut ring = HistoryRing::default();
        for v in [0.1, -0.1, 0.2, -0.2, -0.3] {
            ring.push(HistoryPoint {
                e: 0.0,
                i: 0.0,
                s: 0.0,
                v,
                coherence: 0.0,
                risk: 0.0,
                at: Utc::now(),
            });
        }
        assert_eq!(ring.void_sign_flips(), 3);
    }
}

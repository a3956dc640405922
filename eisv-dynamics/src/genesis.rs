//! Genesis signature: a fixed fingerprint of an agent's first updates
//!
//! Captured once the agent has reported its first few states and never
//! recomputed. Later windows of the trajectory can be summarized the same
//! way and compared against the genesis shape to flag identity drift.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::state::HistoryPoint;

/// Number of accepted updates fingerprinted at genesis.
pub const GENESIS_WINDOW: usize = 5;

/// Shape statistics of a trajectory window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub mean_e: f64,
    pub mean_i: f64,
    pub mean_s: f64,
    pub mean_v: f64,
    pub spread_s: f64,
    pub spread_v: f64,
}

impl WindowStats {
    pub fn of(points: &[HistoryPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f64;
        let mean_e = points.iter().map(|p| p.e).sum::<f64>() / n;
        let mean_i = points.iter().map(|p| p.i).sum::<f64>() / n;
        let mean_s = points.iter().map(|p| p.s).sum::<f64>() / n;
        let mean_v = points.iter().map(|p| p.v).sum::<f64>() / n;
        let spread_s =
            (points.iter().map(|p| (p.s - mean_s).powi(2)).sum::<f64>() / n).sqrt();
        let spread_v =
            (points.iter().map(|p| (p.v - mean_v).powi(2)).sum::<f64>() / n).sqrt();
        Some(Self {
            mean_e,
            mean_i,
            mean_s,
            mean_v,
            spread_s,
            spread_v,
        })
    }

    /// Euclidean distance between two window shapes.
    pub fn distance(&self, other: &WindowStats) -> f64 {
        ((self.mean_e - other.mean_e).powi(2)
            + (self.mean_i - other.mean_i).powi(2)
            + (self.mean_s - other.mean_s).powi(2)
            + (self.mean_v - other.mean_v).powi(2)
            + (self.spread_s - other.spread_s).powi(2)
            + (self.spread_v - other.spread_v).powi(2))
        .sqrt()
    }
}

/// Immutable fingerprint of the genesis window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisSignature {
    /// SHA-256 over the canonical encoding of the window, hex.
    pub digest: String,
    /// Shape statistics retained for later drift comparison.
    pub stats: WindowStats,
}

impl GenesisSignature {
    /// Capture from the first `GENESIS_WINDOW` history points. Returns
    /// `None` until enough updates have accumulated.
    pub fn capture(points: &[HistoryPoint]) -> Option<Self> {
        if points.len() < GENESIS_WINDOW {
            return None;
        }
        let window = &points[..GENESIS_WINDOW];
        let stats = WindowStats::of(window)?;

        let mut hasher = Sha256::new();
        for p in window {
            // Quantize so serialization jitter cannot change the digest.
            hasher.update(format!(
                "{:.6}|{:.6}|{:.6}|{:.6};",
                p.e, p.i, p.s, p.v
            ));
        }
        Some(Self {
            digest: hex::encode(hasher.finalize()),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn point(e: f64, i: f64, s: f64, v: f64) -> HistoryPoint {
        HistoryPoint {
            e,
            i,
            s,
            v,
            coherence: 0.5,
            risk: 0.2,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_capture_requires_full_window() {
        let points: Vec<_> = (0..4).map(|_| point(0.5, 0.8, 0.2, 0.0)).collect();
        assert!(GenesisSignature::capture(&points).is_none());
    }

    #[test]
    fn test_capture_is_deterministic() {
        let points: Vec<_> = (0..5).map(|n| point(0.5 + n as f64 * 0.01, 0.8, 0.2, 0.0)).collect();
        let a = GenesisSignature::capture(&points).unwrap();
        let b = GenesisSignature::capture(&points).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);
    }

    #[test]
    fn test_different_trajectories_differ() {
        let a: Vec<_> = (0..5).map(|_| point(0.5, 0.8, 0.2, 0.0)).collect();
        let b: Vec<_> = (0..5).map(|_| point(0.3, 0.2, 1.2, 0.1)).collect();
        let sig_a = GenesisSignature::capture(&a).unwrap();
        let sig_b = GenesisSignature::capture(&b).unwrap();
        assert_ne!(sig_a.digest, sig_b.digest);
        assert!(sig_a.stats.distance(&sig_b.stats) > 0.5);
    }

    #[test]
    fn test_extra_points_do_not_change_signature() {
        let mut points: Vec<_> = (0..5).map(|n| point(0.5, 0.8, 0.2 + n as f64 * 0.01, 0.0)).collect();
        let before = GenesisSignature::capture(&points).unwrap();
        points.push(point(0.9, 0.9, 0.0, 1.0));
        let after = GenesisSignature::capture(&points).unwrap();
        assert_eq!(before.digest, after.digest);
    }
}

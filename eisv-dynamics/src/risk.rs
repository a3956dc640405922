//! Coherence, risk scoring, margin classification, and confidence
//! calibration

use serde::{Deserialize, Serialize};

use crate::params::DynamicsParams;

/// Verdict-edge thresholds. `margin_of` and the verdict derivation share
/// these so the two can never disagree about where the edges are.
pub const COHERENCE_FLOOR: f64 = 0.40;
pub const RISK_CEILING: f64 = 0.60;
pub const VOID_CEILING: f64 = 0.15;
/// Fraction of an edge's headroom that counts as "close".
pub const MARGIN_PROXIMITY: f64 = 0.20;

// Risk-score weights. Normalizers map each component into [0, 1]; the
// weights sum to 1 so the aggregate needs no renormalization.
const W_ENTROPY: f64 = 0.30;
const W_VOID: f64 = 0.20;
const W_INCOHERENCE: f64 = 0.30;
const W_CALIBRATION: f64 = 0.10;
const W_DRIFT: f64 = 0.10;
const ENTROPY_SCALE: f64 = 1.2;
const VOID_SCALE: f64 = 0.5;
const DRIFT_SCALE: f64 = 0.5;

/// How close the state sits to a verdict-failure edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Margin {
    Comfortable,
    Tight,
    Critical,
}

impl Margin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Margin::Comfortable => "comfortable",
            Margin::Tight => "tight",
            Margin::Critical => "critical",
        }
    }
}

/// Coherence `C(V) = C_max * 0.5 * (1 + tanh(c1 * V))`.
pub fn coherence(v: f64, params: &DynamicsParams) -> f64 {
    params.c_max * 0.5 * (1.0 + (params.c1 * v).tanh())
}

/// Aggregate risk in `[0, 1]` from entropy, void magnitude, incoherence,
/// calibration deviation, and drift magnitude.
pub fn risk_score(s: f64, v: f64, coherence: f64, calibration_deviation: f64, drift_squared: f64) -> f64 {
    let entropy = (s / ENTROPY_SCALE).clamp(0.0, 1.0);
    let void = (v.abs() / VOID_SCALE).clamp(0.0, 1.0);
    let incoherence = (1.0 - coherence).clamp(0.0, 1.0);
    let calibration = calibration_deviation.clamp(0.0, 1.0);
    let drift = (drift_squared / DRIFT_SCALE).clamp(0.0, 1.0);

    (W_ENTROPY * entropy
        + W_VOID * void
        + W_INCOHERENCE * incoherence
        + W_CALIBRATION * calibration
        + W_DRIFT * drift)
        .clamp(0.0, 1.0)
}

/// Classify distance to the failure edges.
///
/// Critical when any edge is crossed; tight when any edge is within 20% of
/// its threshold; comfortable otherwise.
pub fn margin_of(coherence: f64, risk: f64, v: f64) -> Margin {
    if coherence < COHERENCE_FLOOR || risk >= RISK_CEILING || v.abs() >= VOID_CEILING {
        return Margin::Critical;
    }
    let tight_coherence = coherence < COHERENCE_FLOOR * (1.0 + MARGIN_PROXIMITY);
    let tight_risk = risk >= RISK_CEILING * (1.0 - MARGIN_PROXIMITY);
    let tight_void = v.abs() >= VOID_CEILING * (1.0 - MARGIN_PROXIMITY);
    if tight_coherence || tight_risk || tight_void {
        Margin::Tight
    } else {
        Margin::Comfortable
    }
}

const CALIBRATION_BUCKETS: usize = 10;
const MIN_BUCKET_SAMPLES: u64 = 5;
const CALIBRATION_EMA_RATE: f64 = 0.1;

/// Expected-vs-observed outcome tracking per confidence bucket.
///
/// Reported confidence falls into one of ten equal-width buckets; the
/// observed CI pass rate per bucket is tracked as an EMA. The deviation
/// between a bucket's midpoint and its observed rate feeds the risk score
/// once the bucket has enough samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTable {
    buckets: Vec<CalibrationBucket>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CalibrationBucket {
    samples: u64,
    observed_pass_rate: f64,
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self {
            buckets: vec![CalibrationBucket::default(); CALIBRATION_BUCKETS],
        }
    }
}

impl CalibrationTable {
    fn bucket_index(confidence: f64) -> usize {
        ((confidence.clamp(0.0, 1.0) * CALIBRATION_BUCKETS as f64) as usize)
            .min(CALIBRATION_BUCKETS - 1)
    }

    fn bucket_midpoint(index: usize) -> f64 {
        (index as f64 + 0.5) / CALIBRATION_BUCKETS as f64
    }

    /// Record one observed outcome for the bucket `confidence` falls into.
    pub fn record(&mut self, confidence: f64, ci_passed: bool) {
        let index = Self::bucket_index(confidence);
        let bucket = &mut self.buckets[index];
        let observed = if ci_passed { 1.0 } else { 0.0 };
        if bucket.samples == 0 {
            bucket.observed_pass_rate = observed;
        } else {
            bucket.observed_pass_rate +=
                CALIBRATION_EMA_RATE * (observed - bucket.observed_pass_rate);
        }
        bucket.samples += 1;
    }

    /// Gap between claimed confidence and observed outcomes, `0.0` until the
    /// bucket has enough samples to be meaningful.
    pub fn deviation(&self, confidence: f64) -> f64 {
        let index = Self::bucket_index(confidence);
        let bucket = &self.buckets[index];
        if bucket.samples < MIN_BUCKET_SAMPLES {
            return 0.0;
        }
        (Self::bucket_midpoint(index) - bucket.observed_pass_rate).abs()
    }

    /// Total recorded samples across all buckets.
    pub fn sample_count(&self) -> u64 {
        self.buckets.iter().map(|b| b.samples).sum()
    }

    /// Sample-weighted observed pass rate across all buckets, `0.0` when
    /// nothing has been recorded. Feeds trust-tier derivation.
    pub fn observed_pass_rate(&self) -> f64 {
        let total = self.sample_count();
        if total == 0 {
            return 0.0;
        }
        self.buckets
            .iter()
            .map(|b| b.observed_pass_rate * b.samples as f64)
            .sum::<f64>()
            / total as f64
    }
}

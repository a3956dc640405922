//! Projection of lambda1 into next-turn sampling parameters

use serde::{Deserialize, Serialize};

const TEMPERATURE_RANGE: (f64, f64) = (0.1, 1.2);
const TOP_P_RANGE: (f64, f64) = (0.5, 0.99);
const MAX_TOKENS_RANGE: (u32, u32) = (64, 512);

/// Sampling parameters the caller applies on the agent's next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

impl SamplingParams {
    /// Affine projection of lambda1, monotonic in all three outputs.
    pub fn from_lambda1(lambda1: f64) -> Self {
        let t = lambda1.clamp(0.0, 1.0);
        let temperature = TEMPERATURE_RANGE.0 + t * (TEMPERATURE_RANGE.1 - TEMPERATURE_RANGE.0);
        let top_p = TOP_P_RANGE.0 + t * (TOP_P_RANGE.1 - TOP_P_RANGE.0);
        let span = (MAX_TOKENS_RANGE.1 - MAX_TOKENS_RANGE.0) as f64;
        let max_tokens = MAX_TOKENS_RANGE.0 + (t * span).round() as u32;
        Self {
            temperature,
            top_p,
            max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_endpoints() {
        let low = SamplingParams::from_lambda1(0.0);
        assert!((low.temperature - 0.1).abs() < 1e-12);
        assert!((low.top_p - 0.5).abs() < 1e-12);
        assert_eq!(low.max_tokens, 64);

        let high = SamplingParams::from_lambda1(1.0);
        assert!((high.temperature - 1.2).abs() < 1e-12);
        assert!((high.top_p - 0.99).abs() < 1e-12);
        assert_eq!(high.max_tokens, 512);
    }

    #[test]
    fn test_projection_monotonic() {
        let mut prev = SamplingParams::from_lambda1(0.0);
        for step in 1..=20 {
            let next = SamplingParams::from_lambda1(step as f64 / 20.0);
            assert!(next.temperature >= prev.temperature);
            assert!(next.top_p >= prev.top_p);
            assert!(next.max_tokens >= prev.max_tokens);
            prev = next;
        }
    }

    #[test]
    fn test_out_of_range_lambda1_clamped() {
        assert_eq!(
            SamplingParams::from_lambda1(7.0),
            SamplingParams::from_lambda1(1.0)
        );
        assert_eq!(
            SamplingParams::from_lambda1(-3.0),
            SamplingParams::from_lambda1(0.0)
        );
    }
}

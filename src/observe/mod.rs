//! Observability: snapshots, comparisons, anomaly detection, telemetry
//!
//! Read-only over the store plus an in-process counter table. Nothing here
//! takes the write-lock; views may trail a concurrent writer by one update.

use dashmap::DashMap;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use eisv_dynamics::genesis::{GENESIS_WINDOW, WindowStats};

use crate::error::{GovError, GovResult};
use crate::identity::AgentStatus;
use crate::store::{IdentityFilter, Store};

/// Void-trajectory sign flips in the ring before oscillation is flagged.
const OSCILLATION_FLIPS: usize = 6;

/// Shape distance from the genesis window before drift is flagged.
const GENESIS_DRIFT_DISTANCE: f64 = 0.75;

/// Monotonic process-wide counters.
#[derive(Default)]
pub struct Telemetry {
    counters: DashMap<String, u64>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        *self.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Read-side observability service.
pub struct Observability {
    store: Arc<dyn Store>,
    telemetry: Arc<Telemetry>,
}

impl Observability {
    pub fn new(store: Arc<dyn Store>, telemetry: Arc<Telemetry>) -> Self {
        Self { store, telemetry }
    }

    /// Latest snapshot view for one agent.
    pub async fn observe(&self, uuid: Uuid) -> GovResult<Value> {
        let identity = self
            .store
            .get_identity(uuid)
            .await?
            .ok_or_else(|| GovError::agent_not_found(uuid))?;
        let state = self.store.load_state(uuid).await?;
        Ok(json!({
            "identity": identity.public_view(),
            "state": state.map(|s| json!({
                "e": s.e,
                "i": s.i,
                "s": s.s,
                "v": s.v,
                "coherence": s.coherence,
                "risk_score": s.risk_score,
                "lambda1": s.lambda1,
                "regime": s.regime,
                "margin": s.margin,
                "total_updates": s.total_updates,
                "lambda1_skip_count": s.lambda1_skip_count,
                "updated_at": s.updated_at,
            })),
        }))
    }

    /// Per-axis deltas between two agents' latest states.
    pub async fn compare(&self, a: Uuid, b: Uuid) -> GovResult<Value> {
        let state_a = self
            .store
            .load_state(a)
            .await?
            .ok_or_else(|| GovError::agent_not_found(a))?;
        let state_b = self
            .store
            .load_state(b)
            .await?
            .ok_or_else(|| GovError::agent_not_found(b))?;
        Ok(json!({
            "a": a,
            "b": b,
            "delta": {
                "e": state_a.e - state_b.e,
                "i": state_a.i - state_b.i,
                "s": state_a.s - state_b.s,
                "v": state_a.v - state_b.v,
                "coherence": state_a.coherence - state_b.coherence,
                "risk_score": state_a.risk_score - state_b.risk_score,
            },
            "regimes": [state_a.regime, state_b.regime],
            "margins": [state_a.margin, state_b.margin],
        }))
    }

    /// Flag oscillation and genesis-shape drift for one agent.
    pub async fn detect_anomalies(&self, uuid: Uuid) -> GovResult<Value> {
        let identity = self
            .store
            .get_identity(uuid)
            .await?
            .ok_or_else(|| GovError::agent_not_found(uuid))?;
        let state = self
            .store
            .load_state(uuid)
            .await?
            .ok_or_else(|| GovError::agent_not_found(uuid))?;

        let mut anomalies = Vec::new();

        // A non-finite scalar should never persist; if one is observed the
        // write path has been bypassed somewhere.
        if !state.is_finite() {
            anomalies.push(json!({
                "kind": "non_finite",
                "detail": "state carries a non-finite scalar",
            }));
        }

        let flips = state.history.void_sign_flips();
        if flips >= OSCILLATION_FLIPS {
            anomalies.push(json!({
                "kind": "oscillation",
                "detail": format!("void trajectory flipped sign {} times in the ring", flips),
            }));
        }

        if let Some(genesis) = &identity.genesis_signature {
            let recent: Vec<_> = state
                .history
                .last_n(GENESIS_WINDOW)
                .into_iter()
                .cloned()
                .collect();
            if recent.len() == GENESIS_WINDOW {
                if let Some(stats) = WindowStats::of(&recent) {
                    let distance = stats.distance(&genesis.stats);
                    if distance > GENESIS_DRIFT_DISTANCE {
                        anomalies.push(json!({
                            "kind": "genesis_drift",
                            "detail": format!(
                                "trajectory shape departed {:.3} from the genesis window",
                                distance
                            ),
                        }));
                    }
                }
            }
        }

        Ok(json!({
            "agent_uuid": uuid,
            "anomalies": anomalies,
        }))
    }

    /// Fleet-wide aggregates over every non-archived agent with state.
    pub async fn aggregate_metrics(&self) -> GovResult<Value> {
        let identities = self
            .store
            .list_identities(&IdentityFilter::default())
            .await?;

        let mut count = 0usize;
        let mut sums = [0.0f64; 6];
        let mut mins = [f64::INFINITY; 6];
        let mut maxs = [f64::NEG_INFINITY; 6];
        let mut regimes: BTreeMap<String, usize> = BTreeMap::new();
        let mut margins: BTreeMap<String, usize> = BTreeMap::new();

        for identity in &identities {
            // Archived identities freeze their state; keep them out of the
            // fleet aggregates.
            if identity.status == AgentStatus::Archived {
                continue;
            }
            let Some(state) = self.store.load_state(identity.uuid).await? else {
                continue;
            };
            count += 1;
            for (slot, value) in [
                state.e,
                state.i,
                state.s,
                state.v,
                state.coherence,
                state.risk_score,
            ]
            .into_iter()
            .enumerate()
            {
                sums[slot] += value;
                mins[slot] = mins[slot].min(value);
                maxs[slot] = maxs[slot].max(value);
            }
            *regimes.entry(state.regime.as_str().to_string()).or_insert(0) += 1;
            *margins.entry(state.margin.as_str().to_string()).or_insert(0) += 1;
        }

        let axis = |slot: usize| {
            if count == 0 {
                json!({ "mean": null, "min": null, "max": null })
            } else {
                json!({
                    "mean": sums[slot] / count as f64,
                    "min": mins[slot],
                    "max": maxs[slot],
                })
            }
        };

        Ok(json!({
            "agents": count,
            "e": axis(0),
            "i": axis(1),
            "s": axis(2),
            "v": axis(3),
            "coherence": axis(4),
            "risk_score": axis(5),
            "regimes": regimes,
            "margins": margins,
        }))
    }

    /// Process counters.
    pub fn telemetry(&self) -> Value {
        json!(self.telemetry.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_counters() {
        let telemetry = Telemetry::new();
        telemetry.incr("updates.total");
        telemetry.incr("updates.total");
        telemetry.incr("verdicts.approve");
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot["updates.total"], 2);
        assert_eq!(snapshot["verdicts.approve"], 1);
    }
}

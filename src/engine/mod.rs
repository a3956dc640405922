//! Governance engine: the single writer of agent dynamics state
//!
//! Every mutation happens under the agent's named write-lock: load prior
//! state, integrate exactly one step, persist, audit, release. Reads go
//! through `snapshot` without the lock and may trail by one update.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use eisv_dynamics::{
    DynamicsParams, EisvState, GenesisSignature, Margin, Regime, SamplingParams, StateInputs,
    Verdict, advance, genesis::GENESIS_WINDOW, integrator::estimate_complexity,
};

use crate::audit::{AuditEvent, AuditLog};
use crate::dialectic::ProposedCondition;
use crate::dialectic::safety::{MAX_RISK_THRESHOLD, MIN_COHERENCE_THRESHOLD};
use crate::error::{ErrorCode, GovError, GovResult};
use crate::identity::{AgentStatus, IdentityResolver, derive_trust_tier};
use crate::lock::{LockHandle, NamedLock};
use crate::observe::Telemetry;
use crate::recovery::patterns::PatternTracker;
use crate::store::Store;

/// Default safety-predicate edges, adjustable per agent through accepted
/// resume conditions.
pub const DEFAULT_RISK_THRESHOLD: f64 = 0.60;
pub const DEFAULT_COHERENCE_FLOOR: f64 = 0.40;
/// Void magnitude at which the void term is considered active.
pub const VOID_ACTIVE: f64 = 0.15;

fn default_confidence() -> f64 {
    1.0
}

/// One agent update as delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Agent-configuration vector; dimension fixed per deployment.
    pub parameters: Vec<f64>,
    /// Ethical-drift vector; dimension fixed per deployment.
    pub ethical_drift: Vec<f64>,
    /// Opaque; only used to estimate complexity when unset.
    #[serde(default)]
    pub response_text: Option<String>,
    #[serde(default)]
    pub complexity: Option<f64>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub ci_passed: bool,
    #[serde(default)]
    pub external_validation: bool,
    #[serde(default)]
    pub task_type: Option<String>,
}

/// Result of one processed (or simulated) update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResult {
    pub agent_uuid: Uuid,
    pub e: f64,
    pub i: f64,
    pub s: f64,
    pub v: f64,
    pub coherence: f64,
    pub risk_score: f64,
    pub margin: Margin,
    pub regime: Regime,
    pub verdict: Verdict,
    pub auto_attest: bool,
    pub require_human: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    pub sampling: SamplingParams,
    pub lambda1: f64,
    pub lambda1_skipped: bool,
    pub total_updates: u64,
    /// Set when a reject verdict paused the agent.
    pub paused: bool,
    pub simulated: bool,
}

/// Per-agent governance thresholds plus reviewer-imposed limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedConditions {
    pub risk_threshold: f64,
    pub coherence_floor: f64,
    #[serde(default)]
    pub limits: Vec<ProposedCondition>,
}

impl Default for AppliedConditions {
    fn default() -> Self {
        Self {
            risk_threshold: DEFAULT_RISK_THRESHOLD,
            coherence_floor: DEFAULT_COHERENCE_FLOOR,
            limits: Vec::new(),
        }
    }
}

/// Result of a resume attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeOutcome {
    pub agent_uuid: Uuid,
    pub status: AgentStatus,
    pub already_active: bool,
    pub applied_conditions: AppliedConditions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_uuid: Option<Uuid>,
}

pub struct GovernanceEngine {
    store: Arc<dyn Store>,
    locks: Arc<dyn NamedLock>,
    resolver: Arc<IdentityResolver>,
    audit: Arc<AuditLog>,
    telemetry: Arc<Telemetry>,
    patterns: Arc<PatternTracker>,
    params: DynamicsParams,
    param_dim: usize,
    drift_dim: usize,
    lock_ttl: Duration,
    conditions: DashMap<Uuid, AppliedConditions>,
}

impl GovernanceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        locks: Arc<dyn NamedLock>,
        resolver: Arc<IdentityResolver>,
        audit: Arc<AuditLog>,
        telemetry: Arc<Telemetry>,
        patterns: Arc<PatternTracker>,
        params: DynamicsParams,
        param_dim: usize,
        drift_dim: usize,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            resolver,
            audit,
            telemetry,
            patterns,
            params,
            param_dim,
            drift_dim,
            lock_ttl,
            conditions: DashMap::new(),
        }
    }

    fn lock_name(uuid: Uuid) -> String {
        format!("agent:{}", uuid)
    }

    /// Acquire the agent's write-lock, retrying acquisition once before
    /// surfacing `CONTENTION`.
    async fn acquire(&self, uuid: Uuid) -> GovResult<Box<dyn LockHandle>> {
        let name = Self::lock_name(uuid);
        match self.locks.acquire(&name, self.lock_ttl).await {
            Ok(handle) => Ok(handle),
            Err(first) if first.code == ErrorCode::Contention => {
                self.locks.acquire(&name, self.lock_ttl).await.map_err(|_| first)
            }
            Err(err) => Err(err),
        }
    }

    fn validate(&self, request: &UpdateRequest) -> GovResult<StateInputs> {
        if request.parameters.len() != self.param_dim {
            return Err(GovError::out_of_range("parameters", request.parameters.len() as u64)
                .with_details(json!({
                    "parameter": "parameters",
                    "expected_dim": self.param_dim,
                    "actual_dim": request.parameters.len(),
                })));
        }
        if request.ethical_drift.len() != self.drift_dim {
            return Err(
                GovError::out_of_range("ethical_drift", request.ethical_drift.len() as u64)
                    .with_details(json!({
                        "parameter": "ethical_drift",
                        "expected_dim": self.drift_dim,
                        "actual_dim": request.ethical_drift.len(),
                    })),
            );
        }
        if request.parameters.iter().any(|p| !p.is_finite())
            || request.ethical_drift.iter().any(|d| !d.is_finite())
        {
            return Err(GovError::invalid_type("parameters", "vector of finite reals"));
        }

        let drift_squared = request.ethical_drift.iter().map(|d| d * d).sum::<f64>()
            / request.ethical_drift.len().max(1) as f64;
        let complexity = request.complexity.unwrap_or_else(|| {
            estimate_complexity(request.response_text.as_deref().unwrap_or(""))
        });

        let inputs = StateInputs {
            drift_squared,
            complexity,
            confidence: request.confidence,
            ci_passed: request.ci_passed,
            external_validation: request.external_validation,
            task_type: request.task_type.clone(),
        };
        inputs.validate()?;
        Ok(inputs)
    }

    /// Process one update under the agent's write-lock.
    pub async fn apply_update(
        &self,
        uuid: Uuid,
        request: UpdateRequest,
    ) -> GovResult<UpdateResult> {
        let inputs = self.validate(&request)?;

        let identity = self.resolver.require_identity(uuid).await?;
        if identity.status != AgentStatus::Active {
            return Err(GovError::new(
                ErrorCode::Conflict,
                format!(
                    "agent is {} and cannot accept updates",
                    identity.status.as_str()
                ),
            )
            .with_recovery(["resume_if_safe", "request_review"]));
        }

        let handle = self.acquire(uuid).await?;
        let result = self
            .apply_update_locked(uuid, &request, inputs, identity.genesis_signature.is_none())
            .await;
        let _ = handle.release().await;
        result
    }

    async fn apply_update_locked(
        &self,
        uuid: Uuid,
        request: &UpdateRequest,
        inputs: StateInputs,
        genesis_pending: bool,
    ) -> GovResult<UpdateResult> {
        let mut state = self
            .store
            .load_state(uuid)
            .await?
            .unwrap_or_else(|| EisvState::genesis(&self.params));

        let report = match advance(&mut state, &inputs, &self.params) {
            Ok(report) => report,
            Err(err) => {
                self.telemetry.incr("updates.integration_failures");
                self.audit
                    .append(
                        AuditEvent::new(uuid, "update.integration_failure")
                            .subject(uuid)
                            .details(json!({ "error": err.to_string() })),
                    )
                    .await?;
                return Err(err.into());
            }
        };

        // Persistence failure means the agent's state did not advance.
        self.store.save_state(uuid, &state).await.map_err(|err| {
            GovError::new(
                ErrorCode::PersistFailure,
                format!("state not persisted: {}", err.message),
            )
        })?;

        self.patterns.record(
            uuid,
            PatternTracker::fingerprint(request.task_type.as_deref(), &request.parameters),
        );

        if genesis_pending && state.total_updates >= GENESIS_WINDOW as u64 {
            let points: Vec<_> = state.history.iter().cloned().collect();
            if let Some(signature) = GenesisSignature::capture(&points) {
                self.resolver.record_genesis(uuid, signature).await?;
            }
        }

        let tier = derive_trust_tier(
            state.total_updates,
            state.risk_ema,
            state.calibration.observed_pass_rate(),
        );
        self.resolver.note_activity(uuid, tier).await?;

        self.telemetry.incr("updates.total");
        self.telemetry
            .incr(&format!("verdicts.{}", report.outcome.verdict.as_str()));
        self.audit
            .append(
                AuditEvent::new(uuid, "update.processed")
                    .subject(uuid)
                    .details(json!({
                        "verdict": report.outcome.verdict,
                        "risk_score": report.risk_score,
                        "coherence": report.coherence,
                        "margin": report.margin,
                        "regime": report.regime,
                        "auto_attest": report.outcome.auto_attest,
                    })),
            )
            .await?;

        // A reject verdict pauses the agent; nothing else is written for
        // this update.
        let paused = report.outcome.verdict == Verdict::Reject;
        if paused {
            self.resolver
                .transition_status(uuid, AgentStatus::Paused, "reject verdict")
                .await?;
            self.telemetry.incr("agents.paused");
        }

        Ok(UpdateResult {
            agent_uuid: uuid,
            e: report.e,
            i: report.i,
            s: report.s,
            v: report.v,
            coherence: report.coherence,
            risk_score: report.risk_score,
            margin: report.margin,
            regime: report.regime,
            verdict: report.outcome.verdict,
            auto_attest: report.outcome.auto_attest,
            require_human: report.outcome.require_human,
            guidance: report.outcome.guidance,
            sampling: report.sampling,
            lambda1: report.lambda1,
            lambda1_skipped: report.lambda1_skipped,
            total_updates: state.total_updates,
            paused,
            simulated: false,
        })
    }

    /// Dry-run: one step computed from the current snapshot with no lock,
    /// no persistence, and no lifecycle effects.
    pub async fn simulate_update(
        &self,
        uuid: Uuid,
        request: UpdateRequest,
    ) -> GovResult<UpdateResult> {
        let inputs = self.validate(&request)?;
        self.resolver.require_identity(uuid).await?;

        let mut state = self
            .store
            .load_state(uuid)
            .await?
            .unwrap_or_else(|| EisvState::genesis(&self.params));
        let report = advance(&mut state, &inputs, &self.params)?;
        self.telemetry.incr("updates.simulated");

        Ok(UpdateResult {
            agent_uuid: uuid,
            e: report.e,
            i: report.i,
            s: report.s,
            v: report.v,
            coherence: report.coherence,
            risk_score: report.risk_score,
            margin: report.margin,
            regime: report.regime,
            verdict: report.outcome.verdict,
            auto_attest: report.outcome.auto_attest,
            require_human: report.outcome.require_human,
            guidance: report.outcome.guidance,
            sampling: report.sampling,
            lambda1: report.lambda1,
            lambda1_skipped: report.lambda1_skipped,
            total_updates: state.total_updates,
            paused: false,
            simulated: true,
        })
    }

    /// Read-only view; never takes the lock.
    pub async fn snapshot(&self, uuid: Uuid) -> GovResult<(Option<EisvState>, AppliedConditions)> {
        self.resolver.require_identity(uuid).await?;
        let state = self.store.load_state(uuid).await?;
        Ok((state, self.conditions_for(uuid)))
    }

    pub fn conditions_for(&self, uuid: Uuid) -> AppliedConditions {
        self.conditions
            .get(&uuid)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// The recovery safety predicate against the agent's current
    /// thresholds.
    pub fn is_safe(&self, uuid: Uuid, state: &EisvState) -> bool {
        let thresholds = self.conditions_for(uuid);
        state.coherence > thresholds.coherence_floor
            && state.risk_score < thresholds.risk_threshold
            && state.v.abs() < VOID_ACTIVE
    }

    /// Transition a paused agent back to active.
    ///
    /// Without `via_gate` the per-agent safety predicate must hold. With
    /// `via_gate` (a synthesis accepted by the Safety Gate) only the hard
    /// bounds apply, and the gate's condition set is installed.
    pub async fn resume(
        &self,
        uuid: Uuid,
        conditions: Vec<ProposedCondition>,
        reviewer_uuid: Option<Uuid>,
        via_gate: bool,
    ) -> GovResult<ResumeOutcome> {
        let identity = self.resolver.require_identity(uuid).await?;

        // Idempotent: resuming an active agent is a successful no-op.
        if identity.status == AgentStatus::Active {
            return Ok(ResumeOutcome {
                agent_uuid: uuid,
                status: AgentStatus::Active,
                already_active: true,
                applied_conditions: self.conditions_for(uuid),
                reviewer_uuid,
            });
        }
        if identity.status != AgentStatus::Paused {
            return Err(GovError::new(
                ErrorCode::Conflict,
                format!("cannot resume an {} agent", identity.status.as_str()),
            ));
        }

        let handle = self.acquire(uuid).await?;
        let result = self
            .resume_locked(uuid, conditions, reviewer_uuid, via_gate)
            .await;
        let _ = handle.release().await;
        result
    }

    /// Resume for callers that already hold the agent's write-lock (the
    /// dialectic machine's session lock includes it).
    pub async fn resume_holding_lock(
        &self,
        uuid: Uuid,
        conditions: Vec<ProposedCondition>,
        reviewer_uuid: Option<Uuid>,
        via_gate: bool,
    ) -> GovResult<ResumeOutcome> {
        let identity = self.resolver.require_identity(uuid).await?;
        if identity.status == AgentStatus::Active {
            return Ok(ResumeOutcome {
                agent_uuid: uuid,
                status: AgentStatus::Active,
                already_active: true,
                applied_conditions: self.conditions_for(uuid),
                reviewer_uuid,
            });
        }
        if identity.status != AgentStatus::Paused {
            return Err(GovError::new(
                ErrorCode::Conflict,
                format!("cannot resume an {} agent", identity.status.as_str()),
            ));
        }
        self.resume_locked(uuid, conditions, reviewer_uuid, via_gate)
            .await
    }

    async fn resume_locked(
        &self,
        uuid: Uuid,
        conditions: Vec<ProposedCondition>,
        reviewer_uuid: Option<Uuid>,
        via_gate: bool,
    ) -> GovResult<ResumeOutcome> {
        let state = self
            .store
            .load_state(uuid)
            .await?
            .unwrap_or_else(|| EisvState::genesis(&self.params));

        let safe = if via_gate {
            state.coherence > MIN_COHERENCE_THRESHOLD && state.risk_score < MAX_RISK_THRESHOLD
        } else {
            self.is_safe(uuid, &state)
        };
        if !safe {
            return Err(GovError::new(
                ErrorCode::Unsafe,
                format!(
                    "resume predicate failed: coherence {:.3}, risk {:.3}, |V| {:.3}",
                    state.coherence,
                    state.risk_score,
                    state.v.abs()
                ),
            )
            .with_details(json!({
                "coherence": state.coherence,
                "risk_score": state.risk_score,
                "void": state.v,
            }))
            .with_recovery(["self_recovery_review", "request_review"]));
        }

        let applied = self.install_conditions(uuid, conditions);
        self.resolver
            .transition_status(uuid, AgentStatus::Active, "resume")
            .await?;
        self.telemetry.incr("agents.resumed");
        self.audit
            .append(
                AuditEvent::new(reviewer_uuid.unwrap_or(uuid), "agent.resumed")
                    .subject(uuid)
                    .details(json!({
                        "via_gate": via_gate,
                        "conditions": applied,
                        "reviewer": reviewer_uuid,
                    })),
            )
            .await?;

        Ok(ResumeOutcome {
            agent_uuid: uuid,
            status: AgentStatus::Active,
            already_active: false,
            applied_conditions: applied,
            reviewer_uuid,
        })
    }

    /// Install reviewer conditions, clamping thresholds to the hard
    /// bounds.
    fn install_conditions(
        &self,
        uuid: Uuid,
        conditions: Vec<ProposedCondition>,
    ) -> AppliedConditions {
        let mut applied = self.conditions_for(uuid);
        for condition in conditions {
            match (condition.kind.as_str(), condition.key.as_str()) {
                ("threshold", "risk_threshold") => {
                    if let Some(value) = condition.numeric_value() {
                        applied.risk_threshold = value.min(MAX_RISK_THRESHOLD);
                    }
                }
                ("threshold", "coherence_threshold") => {
                    if let Some(value) = condition.numeric_value() {
                        applied.coherence_floor = value.max(MIN_COHERENCE_THRESHOLD);
                    }
                }
                _ => {
                    if !applied.limits.contains(&condition) {
                        applied.limits.push(condition);
                    }
                }
            }
        }
        self.conditions.insert(uuid, applied.clone());
        applied
    }

    /// Explicit lifecycle transition under the agent's write-lock.
    pub async fn lifecycle(
        &self,
        uuid: Uuid,
        next: AgentStatus,
        reason: &str,
    ) -> GovResult<()> {
        let handle = self.acquire(uuid).await?;
        let result = self.resolver.transition_status(uuid, next, reason).await;
        let _ = handle.release().await;
        if matches!(next, AgentStatus::Archived | AgentStatus::Deleted) {
            self.patterns.forget(uuid);
        }
        result.map(|_| ())
    }

    /// History points for the observability surface.
    pub async fn history(&self, uuid: Uuid, limit: usize) -> GovResult<Vec<eisv_dynamics::HistoryPoint>> {
        self.resolver.require_identity(uuid).await?;
        self.store.load_state_history(uuid, limit).await
    }

    pub fn params(&self) -> &DynamicsParams {
        &self.params
    }
}

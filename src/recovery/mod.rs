//! Stuck-agent detection and auto-recovery
//!
//! One long-running task. Every tick it sweeps dialectic timeouts, then
//! classifies each non-archived agent by margin age, activity age, and
//! cognitive-pattern signals, and recovers the stuck ones: a safe resume
//! when the predicate holds, a dialectic session otherwise.

pub mod patterns;

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use eisv_dynamics::{EisvState, Margin};

use crate::audit::{AuditEvent, AuditLog};
use crate::dialectic::DialecticMachine;
use crate::engine::GovernanceEngine;
use crate::error::{ErrorCode, GovResult};
use crate::identity::{AgentIdentity, AgentStatus};
use crate::knowledge::{KnowledgeService, NoteKind, NoteSeverity};
use crate::observe::Telemetry;
use crate::store::{IdentityFilter, Store};

pub use patterns::PatternTracker;

/// Delay before the first sweep.
pub const WARMUP: Duration = Duration::from_secs(10);

const CRITICAL_MARGIN_AGE: i64 = 5 * 60;
const TIGHT_MARGIN_AGE: i64 = 15 * 60;
const ACTIVITY_AGE: i64 = 30 * 60;

/// Why an agent was classified as stuck. Rules are ordered; the first
/// match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StuckCause {
    CriticalMarginTimeout,
    TightMarginTimeout,
    ActivityTimeout,
    CognitiveLoop(String),
    TimeBoxExceeded,
}

impl StuckCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            StuckCause::CriticalMarginTimeout => "critical_margin_timeout",
            StuckCause::TightMarginTimeout => "tight_margin_timeout",
            StuckCause::ActivityTimeout => "activity_timeout",
            StuckCause::CognitiveLoop(_) => "cognitive_loop",
            StuckCause::TimeBoxExceeded => "time_box_exceeded",
        }
    }
}

pub struct StuckDetector {
    store: Arc<dyn Store>,
    engine: Arc<GovernanceEngine>,
    machine: Arc<DialecticMachine>,
    audit: Arc<AuditLog>,
    telemetry: Arc<Telemetry>,
    patterns: Arc<PatternTracker>,
    knowledge: Arc<KnowledgeService>,
    interval: Duration,
}

impl StuckDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<GovernanceEngine>,
        machine: Arc<DialecticMachine>,
        audit: Arc<AuditLog>,
        telemetry: Arc<Telemetry>,
        patterns: Arc<PatternTracker>,
        knowledge: Arc<KnowledgeService>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            machine,
            audit,
            telemetry,
            patterns,
            knowledge,
            interval,
        }
    }

    /// Run until the shutdown signal flips. Ticks never overlap: a slow
    /// tick delays the next one.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(WARMUP) => {}
            _ = shutdown.changed() => {
                tracing::info!("stuck detector shutting down before warmup");
                return;
            }
        }

        loop {
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "stuck-detector tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    tracing::info!("stuck detector shutting down");
                    return;
                }
            }
        }
    }

    /// One full sweep over the fleet.
    pub async fn tick(&self) -> GovResult<()> {
        self.telemetry.incr("recovery.ticks");

        match self.machine.sweep_timeouts().await {
            Ok(0) => {}
            Ok(cancelled) => {
                tracing::info!(cancelled, "dialectic sessions timed out");
            }
            Err(err) => tracing::warn!(error = %err, "session timeout sweep failed"),
        }

        let identities = self
            .store
            .list_identities(&IdentityFilter::default())
            .await?;
        let now = Utc::now();

        for identity in identities {
            if matches!(
                identity.status,
                AgentStatus::Archived | AgentStatus::Deleted
            ) {
                continue;
            }
            // Autonomous creatures govern themselves.
            if identity.is_autonomous() {
                continue;
            }

            let state = match self.store.load_state(identity.uuid).await {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(uuid = %identity.uuid, error = %err, "state load failed");
                    continue;
                }
            };

            let Some(cause) = self.classify(&identity, state.as_ref(), now) else {
                continue;
            };

            tracing::info!(
                uuid = %identity.uuid,
                cause = cause.as_str(),
                "stuck agent detected"
            );
            self.telemetry
                .incr(&format!("recovery.detected.{}", cause.as_str()));

            if let Err(err) = self.recover(&identity, state.as_ref(), &cause).await {
                // One agent's failure must not abort the tick.
                tracing::error!(uuid = %identity.uuid, error = %err, "recovery failed");
            }
        }
        Ok(())
    }

    /// Ordered detection rules; first match wins.
    fn classify(
        &self,
        identity: &AgentIdentity,
        state: Option<&EisvState>,
        now: DateTime<Utc>,
    ) -> Option<StuckCause> {
        let last_update = state.map(|s| s.updated_at).unwrap_or(identity.last_update_at);
        let age = (now - last_update).num_seconds();

        if let Some(state) = state {
            if state.margin == Margin::Critical && age > CRITICAL_MARGIN_AGE {
                return Some(StuckCause::CriticalMarginTimeout);
            }
            if state.margin == Margin::Tight && age > TIGHT_MARGIN_AGE {
                return Some(StuckCause::TightMarginTimeout);
            }
        }
        if age > ACTIVITY_AGE {
            return Some(StuckCause::ActivityTimeout);
        }
        if let Some(fingerprint) = self.patterns.detect_loop(identity.uuid) {
            return Some(StuckCause::CognitiveLoop(fingerprint));
        }
        if self.patterns.time_box_exceeded(identity.uuid) {
            return Some(StuckCause::TimeBoxExceeded);
        }
        None
    }

    /// Recovery action for one stuck agent.
    async fn recover(
        &self,
        identity: &AgentIdentity,
        state: Option<&EisvState>,
        cause: &StuckCause,
    ) -> GovResult<()> {
        let uuid = identity.uuid;
        let safe = state.map_or(true, |s| self.engine.is_safe(uuid, s));

        if safe {
            match identity.status {
                AgentStatus::Paused => {
                    self.engine.resume(uuid, vec![], None, false).await?;
                }
                _ => {
                    // Already active; the detection itself is the signal.
                }
            }
            self.audit
                .append(
                    AuditEvent::new(uuid, "recovery.auto_resumed")
                        .subject(uuid)
                        .tags(["auto-recovery", "stuck-agent"])
                        .details(json!({ "cause": cause.as_str() })),
                )
                .await?;
            if let Err(err) = self
                .knowledge
                .store_note(
                    uuid,
                    format!("auto-recovery after {}", cause.as_str()),
                    Some(format!(
                        "agent {} met the safety predicate and was resumed directly",
                        identity.agent_id
                    )),
                    NoteKind::Pattern,
                    NoteSeverity::Low,
                    vec!["auto-recovery".to_string(), "stuck-agent".to_string()],
                    None,
                )
                .await
            {
                tracing::debug!(uuid = %uuid, error = %err, "recovery note not stored");
            }
            self.telemetry.incr("recovery.auto_resumed");
            return Ok(());
        }

        // Unsafe: leave any open session to run its course, otherwise open
        // one.
        if self.store.open_session_for_agent(uuid).await?.is_some() {
            tracing::debug!(uuid = %uuid, "dialectic session already open, leaving it");
            return Ok(());
        }

        if identity.status == AgentStatus::Active {
            self.engine
                .lifecycle(uuid, AgentStatus::Paused, "stuck and unsafe")
                .await?;
        }

        match self
            .machine
            .request_review(uuid, &format!("stuck: {}", cause.as_str()))
            .await
        {
            Ok(session) => {
                self.audit
                    .append(
                        AuditEvent::new(uuid, "recovery.dialectic_opened")
                            .subject(session.reviewer_agent_uuid)
                            .tags(["dialectic-trigger", "stuck-agent", "unsafe-recovery"])
                            .details(json!({
                                "cause": cause.as_str(),
                                "session_id": session.session_id,
                            })),
                    )
                    .await?;
                self.telemetry.incr("recovery.dialectic_opened");
                Ok(())
            }
            Err(err) if err.code == ErrorCode::NoReviewer => {
                // Nothing to review with; the agent stays paused for the
                // operator.
                self.audit
                    .append(
                        AuditEvent::new(uuid, "recovery.no_reviewer")
                            .subject(uuid)
                            .details(json!({ "cause": cause.as_str() })),
                    )
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Convenience spawn mirroring the other long-running services.
pub fn spawn_detector(
    detector: Arc<StuckDetector>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(detector.run(shutdown))
}

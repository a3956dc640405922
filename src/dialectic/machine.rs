//! The dialectic state machine
//!
//! Owns session records. Every mutation runs under the session lock: the
//! paused agent's and reviewer's write-locks acquired in uuid-lexicographic
//! order so two sessions sharing a participant cannot deadlock.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog};
use crate::engine::GovernanceEngine;
use crate::error::{ErrorCode, GovError, GovResult};
use crate::identity::{AgentStatus, IdentityResolver};
use crate::lock::{LockHandle, NamedLock};
use crate::observe::Telemetry;
use crate::store::{SessionFilter, Store};
use crate::summarize::{SUMMARIZER_DEADLINE, Summarizer};

use super::{
    DialecticMessage, DialecticPhase, DialecticSession, MAX_SYNTHESIS_ATTEMPTS, MessageKind,
    ProposedCondition, REOPEN_COOLDOWN_SECS, SessionResolution, SessionStatus,
    convergence::evaluate_convergence, reviewer::select_reviewer, safety::SafetyGate,
    signing::verify_signature,
};

/// Result of a synthesis submission: the session after the attempt, plus
/// the reasons when the attempt did not resolve it.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub session: DialecticSession,
    pub resolved: bool,
    pub reasons: Vec<String>,
}

pub struct DialecticMachine {
    store: Arc<dyn Store>,
    resolver: Arc<IdentityResolver>,
    engine: Arc<GovernanceEngine>,
    audit: Arc<AuditLog>,
    telemetry: Arc<Telemetry>,
    locks: Arc<dyn NamedLock>,
    summarizer: Arc<dyn Summarizer>,
    gate: SafetyGate,
    lock_ttl: Duration,
}

impl DialecticMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<IdentityResolver>,
        engine: Arc<GovernanceEngine>,
        audit: Arc<AuditLog>,
        telemetry: Arc<Telemetry>,
        locks: Arc<dyn NamedLock>,
        summarizer: Arc<dyn Summarizer>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            engine,
            audit,
            telemetry,
            locks,
            summarizer,
            gate: SafetyGate::new(),
            lock_ttl,
        }
    }

    /// Both participants' write-locks, uuid-lexicographic order.
    async fn session_locks(
        &self,
        session: &DialecticSession,
    ) -> GovResult<(Box<dyn LockHandle>, Box<dyn LockHandle>)> {
        let mut uuids = [session.paused_agent_uuid, session.reviewer_agent_uuid];
        uuids.sort();
        let first = self
            .locks
            .acquire(&format!("agent:{}", uuids[0]), self.lock_ttl)
            .await?;
        let second = match self
            .locks
            .acquire(&format!("agent:{}", uuids[1]), self.lock_ttl)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                let _ = first.release().await;
                return Err(err);
            }
        };
        Ok((first, second))
    }

    /// Open a session for a paused agent, selecting the reviewer by
    /// authority score.
    pub async fn request_review(
        &self,
        paused_uuid: Uuid,
        reason: &str,
    ) -> GovResult<DialecticSession> {
        let paused = self.resolver.require_identity(paused_uuid).await?;
        if paused.status != AgentStatus::Paused {
            return Err(GovError::new(
                ErrorCode::Conflict,
                format!(
                    "dialectic review requires a paused agent; status is {}",
                    paused.status.as_str()
                ),
            ));
        }

        if let Some(open) = self.store.open_session_for_agent(paused_uuid).await? {
            return Err(GovError::new(
                ErrorCode::AlreadyOpen,
                format!("agent already has an open session: {}", open.session_id),
            )
            .with_details(json!({ "session_id": open.session_id })));
        }

        // Conservative-default cooldown: no reopening for an hour.
        let recent = self
            .store
            .list_sessions(&SessionFilter {
                participant: Some(paused_uuid),
                limit: Some(5),
                ..SessionFilter::default()
            })
            .await?;
        let now = Utc::now();
        for session in &recent {
            if let Some(resolution) = &session.resolution {
                if resolution.resolution_type == "conservative_default"
                    && (now - session.updated_at).num_seconds() < REOPEN_COOLDOWN_SECS
                {
                    return Err(GovError::new(
                        ErrorCode::Conflict,
                        "conservative default is in cooldown; retry later",
                    )
                    .with_details(json!({ "cooldown_until":
                        session.updated_at + chrono::Duration::seconds(REOPEN_COOLDOWN_SECS) })));
                }
            }
        }

        let reviewer = select_reviewer(&self.store, &paused).await?;
        let snapshot = self
            .store
            .load_state(paused_uuid)
            .await?
            .unwrap_or_else(|| eisv_dynamics::EisvState::genesis(self.engine.params()));

        let session = DialecticSession::open(
            paused_uuid,
            reviewer.uuid,
            reason.to_string(),
            snapshot,
        );
        self.store.insert_session(&session).await?;
        self.telemetry.incr("dialectic.opened");
        self.audit
            .append(
                AuditEvent::new(paused_uuid, "dialectic.opened")
                    .subject(reviewer.uuid)
                    .tags(["dialectic-trigger", "stuck-agent", "unsafe-recovery"])
                    .details(json!({
                        "session_id": session.session_id,
                        "reviewer": reviewer.uuid,
                        "reviewer_score": reviewer.score,
                        "reason": reason,
                    })),
            )
            .await?;
        tracing::info!(
            session = %session.session_id,
            paused = %paused_uuid,
            reviewer = %reviewer.uuid,
            "dialectic session opened"
        );
        Ok(session)
    }

    /// Load, phase-check, role-check, and signature-check one submission.
    async fn admit_message(
        &self,
        session: &DialecticSession,
        author_uuid: Uuid,
        message: &DialecticMessage,
        expected_phase: DialecticPhase,
        expected_kind: MessageKind,
    ) -> GovResult<()> {
        if session.phase != expected_phase {
            return Err(GovError::new(
                ErrorCode::WrongPhase,
                format!(
                    "session is in phase {}, expected {}",
                    session.phase.as_str(),
                    expected_phase.as_str()
                ),
            ));
        }

        let allowed = match expected_kind {
            MessageKind::Thesis => author_uuid == session.paused_agent_uuid,
            MessageKind::Antithesis => author_uuid == session.reviewer_agent_uuid,
            MessageKind::Synthesis => {
                author_uuid == session.paused_agent_uuid
                    || author_uuid == session.reviewer_agent_uuid
            }
        };
        if !allowed {
            return Err(GovError::new(
                ErrorCode::PermissionDenied,
                "author is not the party this phase expects",
            ));
        }
        if message.author_uuid != author_uuid {
            return Err(GovError::new(
                ErrorCode::SessionMismatch,
                "message author does not match the authenticated identity",
            ));
        }
        if message.kind != expected_kind {
            return Err(GovError::invalid_type("kind", expected_kind_name(expected_kind)));
        }
        let expected_seq = session.messages.len() as u32 + 1;
        if message.seq != expected_seq {
            return Err(GovError::out_of_range("seq", message.seq).with_details(json!({
                "expected": expected_seq,
                "actual": message.seq,
            })));
        }

        let author = self.resolver.require_identity(author_uuid).await?;
        if !verify_signature(message, &author.api_key_hash) {
            return Err(GovError::auth_failed());
        }
        Ok(())
    }

    pub async fn submit_thesis(
        &self,
        session_id: Uuid,
        author_uuid: Uuid,
        message: DialecticMessage,
    ) -> GovResult<DialecticSession> {
        let session = self.require_session(session_id).await?;
        let locks = self.session_locks(&session).await?;
        let result = self
            .submit_simple(session_id, author_uuid, message, DialecticPhase::Thesis)
            .await;
        release_both(locks).await;
        result
    }

    pub async fn submit_antithesis(
        &self,
        session_id: Uuid,
        author_uuid: Uuid,
        message: DialecticMessage,
    ) -> GovResult<DialecticSession> {
        let session = self.require_session(session_id).await?;
        let locks = self.session_locks(&session).await?;
        let result = self
            .submit_simple(session_id, author_uuid, message, DialecticPhase::Antithesis)
            .await;
        release_both(locks).await;
        result
    }

    async fn submit_simple(
        &self,
        session_id: Uuid,
        author_uuid: Uuid,
        message: DialecticMessage,
        phase: DialecticPhase,
    ) -> GovResult<DialecticSession> {
        let mut session = self.require_session(session_id).await?;
        let kind = match phase {
            DialecticPhase::Thesis => MessageKind::Thesis,
            _ => MessageKind::Antithesis,
        };
        self.admit_message(&session, author_uuid, &message, phase, kind)
            .await?;

        session.messages.push(message);
        session.phase = match phase {
            DialecticPhase::Thesis => DialecticPhase::Antithesis,
            _ => DialecticPhase::Synthesis,
        };
        session.updated_at = Utc::now();
        self.store.update_session(&session).await?;
        Ok(session)
    }

    /// Submit a synthesis and run convergence, the Safety Gate, and, on
    /// acceptance, one-shot resolution.
    pub async fn submit_synthesis(
        &self,
        session_id: Uuid,
        author_uuid: Uuid,
        message: DialecticMessage,
        human_inputs: Option<String>,
    ) -> GovResult<SynthesisOutcome> {
        let session = self.require_session(session_id).await?;
        let locks = self.session_locks(&session).await?;
        let result = self
            .submit_synthesis_locked(session_id, author_uuid, message, human_inputs)
            .await;
        release_both(locks).await;
        result
    }

    async fn submit_synthesis_locked(
        &self,
        session_id: Uuid,
        author_uuid: Uuid,
        mut message: DialecticMessage,
        human_inputs: Option<String>,
    ) -> GovResult<SynthesisOutcome> {
        let mut session = self.require_session(session_id).await?;
        self.admit_message(
            &session,
            author_uuid,
            &message,
            DialecticPhase::Synthesis,
            MessageKind::Synthesis,
        )
        .await?;

        // Optional human paragraph: structured through the summarizer when
        // one is configured, verbatim into concerns otherwise. Signature
        // verification already happened against the author's encoding.
        if let Some(text) = human_inputs {
            let summarized =
                tokio::time::timeout(SUMMARIZER_DEADLINE, self.summarizer.summarize(&text)).await;
            match summarized {
                Ok(Some(summary)) => {
                    match serde_json::from_str::<Vec<ProposedCondition>>(&summary) {
                        Ok(mut conditions) => message.proposed_conditions.append(&mut conditions),
                        Err(_) => message.concerns.push(text),
                    }
                }
                _ => message.concerns.push(text),
            }
        }

        // Hard limits first. A forbidden pattern terminates the session;
        // lesser violations only burn this attempt.
        let root_cause_violation = self.gate.check_root_cause(&message.root_cause);
        let report = self.gate.check_conditions(&message.proposed_conditions);
        if !report.forbidden.is_empty() {
            session.messages.push(message);
            self.fail_session(&mut session, "safety_violation", report.forbidden.clone())
                .await?;
            return Ok(SynthesisOutcome {
                session,
                resolved: false,
                reasons: report.forbidden,
            });
        }

        session.messages.push(message.clone());
        session.synthesis_attempts += 1;
        session.updated_at = Utc::now();

        let mut reasons: Vec<String> = report.violations.clone();
        if let Some(violation) = root_cause_violation {
            reasons.push(violation);
        }

        if reasons.is_empty() {
            let thesis = session
                .message_of_kind(MessageKind::Thesis)
                .cloned()
                .ok_or_else(|| GovError::internal("synthesis phase without a thesis"))?;
            let antithesis = session
                .message_of_kind(MessageKind::Antithesis)
                .cloned()
                .ok_or_else(|| GovError::internal("synthesis phase without an antithesis"))?;
            let verdict = evaluate_convergence(&thesis, &antithesis, &message);
            reasons.extend(verdict.reasons.clone());

            if verdict.accepted {
                return self.resolve_and_resume(session, message).await;
            }
        }

        // Convergence failed: the session stays in synthesis until the
        // attempts are exhausted, then fails conservatively.
        if session.synthesis_attempts >= MAX_SYNTHESIS_ATTEMPTS {
            self.fail_session(&mut session, "conservative_default", reasons.clone())
                .await?;
            self.telemetry.incr("dialectic.conservative_default");
        } else {
            self.store.update_session(&session).await?;
        }
        Ok(SynthesisOutcome {
            session,
            resolved: false,
            reasons,
        })
    }

    /// One-shot resolution: re-gate, resume through the engine, persist,
    /// audit.
    async fn resolve_and_resume(
        &self,
        mut session: DialecticSession,
        synthesis: DialecticMessage,
    ) -> GovResult<SynthesisOutcome> {
        let report = self.gate.check_conditions(&synthesis.proposed_conditions);
        if !report.is_clean() {
            let reasons = report.all();
            self.fail_session(&mut session, "safety_violation", reasons.clone())
                .await?;
            return Ok(SynthesisOutcome {
                session,
                resolved: false,
                reasons,
            });
        }

        let resume = self
            .engine
            .resume_holding_lock(
                session.paused_agent_uuid,
                synthesis.proposed_conditions.clone(),
                Some(session.reviewer_agent_uuid),
                true,
            )
            .await;

        match resume {
            Ok(_) => {
                session.phase = DialecticPhase::Resolved;
                session.status = SessionStatus::Resolved;
                session.resolution = Some(SessionResolution {
                    resolution_type: "synthesis".to_string(),
                    conditions: synthesis.proposed_conditions.clone(),
                    reason: None,
                });
                session.updated_at = Utc::now();
                self.store.update_session(&session).await?;
                self.telemetry.incr("dialectic.resolved");
                self.audit
                    .append(
                        AuditEvent::new(session.reviewer_agent_uuid, "dialectic.resolved")
                            .subject(session.paused_agent_uuid)
                            .details(json!({
                                "session_id": session.session_id,
                                "conditions": synthesis.proposed_conditions,
                            })),
                    )
                    .await?;
                Ok(SynthesisOutcome {
                    session,
                    resolved: true,
                    reasons: vec![],
                })
            }
            Err(err) if err.code == ErrorCode::Unsafe => {
                // Post-gate unsafety is terminal; no retry.
                self.fail_session(
                    &mut session,
                    "unsafe_post_gate",
                    vec![err.message.clone()],
                )
                .await?;
                Ok(SynthesisOutcome {
                    session,
                    resolved: false,
                    reasons: vec![err.message],
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn fail_session(
        &self,
        session: &mut DialecticSession,
        resolution_type: &str,
        reasons: Vec<String>,
    ) -> GovResult<()> {
        session.phase = DialecticPhase::Failed;
        session.status = SessionStatus::Failed;
        session.resolution = Some(SessionResolution {
            resolution_type: resolution_type.to_string(),
            conditions: vec![],
            reason: Some(reasons.join("; ")),
        });
        session.updated_at = Utc::now();
        self.store.update_session(session).await?;
        self.telemetry.incr("dialectic.failed");
        self.audit
            .append(
                AuditEvent::new(session.paused_agent_uuid, "dialectic.failed")
                    .subject(session.reviewer_agent_uuid)
                    .details(json!({
                        "session_id": session.session_id,
                        "resolution_type": resolution_type,
                        "reasons": reasons,
                    })),
            )
            .await?;
        tracing::warn!(
            session = %session.session_id,
            resolution_type,
            "dialectic session failed"
        );
        Ok(())
    }

    /// Any party may cancel a non-terminal session.
    pub async fn cancel(
        &self,
        session_id: Uuid,
        actor_uuid: Uuid,
        reason: &str,
    ) -> GovResult<DialecticSession> {
        let session = self.require_session(session_id).await?;
        let locks = self.session_locks(&session).await?;
        let result = self.cancel_locked(session_id, actor_uuid, reason).await;
        release_both(locks).await;
        result
    }

    async fn cancel_locked(
        &self,
        session_id: Uuid,
        actor_uuid: Uuid,
        reason: &str,
    ) -> GovResult<DialecticSession> {
        let mut session = self.require_session(session_id).await?;
        if session.phase.is_terminal() {
            return Err(GovError::new(
                ErrorCode::WrongPhase,
                "session is already terminal",
            ));
        }
        session.phase = DialecticPhase::Cancelled;
        session.status = SessionStatus::Cancelled;
        session.resolution = Some(SessionResolution {
            resolution_type: "cancelled".to_string(),
            conditions: vec![],
            reason: Some(reason.to_string()),
        });
        session.updated_at = Utc::now();
        self.store.update_session(&session).await?;
        self.telemetry.incr("dialectic.cancelled");
        self.audit
            .append(
                AuditEvent::new(actor_uuid, "dialectic.cancelled")
                    .subject(session.paused_agent_uuid)
                    .details(json!({ "session_id": session_id, "reason": reason })),
            )
            .await?;
        Ok(session)
    }

    /// Cancel every active session past the progress timeout. Returns how
    /// many were cancelled; the recovery loop calls this each tick.
    pub async fn sweep_timeouts(&self) -> GovResult<usize> {
        let active = self
            .store
            .list_sessions(&SessionFilter {
                active_only: true,
                ..SessionFilter::default()
            })
            .await?;
        let now = Utc::now();
        let mut cancelled = 0;
        for session in active {
            if session.timed_out(now) {
                self.cancel(session.session_id, session.paused_agent_uuid, "timeout")
                    .await?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub async fn get(&self, session_id: Uuid) -> GovResult<DialecticSession> {
        self.require_session(session_id).await
    }

    pub async fn list(&self, filter: SessionFilter) -> GovResult<Vec<DialecticSession>> {
        self.store.list_sessions(&filter).await
    }

    async fn require_session(&self, session_id: Uuid) -> GovResult<DialecticSession> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| GovError::session_not_found(session_id))
    }
}

fn expected_kind_name(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Thesis => "thesis message",
        MessageKind::Antithesis => "antithesis message",
        MessageKind::Synthesis => "synthesis message",
    }
}

async fn release_both(locks: (Box<dyn LockHandle>, Box<dyn LockHandle>)) {
    let _ = locks.0.release().await;
    let _ = locks.1.release().await;
}

//! Operation handlers and the registry they populate

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::dialectic::{DialecticMessage, ProposedCondition};
use crate::engine::UpdateRequest;
use crate::error::{ErrorCode, GovError, GovResult};
use crate::identity::{AgentStatus, IdentityInit, ResolveRequest, Resolution};
use crate::knowledge::{NoteFilter, NoteKind, NoteSeverity, NoteStatus};
use crate::store::{IdentityFilter, SessionFilter};

use super::{CallerContext, DEFAULT_OP_TIMEOUT, Operation, OperationRegistry, Services};

fn uuid_arg(args: &Value, key: &str) -> GovResult<Uuid> {
    let raw = args
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| GovError::missing_parameter(key))?;
    Uuid::parse_str(raw).map_err(|_| GovError::invalid_type(key, "uuid string"))
}

fn str_arg(args: &Value, key: &str) -> GovResult<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| GovError::missing_parameter(key))
}

fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn opt_bool(args: &Value, key: &str) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn opt_usize(args: &Value, key: &str) -> Option<usize> {
    args.get(key).and_then(|v| v.as_u64()).map(|n| n as usize)
}

fn string_vec(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn conditions_arg(args: &Value, key: &str) -> GovResult<Vec<ProposedCondition>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(vec![]),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|_| GovError::invalid_type(key, "array of condition records")),
    }
}

fn message_arg(args: &Value) -> GovResult<DialecticMessage> {
    let value = args
        .get("message")
        .ok_or_else(|| GovError::missing_parameter("message"))?;
    serde_json::from_value(value.clone())
        .map_err(|e| GovError::invalid_type("message", "dialectic message").with_details(json!({
            "parse_error": e.to_string(),
        })))
}

fn state_summary(state: &eisv_dynamics::EisvState) -> Value {
    json!({
        "e": state.e,
        "i": state.i,
        "s": state.s,
        "v": state.v,
        "coherence": state.coherence,
        "risk_score": state.risk_score,
        "lambda1": state.lambda1,
        "regime": state.regime,
        "margin": state.margin,
        "total_updates": state.total_updates,
        "lambda1_skip_count": state.lambda1_skip_count,
        "locked_persistence_count": state.locked_persistence_count,
        "updated_at": state.updated_at,
    })
}

fn resolution_response(resolution: Resolution) -> Value {
    match resolution {
        Resolution::Resolved { identity } => json!({
            "outcome": "resolved",
            "identity": identity.public_view(),
        }),
        Resolution::Created {
            identity,
            api_key_plaintext,
        } => json!({
            "outcome": "created",
            "identity": identity.public_view(),
            // Returned exactly once; only the hash is stored.
            "api_key": api_key_plaintext,
        }),
        Resolution::AmbiguousExisting { candidate } => json!({
            "outcome": "ambiguous_existing",
            "error_code": ErrorCode::AmbiguousExisting,
            "candidate": candidate,
        }),
    }
}

// --- identity ---

async fn onboard(services: Arc<Services>, _ctx: CallerContext, args: Value) -> GovResult<Value> {
    let model = opt_str(&args, "model");
    let resume = opt_bool(&args, "resume");
    let force_new = opt_bool(&args, "force_new");

    let resolution = if let Some(fingerprint) = opt_str(&args, "fingerprint") {
        services
            .resolver
            .resolve(ResolveRequest::Fingerprint {
                fingerprint,
                resume,
                force_new,
                model,
            })
            .await?
    } else if let Some(display_name) = opt_str(&args, "display_name") {
        services
            .resolver
            .resolve(ResolveRequest::DisplayName {
                display_name,
                resume,
                force_new,
                model,
            })
            .await?
    } else {
        let (identity, api_key_plaintext) = services
            .resolver
            .create(IdentityInit {
                model,
                display_name: None,
                transport_fingerprint: None,
                tags: string_vec(&args, "tags"),
            })
            .await?;
        Resolution::Created {
            identity,
            api_key_plaintext,
        }
    };

    if let Some(session_key) = opt_str(&args, "session_key") {
        match &resolution {
            Resolution::Resolved { identity } | Resolution::Created { identity, .. } => {
                services
                    .resolver
                    .bind_session(&session_key, identity.uuid)
                    .await?;
            }
            Resolution::AmbiguousExisting { .. } => {}
        }
    }
    Ok(resolution_response(resolution))
}

async fn identity(_services: Arc<Services>, ctx: CallerContext, _args: Value) -> GovResult<Value> {
    let actor = ctx.require_actor()?;
    Ok(json!({
        "identity": actor.public_view(),
        "genesis_captured": actor.genesis_signature.is_some(),
    }))
}

async fn set_display_name(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.write_target(&args)?;
    let name = opt_str(&args, "display_name");
    let identity = services.resolver.set_display_name(target, name).await?;
    Ok(identity.public_view())
}

async fn rotate_key(services: Arc<Services>, ctx: CallerContext, args: Value) -> GovResult<Value> {
    let actor = ctx.require_actor()?;
    let presented = opt_str(&args, "api_key");
    let plaintext = services
        .resolver
        .rotate_key(actor.uuid, presented.as_deref(), false)
        .await?;
    Ok(json!({ "api_key": plaintext }))
}

// --- governance ---

fn update_request(args: &Value) -> GovResult<UpdateRequest> {
    serde_json::from_value(args.clone()).map_err(|e| {
        GovError::invalid_type("update", "update request").with_details(json!({
            "parse_error": e.to_string(),
        }))
    })
}

async fn process_update(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.write_target(&args)?;
    let request = update_request(&args)?;
    let result = services.engine.apply_update(target, request).await?;
    Ok(serde_json::to_value(result)?)
}

async fn simulate_update(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.read_target(&args)?;
    let request = update_request(&args)?;
    let result = services.engine.simulate_update(target, request).await?;
    Ok(serde_json::to_value(result)?)
}

async fn get_metrics(services: Arc<Services>, ctx: CallerContext, args: Value) -> GovResult<Value> {
    let target = ctx.read_target(&args)?;
    let (state, conditions) = services.engine.snapshot(target).await?;
    Ok(json!({
        "agent_uuid": target,
        "state": state.as_ref().map(state_summary),
        "conditions": conditions,
    }))
}

async fn get_history(services: Arc<Services>, ctx: CallerContext, args: Value) -> GovResult<Value> {
    let target = ctx.read_target(&args)?;
    let limit = opt_usize(&args, "limit").unwrap_or(64);
    let points = services.engine.history(target, limit).await?;
    Ok(json!({ "agent_uuid": target, "history": points }))
}

// --- recovery ---

async fn resume_if_safe(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.write_target(&args)?;
    let outcome = services.engine.resume(target, vec![], None, false).await?;
    Ok(serde_json::to_value(outcome)?)
}

async fn self_recovery_review(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.read_target(&args)?;
    let (state, conditions) = services.engine.snapshot(target).await?;
    let report = match &state {
        Some(state) => {
            let safe = services.engine.is_safe(target, state);
            json!({
                "safe": safe,
                "coherence": state.coherence,
                "risk_score": state.risk_score,
                "void": state.v,
                "thresholds": conditions,
                "suggestion": if safe { "resume_if_safe" } else { "request_review" },
            })
        }
        None => json!({
            "safe": true,
            "suggestion": "resume_if_safe",
        }),
    };
    Ok(report)
}

async fn check_recovery_options(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.read_target(&args)?;
    let identity = services.resolver.require_identity(target).await?;
    let open_session = services.store.open_session_for_agent(target).await?;
    let (state, _) = services.engine.snapshot(target).await?;
    let safe = state
        .as_ref()
        .map(|s| services.engine.is_safe(target, s))
        .unwrap_or(true);

    let mut options = Vec::new();
    if identity.status == AgentStatus::Paused {
        if safe {
            options.push("resume_if_safe");
        }
        if open_session.is_none() {
            options.push("request_review");
        }
        options.push("operator_resume");
    }
    Ok(json!({
        "status": identity.status,
        "safe": safe,
        "open_session": open_session.map(|s| s.session_id),
        "options": options,
    }))
}

async fn operator_resume(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    // Administrative lifecycle primitive: the operator resumes another
    // agent, so the target comes from the arguments.
    let actor = ctx.require_actor()?;
    let target = uuid_arg(&args, "target_uuid")?;
    let conditions = conditions_arg(&args, "conditions")?;
    let outcome = services
        .engine
        .resume(target, conditions, Some(actor.uuid), true)
        .await?;
    Ok(serde_json::to_value(outcome)?)
}

// --- dialectic ---

async fn request_review(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.write_target(&args)?;
    let reason = opt_str(&args, "reason").unwrap_or_else(|| "self-requested review".to_string());
    let session = services.machine.request_review(target, &reason).await?;
    Ok(json!({
        "session_id": session.session_id,
        "reviewer_uuid": session.reviewer_agent_uuid,
        "phase": session.phase,
    }))
}

async fn submit_thesis(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let actor = ctx.require_actor()?;
    let session_id = uuid_arg(&args, "session_id")?;
    let message = message_arg(&args)?;
    let session = services
        .machine
        .submit_thesis(session_id, actor.uuid, message)
        .await?;
    Ok(json!({ "session_id": session.session_id, "phase": session.phase }))
}

async fn submit_antithesis(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let actor = ctx.require_actor()?;
    let session_id = uuid_arg(&args, "session_id")?;
    let message = message_arg(&args)?;
    let session = services
        .machine
        .submit_antithesis(session_id, actor.uuid, message)
        .await?;
    Ok(json!({ "session_id": session.session_id, "phase": session.phase }))
}

async fn submit_synthesis(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let actor = ctx.require_actor()?;
    let session_id = uuid_arg(&args, "session_id")?;
    let message = message_arg(&args)?;
    let human_inputs = opt_str(&args, "human_inputs");
    let outcome = services
        .machine
        .submit_synthesis(session_id, actor.uuid, message, human_inputs)
        .await?;
    Ok(json!({
        "session_id": outcome.session.session_id,
        "phase": outcome.session.phase,
        "status": outcome.session.status,
        "resolved": outcome.resolved,
        "reasons": outcome.reasons,
        "synthesis_attempts": outcome.session.synthesis_attempts,
    }))
}

async fn get_session(services: Arc<Services>, _ctx: CallerContext, args: Value) -> GovResult<Value> {
    let session_id = uuid_arg(&args, "session_id")?;
    let session = services.machine.get(session_id).await?;
    Ok(serde_json::to_value(session)?)
}

async fn list_sessions(
    services: Arc<Services>,
    _ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let participant = opt_str(&args, "agent_uuid")
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|_| GovError::invalid_type("agent_uuid", "uuid string"))?;
    let sessions = services
        .machine
        .list(SessionFilter {
            participant,
            reviewer: None,
            active_only: opt_bool(&args, "active_only"),
            limit: opt_usize(&args, "limit"),
        })
        .await?;
    let summaries: Vec<Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "session_id": s.session_id,
                "paused_agent_uuid": s.paused_agent_uuid,
                "reviewer_agent_uuid": s.reviewer_agent_uuid,
                "phase": s.phase,
                "status": s.status,
                "created_at": s.created_at,
                "updated_at": s.updated_at,
            })
        })
        .collect();
    Ok(json!({ "sessions": summaries }))
}

async fn cancel_session(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let actor = ctx.require_actor()?;
    let session_id = uuid_arg(&args, "session_id")?;
    let session = services.machine.get(session_id).await?;
    if actor.uuid != session.paused_agent_uuid && actor.uuid != session.reviewer_agent_uuid {
        return Err(GovError::new(
            ErrorCode::PermissionDenied,
            "only a session participant may cancel it",
        ));
    }
    let reason = opt_str(&args, "reason").unwrap_or_else(|| "cancelled by participant".to_string());
    let session = services
        .machine
        .cancel(session_id, actor.uuid, &reason)
        .await?;
    Ok(json!({ "session_id": session.session_id, "status": session.status }))
}

// --- agent lifecycle ---

async fn agent_list(services: Arc<Services>, _ctx: CallerContext, args: Value) -> GovResult<Value> {
    let status = opt_str(&args, "status")
        .map(|s| {
            AgentStatus::parse(&s)
                .ok_or_else(|| GovError::invalid_type("status", "agent status"))
        })
        .transpose()?;
    let identities = services
        .store
        .list_identities(&IdentityFilter {
            status,
            include_deleted: false,
            limit: opt_usize(&args, "limit"),
            offset: opt_usize(&args, "offset"),
        })
        .await?;
    Ok(json!({
        "agents": identities.iter().map(|i| i.public_view()).collect::<Vec<_>>(),
    }))
}

async fn agent_get(services: Arc<Services>, ctx: CallerContext, args: Value) -> GovResult<Value> {
    let target = ctx.read_target(&args)?;
    services.observability.observe(target).await
}

async fn agent_update_metadata(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.write_target(&args)?;
    let mut identity = services.resolver.require_identity(target).await?;
    if args.get("display_name").is_some() {
        identity = services
            .resolver
            .set_display_name(target, opt_str(&args, "display_name"))
            .await?;
    }
    if args.get("tags").is_some() {
        identity = services
            .resolver
            .set_tags(target, string_vec(&args, "tags"))
            .await?;
    }
    Ok(identity.public_view())
}

async fn agent_archive(services: Arc<Services>, ctx: CallerContext, args: Value) -> GovResult<Value> {
    // Lifecycle transitions fall under the strict write-ownership rule:
    // the effective target is always the session-bound identity.
    let target = ctx.write_target(&args)?;
    services
        .engine
        .lifecycle(target, AgentStatus::Archived, "archive requested")
        .await?;
    Ok(json!({ "agent_uuid": target, "status": AgentStatus::Archived }))
}

async fn agent_unarchive(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.write_target(&args)?;
    services
        .engine
        .lifecycle(target, AgentStatus::Active, "unarchive requested")
        .await?;
    Ok(json!({ "agent_uuid": target, "status": AgentStatus::Active }))
}

async fn agent_delete(services: Arc<Services>, ctx: CallerContext, args: Value) -> GovResult<Value> {
    let target = ctx.write_target(&args)?;
    services
        .engine
        .lifecycle(target, AgentStatus::Deleted, "soft delete requested")
        .await?;
    Ok(json!({ "agent_uuid": target, "status": AgentStatus::Deleted }))
}

// --- knowledge notes ---

async fn note_store(services: Arc<Services>, ctx: CallerContext, args: Value) -> GovResult<Value> {
    let author = ctx.write_target(&args)?;
    let kind: NoteKind = opt_str(&args, "note_kind")
        .map(|k| serde_json::from_value(json!(k)))
        .transpose()
        .map_err(|_| GovError::invalid_type("note_kind", "note kind"))?
        .unwrap_or(NoteKind::Note);
    let severity: NoteSeverity = opt_str(&args, "severity")
        .map(|s| serde_json::from_value(json!(s)))
        .transpose()
        .map_err(|_| GovError::invalid_type("severity", "note severity"))?
        .unwrap_or(NoteSeverity::Low);
    let supersedes = opt_str(&args, "supersedes")
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|_| GovError::invalid_type("supersedes", "uuid string"))?;

    let note = services
        .knowledge
        .store_note(
            author,
            str_arg(&args, "summary")?,
            opt_str(&args, "details"),
            kind,
            severity,
            string_vec(&args, "tags"),
            supersedes,
        )
        .await?;
    Ok(serde_json::to_value(note)?)
}

async fn note_search(services: Arc<Services>, _ctx: CallerContext, args: Value) -> GovResult<Value> {
    let query = str_arg(&args, "query")?;
    let limit = opt_usize(&args, "limit").unwrap_or(20);
    let notes = services.knowledge.search(&query, limit).await?;
    Ok(json!({ "notes": notes }))
}

async fn note_get(services: Arc<Services>, _ctx: CallerContext, args: Value) -> GovResult<Value> {
    let id = uuid_arg(&args, "id")?;
    let note = services.knowledge.get(id).await?;
    Ok(serde_json::to_value(note)?)
}

async fn note_list(services: Arc<Services>, _ctx: CallerContext, args: Value) -> GovResult<Value> {
    let author_uuid = opt_str(&args, "author_uuid")
        .map(|s| Uuid::parse_str(&s))
        .transpose()
        .map_err(|_| GovError::invalid_type("author_uuid", "uuid string"))?;
    let status: Option<NoteStatus> = opt_str(&args, "status")
        .map(|s| serde_json::from_value(json!(s)))
        .transpose()
        .map_err(|_| GovError::invalid_type("status", "note status"))?;
    let notes = services
        .knowledge
        .list(NoteFilter {
            author_uuid,
            tag: opt_str(&args, "tag"),
            status,
            limit: opt_usize(&args, "limit"),
        })
        .await?;
    Ok(json!({ "notes": notes }))
}

async fn note_update_status(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    ctx.require_actor()?;
    let id = uuid_arg(&args, "id")?;
    let status: NoteStatus = serde_json::from_value(json!(str_arg(&args, "status")?))
        .map_err(|_| GovError::invalid_type("status", "note status"))?;
    let note = services.knowledge.update_status(id, status).await?;
    Ok(serde_json::to_value(note)?)
}

async fn note_cleanup(services: Arc<Services>, ctx: CallerContext, _args: Value) -> GovResult<Value> {
    ctx.require_actor()?;
    let archived = services.knowledge.cleanup().await?;
    Ok(json!({ "archived": archived }))
}

// --- observability ---

async fn observe(services: Arc<Services>, ctx: CallerContext, args: Value) -> GovResult<Value> {
    let target = ctx.read_target(&args)?;
    services.observability.observe(target).await
}

async fn compare(services: Arc<Services>, _ctx: CallerContext, args: Value) -> GovResult<Value> {
    let a = uuid_arg(&args, "agent_a")?;
    let b = uuid_arg(&args, "agent_b")?;
    services.observability.compare(a, b).await
}

async fn detect_anomalies(
    services: Arc<Services>,
    ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let target = ctx.read_target(&args)?;
    services.observability.detect_anomalies(target).await
}

async fn aggregate_metrics(
    services: Arc<Services>,
    _ctx: CallerContext,
    _args: Value,
) -> GovResult<Value> {
    services.observability.aggregate_metrics().await
}

async fn telemetry(services: Arc<Services>, _ctx: CallerContext, _args: Value) -> GovResult<Value> {
    Ok(services.observability.telemetry())
}

// --- admin ---

async fn health_check(services: Arc<Services>, _ctx: CallerContext, _args: Value) -> GovResult<Value> {
    let store_ok = services.store.ping().await.is_ok();
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "store": if store_ok { "ok" } else { "unreachable" },
        "cache_enabled": services.settings.cache_is_enabled(),
        "operations": services.registry().names().len(),
    }))
}

async fn list_operations(
    services: Arc<Services>,
    _ctx: CallerContext,
    _args: Value,
) -> GovResult<Value> {
    let registry = services.registry();
    let operations: Vec<Value> = registry
        .names()
        .iter()
        .filter_map(|name| registry.get(name))
        .map(|op| json!({ "name": op.name, "description": op.description }))
        .collect();
    Ok(json!({ "operations": operations }))
}

async fn describe_operation(
    services: Arc<Services>,
    _ctx: CallerContext,
    args: Value,
) -> GovResult<Value> {
    let name = str_arg(&args, "name")?;
    services.registry().describe(&name).ok_or_else(|| {
        GovError::new(
            ErrorCode::ResourceNotFound,
            format!("unknown operation '{}'", name),
        )
    })
}

async fn cleanup_stale_locks(
    services: Arc<Services>,
    ctx: CallerContext,
    _args: Value,
) -> GovResult<Value> {
    ctx.require_actor()?;
    let reaped = services.locks.cleanup_stale().await?;
    Ok(json!({ "reaped": reaped }))
}

macro_rules! register {
    ($registry:expr, $name:literal, $desc:literal, $schema:expr, $timeout:expr, $handler:ident) => {
        $registry.register(Operation::new($name, $desc, $schema, $timeout, |s, c, a| {
            Box::pin($handler(s, c, a))
        }));
    };
}

/// Build the full operation table.
pub fn build_registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    let default = DEFAULT_OP_TIMEOUT;
    let object = |required: Value, properties: Value| {
        json!({ "type": "object", "properties": properties, "required": required })
    };

    register!(
        registry,
        "onboard",
        "Resolve or create an identity from a fingerprint, display name, or nothing",
        object(
            json!([]),
            json!({
                "model": { "type": "string" },
                "display_name": { "type": "string" },
                "fingerprint": { "type": "string" },
                "resume": { "type": "boolean" },
                "force_new": { "type": "boolean" },
                "session_key": { "type": "string" },
                "tags": { "type": "array" },
            })
        ),
        default,
        onboard
    );
    register!(
        registry,
        "identity",
        "Describe the authenticated identity",
        object(json!([]), json!({})),
        default,
        identity
    );
    register!(
        registry,
        "set_display_name",
        "Set or clear the caller's display name",
        object(json!([]), json!({ "display_name": { "type": "string" } })),
        default,
        set_display_name
    );
    register!(
        registry,
        "rotate_key",
        "Rotate the caller's API key; the new key is returned once",
        object(json!([]), json!({ "api_key": { "type": "string" } })),
        default,
        rotate_key
    );

    register!(
        registry,
        "process_update",
        "Integrate one EISV step for the caller and return the verdict",
        object(
            json!(["parameters", "ethical_drift"]),
            json!({
                "parameters": { "type": "array" },
                "ethical_drift": { "type": "array" },
                "response_text": { "type": "string" },
                "complexity": { "type": "number" },
                "confidence": { "type": "number" },
                "ci_passed": { "type": "boolean" },
                "external_validation": { "type": "boolean" },
                "task_type": { "type": "string" },
            })
        ),
        Duration::from_secs(60),
        process_update
    );
    register!(
        registry,
        "simulate_update",
        "Dry-run one EISV step with no lock, persistence, or lifecycle effect",
        object(
            json!(["parameters", "ethical_drift"]),
            json!({
                "parameters": { "type": "array" },
                "ethical_drift": { "type": "array" },
                "complexity": { "type": "number" },
                "confidence": { "type": "number" },
            })
        ),
        default,
        simulate_update
    );
    register!(
        registry,
        "get_metrics",
        "Latest state snapshot and active conditions for an agent",
        object(json!([]), json!({ "agent_uuid": { "type": "string" } })),
        default,
        get_metrics
    );
    register!(
        registry,
        "get_history",
        "Recent history ring for an agent",
        object(
            json!([]),
            json!({ "agent_uuid": { "type": "string" }, "limit": { "type": "integer" } })
        ),
        default,
        get_history
    );

    register!(
        registry,
        "resume_if_safe",
        "Resume the caller when the safety predicate holds",
        object(json!([]), json!({})),
        default,
        resume_if_safe
    );
    register!(
        registry,
        "self_recovery_review",
        "Evaluate the safety predicate without changing anything",
        object(json!([]), json!({ "agent_uuid": { "type": "string" } })),
        default,
        self_recovery_review
    );
    register!(
        registry,
        "check_recovery_options",
        "List the recovery paths available to a paused agent",
        object(json!([]), json!({ "agent_uuid": { "type": "string" } })),
        default,
        check_recovery_options
    );
    register!(
        registry,
        "operator_resume",
        "Administrative resume of another agent, bounded by the Safety Gate",
        object(
            json!(["target_uuid"]),
            json!({
                "target_uuid": { "type": "string" },
                "conditions": { "type": "array" },
            })
        ),
        default,
        operator_resume
    );

    register!(
        registry,
        "request_review",
        "Open a dialectic session for the paused caller",
        object(json!([]), json!({ "reason": { "type": "string" } })),
        default,
        request_review
    );
    register!(
        registry,
        "submit_thesis",
        "Submit the paused agent's signed thesis",
        object(
            json!(["session_id", "message"]),
            json!({ "session_id": { "type": "string" }, "message": { "type": "object" } })
        ),
        default,
        submit_thesis
    );
    register!(
        registry,
        "submit_antithesis",
        "Submit the reviewer's signed antithesis",
        object(
            json!(["session_id", "message"]),
            json!({ "session_id": { "type": "string" }, "message": { "type": "object" } })
        ),
        default,
        submit_antithesis
    );
    register!(
        registry,
        "submit_synthesis",
        "Submit a signed synthesis and run convergence and resolution",
        object(
            json!(["session_id", "message"]),
            json!({
                "session_id": { "type": "string" },
                "message": { "type": "object" },
                "human_inputs": { "type": "string" },
            })
        ),
        default,
        submit_synthesis
    );
    register!(
        registry,
        "get_session",
        "Fetch one dialectic session with its messages",
        object(json!(["session_id"]), json!({ "session_id": { "type": "string" } })),
        default,
        get_session
    );
    register!(
        registry,
        "list_sessions",
        "List dialectic sessions, optionally for one participant",
        object(
            json!([]),
            json!({
                "agent_uuid": { "type": "string" },
                "active_only": { "type": "boolean" },
                "limit": { "type": "integer" },
            })
        ),
        default,
        list_sessions
    );
    register!(
        registry,
        "cancel_session",
        "Cancel a non-terminal session; any participant may",
        object(
            json!(["session_id"]),
            json!({ "session_id": { "type": "string" }, "reason": { "type": "string" } })
        ),
        default,
        cancel_session
    );

    register!(
        registry,
        "agent_list",
        "List agents; soft-deleted identities stay hidden",
        object(
            json!([]),
            json!({
                "status": { "type": "string" },
                "limit": { "type": "integer" },
                "offset": { "type": "integer" },
            })
        ),
        default,
        agent_list
    );
    register!(
        registry,
        "agent_get",
        "Identity and latest state for one agent",
        object(json!([]), json!({ "agent_uuid": { "type": "string" } })),
        default,
        agent_get
    );
    register!(
        registry,
        "agent_update_metadata",
        "Update the caller's display name and tags",
        object(
            json!([]),
            json!({ "display_name": { "type": "string" }, "tags": { "type": "array" } })
        ),
        default,
        agent_update_metadata
    );
    register!(
        registry,
        "agent_archive",
        "Archive the calling agent; its state freezes",
        object(json!([]), json!({})),
        default,
        agent_archive
    );
    register!(
        registry,
        "agent_unarchive",
        "Return the archived caller to active",
        object(json!([]), json!({})),
        default,
        agent_unarchive
    );
    register!(
        registry,
        "agent_delete",
        "Soft-delete the calling agent; the identity persists hidden",
        object(json!([]), json!({})),
        default,
        agent_delete
    );

    register!(
        registry,
        "note_store",
        "Append a knowledge note authored by the caller",
        object(
            json!(["summary"]),
            json!({
                "summary": { "type": "string" },
                "details": { "type": "string" },
                "note_kind": { "type": "string" },
                "severity": { "type": "string" },
                "tags": { "type": "array" },
                "supersedes": { "type": "string" },
            })
        ),
        default,
        note_store
    );
    register!(
        registry,
        "note_search",
        "Token search over note summaries and details",
        object(
            json!(["query"]),
            json!({ "query": { "type": "string" }, "limit": { "type": "integer" } })
        ),
        default,
        note_search
    );
    register!(
        registry,
        "note_get",
        "Fetch one knowledge note",
        object(json!(["id"]), json!({ "id": { "type": "string" } })),
        default,
        note_get
    );
    register!(
        registry,
        "note_list",
        "List notes by tag, author, or status",
        object(
            json!([]),
            json!({
                "tag": { "type": "string" },
                "author_uuid": { "type": "string" },
                "status": { "type": "string" },
                "limit": { "type": "integer" },
            })
        ),
        default,
        note_list
    );
    register!(
        registry,
        "note_update_status",
        "Move a note between open, resolved, and archived",
        object(
            json!(["id", "status"]),
            json!({ "id": { "type": "string" }, "status": { "type": "string" } })
        ),
        default,
        note_update_status
    );
    register!(
        registry,
        "note_cleanup",
        "Archive resolved notes older than the cleanup window",
        object(json!([]), json!({})),
        default,
        note_cleanup
    );

    register!(
        registry,
        "observe",
        "Latest snapshot view of one agent",
        object(json!([]), json!({ "agent_uuid": { "type": "string" } })),
        default,
        observe
    );
    register!(
        registry,
        "compare",
        "Per-axis deltas between two agents",
        object(
            json!(["agent_a", "agent_b"]),
            json!({ "agent_a": { "type": "string" }, "agent_b": { "type": "string" } })
        ),
        default,
        compare
    );
    register!(
        registry,
        "detect_anomalies",
        "Oscillation and genesis-drift checks for one agent",
        object(json!([]), json!({ "agent_uuid": { "type": "string" } })),
        default,
        detect_anomalies
    );
    register!(
        registry,
        "aggregate_metrics",
        "Fleet-wide EISV aggregates and histograms",
        object(json!([]), json!({})),
        default,
        aggregate_metrics
    );
    register!(
        registry,
        "telemetry",
        "Process counters",
        object(json!([]), json!({})),
        default,
        telemetry
    );

    register!(
        registry,
        "health_check",
        "Service version and component probes",
        object(json!([]), json!({})),
        default,
        health_check
    );
    register!(
        registry,
        "list_operations",
        "All operations with descriptions",
        object(json!([]), json!({})),
        default,
        list_operations
    );
    register!(
        registry,
        "describe_operation",
        "Schema and timeout for one operation",
        object(json!(["name"]), json!({ "name": { "type": "string" } })),
        default,
        describe_operation
    );
    register!(
        registry,
        "cleanup_stale_locks",
        "Reap expired lock entries",
        object(json!([]), json!({})),
        default,
        cleanup_stale_locks
    );

    // Legacy names rewritten before dispatch.
    registry.alias("apply_update", "process_update");
    registry.alias("store", "note_store");
    registry.alias("search", "note_search");
    registry.alias("update_status", "note_update_status");
    registry.alias("cleanup", "note_cleanup");
    registry.alias("list", "agent_list");
    registry.alias("get", "agent_get");
    registry.alias("update_metadata", "agent_update_metadata");
    registry.alias("archive", "agent_archive");
    registry.alias("delete", "agent_delete");
    registry.alias("request_dialectic_review", "request_review");

    registry
}

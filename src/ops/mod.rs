//! Operation table and dispatch pipeline
//!
//! Every logical operation is a value in one table: name, schema, timeout,
//! handler. Alias rewriting, argument validation, identity injection, and
//! response formatting are a fixed middleware pipeline around the dispatch
//! call rather than per-handler code.

pub mod handlers;
pub mod rpc;

use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::cache::{RateLimiter, SessionCache, connect_external};
use crate::config::Settings;
use crate::dialectic::DialecticMachine;
use crate::engine::GovernanceEngine;
use crate::error::{ErrorCode, GovError, GovResult};
use crate::identity::{AgentIdentity, IdentityResolver, ResolveRequest, Resolution};
use crate::knowledge::KnowledgeService;
use crate::lock::{NamedLock, lock_service};
use crate::observe::{Observability, Telemetry};
use crate::recovery::{PatternTracker, StuckDetector};
use crate::store::{MemoryStore, SqlStore, Store};
use crate::summarize::{embedder_from, summarizer_from};

/// Default per-operation timeout.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// The authenticated caller, injected by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub actor: Option<AgentIdentity>,
}

impl CallerContext {
    /// The session-bound identity, required for any mutation.
    pub fn require_actor(&self) -> GovResult<&AgentIdentity> {
        self.actor.as_ref().ok_or_else(|| {
            GovError::new(
                ErrorCode::AuthenticationRequired,
                "this operation requires an authenticated identity",
            )
            .with_recovery(["onboard"])
        })
    }

    /// Write target: always the session-bound identity. A caller-supplied
    /// `agent_uuid` that disagrees is ignored.
    pub fn write_target(&self, args: &Value) -> GovResult<Uuid> {
        let actor = self.require_actor()?;
        if let Some(supplied) = args.get("agent_uuid").and_then(|v| v.as_str()) {
            if Uuid::parse_str(supplied).map(|u| u != actor.uuid).unwrap_or(true) {
                tracing::debug!(
                    supplied,
                    bound = %actor.uuid,
                    "caller-supplied agent_uuid ignored for write"
                );
            }
        }
        Ok(actor.uuid)
    }

    /// Read target: any agent may be read; defaults to the caller.
    pub fn read_target(&self, args: &Value) -> GovResult<Uuid> {
        if let Some(supplied) = args.get("agent_uuid").and_then(|v| v.as_str()) {
            return Uuid::parse_str(supplied)
                .map_err(|_| GovError::invalid_type("agent_uuid", "uuid string"));
        }
        Ok(self.require_actor()?.uuid)
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = GovResult<Value>> + Send>>;
type Handler = Arc<dyn Fn(Arc<Services>, CallerContext, Value) -> HandlerFuture + Send + Sync>;

/// One dispatchable operation.
#[derive(Clone)]
pub struct Operation {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON-schema-shaped argument description; `required` is enforced.
    pub schema: Value,
    pub timeout: Duration,
    handler: Handler,
}

impl Operation {
    pub fn new<F>(
        name: &'static str,
        description: &'static str,
        schema: Value,
        timeout: Duration,
        handler: F,
    ) -> Self
    where
        F: Fn(Arc<Services>, CallerContext, Value) -> HandlerFuture + Send + Sync + 'static,
    {
        Self {
            name,
            description,
            schema,
            timeout,
            handler: Arc::new(handler),
        }
    }
}

/// The operation table plus legacy-name aliases.
pub struct OperationRegistry {
    operations: HashMap<&'static str, Operation>,
    aliases: HashMap<&'static str, &'static str>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    pub fn register(&mut self, operation: Operation) {
        debug_assert!(
            !self.operations.contains_key(operation.name),
            "duplicate operation {}",
            operation.name
        );
        self.operations.insert(operation.name, operation);
    }

    pub fn alias(&mut self, legacy: &'static str, canonical: &'static str) {
        self.aliases.insert(legacy, canonical);
    }

    pub fn resolve_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).copied().unwrap_or(name)
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.operations.get(self.resolve_name(name))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.operations.keys().copied().collect();
        names.sort();
        names
    }

    pub fn describe(&self, name: &str) -> Option<Value> {
        self.get(name).map(|op| {
            json!({
                "name": op.name,
                "description": op.description,
                "schema": op.schema,
                "timeout_seconds": op.timeout.as_secs(),
            })
        })
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Enforce the schema's `required` list and coarse property types.
fn validate_args(schema: &Value, args: &Value) -> GovResult<()> {
    let Some(object) = args.as_object() else {
        return Err(GovError::invalid_type("arguments", "object"));
    };
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|n| n.as_str()) {
            if !object.contains_key(name) {
                return Err(GovError::missing_parameter(name));
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, spec) in properties {
            let Some(value) = object.get(name) else { continue };
            if value.is_null() {
                continue;
            }
            let expected = spec.get("type").and_then(|t| t.as_str());
            let matches = match expected {
                Some("string") => value.is_string(),
                Some("number") => value.is_number(),
                Some("integer") => value.is_i64() || value.is_u64(),
                Some("boolean") => value.is_boolean(),
                Some("array") => value.is_array(),
                Some("object") => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(GovError::invalid_type(name, expected.unwrap_or("value")));
            }
        }
    }
    Ok(())
}

/// Everything the handlers need, constructed once at startup.
pub struct Services {
    pub settings: Settings,
    pub store: Arc<dyn Store>,
    pub cache: Arc<SessionCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub locks: Arc<dyn NamedLock>,
    pub resolver: Arc<IdentityResolver>,
    pub engine: Arc<GovernanceEngine>,
    pub machine: Arc<DialecticMachine>,
    pub knowledge: Arc<KnowledgeService>,
    pub observability: Arc<Observability>,
    pub audit: Arc<AuditLog>,
    pub telemetry: Arc<Telemetry>,
    pub patterns: Arc<PatternTracker>,
    pub detector: Arc<StuckDetector>,
    registry: OperationRegistry,
}

impl Services {
    /// Composition root against the configured durable store.
    pub async fn init(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let store: Arc<dyn Store> = Arc::new(
            SqlStore::connect(
                &settings.effective_db_url(),
                settings.db_min_conn,
                settings.db_max_conn,
            )
            .await?,
        );
        Ok(Self::assemble(settings, store).await)
    }

    /// Composition root over an injected store; tests use this with the
    /// in-memory implementation.
    pub async fn init_with_store(settings: Settings, store: Arc<dyn Store>) -> Arc<Self> {
        Self::assemble(settings, store).await
    }

    /// In-memory everything; the standard test harness.
    pub async fn for_testing() -> Arc<Self> {
        Self::init_with_store(Settings::default(), Arc::new(MemoryStore::new())).await
    }

    async fn assemble(settings: Settings, store: Arc<dyn Store>) -> Arc<Self> {
        let external = if settings.cache_is_enabled() {
            match settings.cache_url.as_deref() {
                Some(url) => connect_external(url).await,
                None => None,
            }
        } else {
            None
        };

        let session_ttl = Duration::from_secs(settings.session_ttl_seconds);
        let lock_ttl = Duration::from_secs(settings.lock_timeout_seconds);

        let cache = Arc::new(SessionCache::new(external.clone(), session_ttl));
        let rate_limiter = Arc::new(RateLimiter::new(external.clone()));
        let locks = lock_service(external);
        let audit = Arc::new(AuditLog::new(Arc::clone(&store)));
        let telemetry = Arc::new(Telemetry::new());
        let patterns = Arc::new(PatternTracker::new());
        let summarizer = summarizer_from(settings.summarizer_endpoint.as_deref());
        let embedder = embedder_from(settings.embeddings_endpoint.as_deref());

        let resolver = Arc::new(IdentityResolver::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&audit),
            session_ttl,
        ));
        let engine = Arc::new(GovernanceEngine::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&resolver),
            Arc::clone(&audit),
            Arc::clone(&telemetry),
            Arc::clone(&patterns),
            settings.dynamics_params(),
            settings.param_dim,
            settings.drift_dim,
            lock_ttl,
        ));
        let machine = Arc::new(DialecticMachine::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            Arc::clone(&engine),
            Arc::clone(&audit),
            Arc::clone(&telemetry),
            Arc::clone(&locks),
            summarizer,
            lock_ttl,
        ));
        let knowledge = Arc::new(KnowledgeService::new(
            Arc::clone(&store),
            Arc::clone(&rate_limiter),
            embedder,
        ));
        let observability = Arc::new(Observability::new(
            Arc::clone(&store),
            Arc::clone(&telemetry),
        ));
        let detector = Arc::new(StuckDetector::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&machine),
            Arc::clone(&audit),
            Arc::clone(&telemetry),
            Arc::clone(&patterns),
            Arc::clone(&knowledge),
            Duration::from_secs(settings.stuck_sweep_interval_seconds),
        ));

        Arc::new(Self {
            settings,
            store,
            cache,
            rate_limiter,
            locks,
            resolver,
            engine,
            machine,
            knowledge,
            observability,
            audit,
            telemetry,
            patterns,
            detector,
            registry: handlers::build_registry(),
        })
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Authenticate a call from its argument bundle: a session key, or
    /// explicit credentials. Anonymous contexts stay anonymous; handlers
    /// that mutate will refuse them.
    async fn authenticate(&self, args: &Value) -> GovResult<CallerContext> {
        if let Some(session_key) = args.get("session_key").and_then(|v| v.as_str()) {
            let resolution = self
                .resolver
                .resolve(ResolveRequest::SessionKey {
                    session_key: session_key.to_string(),
                })
                .await?;
            if let Resolution::Resolved { identity } = resolution {
                return Ok(CallerContext {
                    actor: Some(identity),
                });
            }
        }
        if let (Some(uuid), Some(api_key)) = (
            args.get("agent_uuid").and_then(|v| v.as_str()),
            args.get("api_key").and_then(|v| v.as_str()),
        ) {
            let agent_uuid = Uuid::parse_str(uuid)
                .map_err(|_| GovError::invalid_type("agent_uuid", "uuid string"))?;
            let resolution = self
                .resolver
                .resolve(ResolveRequest::Explicit {
                    agent_uuid,
                    api_key: api_key.to_string(),
                })
                .await?;
            if let Resolution::Resolved { identity } = resolution {
                return Ok(CallerContext {
                    actor: Some(identity),
                });
            }
        }
        Ok(CallerContext::default())
    }

}

/// The full pipeline: alias rewrite, lookup, authentication, validation,
/// timed dispatch, panic boundary, response formatting.
pub async fn dispatch(services: &Arc<Services>, name: &str, args: Value) -> Value {
    match dispatch_inner(services, name, args).await {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(err) => {
            let mut body = err.to_response();
            body["ok"] = json!(false);
            body
        }
    }
}

async fn dispatch_inner(
    services: &Arc<Services>,
    name: &str,
    args: Value,
) -> GovResult<Value> {
    let operation = services
        .registry
        .get(name)
        .ok_or_else(|| {
            GovError::new(
                ErrorCode::ResourceNotFound,
                format!("unknown operation '{}'", name),
            )
            .with_recovery(["list_operations"])
        })?
        .clone();

    let context = services.authenticate(&args).await?;
    validate_args(&operation.schema, &args)?;

    let services = Arc::clone(services);
    let handler = Arc::clone(&operation.handler);
    let task = tokio::spawn(async move { (handler)(services, context, args).await });

    match tokio::time::timeout(operation.timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            tracing::error!(operation = operation.name, error = %join_err, "handler panicked");
            Err(GovError::internal("operation handler panicked"))
        }
        Err(_) => Err(GovError::new(
            ErrorCode::Timeout,
            format!(
                "operation '{}' exceeded its {}s timeout",
                operation.name,
                operation.timeout.as_secs()
            ),
        )),
    }
}

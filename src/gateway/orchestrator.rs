//! Request orchestration
//!
//! Dispatches caller requests: protocol housekeeping is answered locally,
//! listings are aggregated across backends, and per-item calls run the
//! authorize → audit → forward → audit pipeline.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::backend::{BackendDescriptor, BackendStatus, Supervisor};
use crate::failsafe::{HealthMonitor, RetryPolicy};
use crate::namespace::{NamespaceResolver, qualify, strip};
use crate::policy::sanitize::{fingerprint, sanitize};
use crate::policy::{Actor, Authorization, PolicyEnforcer};
use crate::protocol::{
    Info, InitializeResult, JSONRPC_VERSION, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
    PromptsCapability, PromptsGetParams, PromptsListResult, RequestId, ResourceUriParams,
    ResourcesCapability, ResourcesListResult, ResourcesTemplatesListResult, ServerCapabilities,
    ToolsCallParams, ToolsCapability, ToolsListResult,
};
use crate::registry::DynamicRegistry;
use crate::{Error, Result};

/// Symbol used in the action name of calls that carry none
const UNSCOPED: &str = "*";

/// Who is calling and on whose behalf
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Tenant
    pub tenant: String,
    /// Caller identity
    pub actor: Actor,
    /// Request id used to correlate audit events
    pub request_id: String,
}

/// Where a tenant's backends come from
pub enum BackendSource {
    /// One configured set shared by every tenant
    Static(Arc<NamespaceResolver>),
    /// Per-tenant sets from the registry service
    Dynamic(Arc<DynamicRegistry>),
}

impl BackendSource {
    async fn resolver(&self, tenant: &str) -> Result<Arc<NamespaceResolver>> {
        match self {
            Self::Static(resolver) => Ok(Arc::clone(resolver)),
            Self::Dynamic(registry) => registry.resolver(tenant).await,
        }
    }
}

/// Backend a resource URI was last seen on
struct IndexedUri {
    backend_id: String,
    indexed_at: Instant,
}

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// URI index entries dropped
    pub uris: usize,
    /// Tenant backend sets evicted from the registry cache
    pub tenants: usize,
}

/// Idempotent calls get the configured retry policy; others are sent once
fn is_idempotent(method: &str) -> bool {
    !matches!(method, "tools/call" | "sampling/createMessage")
}

/// Routes caller requests to backends under policy
pub struct Orchestrator {
    kernel_id: String,
    version: String,
    source: BackendSource,
    supervisor: Arc<Supervisor>,
    enforcer: Arc<PolicyEnforcer>,
    audit: Arc<dyn AuditSink>,
    monitor: Arc<HealthMonitor>,
    retry: RetryPolicy,
    trial_fallback: bool,
    /// (tenant, uri) → backend, filled by `resources/list`
    uri_index: DashMap<(String, String), IndexedUri>,
    uri_index_ttl: Duration,
}

/// Collaborators an orchestrator is built from
pub struct OrchestratorParts {
    /// Gateway identity reported to policy and audit
    pub kernel_id: String,
    /// Gateway version reported by `initialize`
    pub version: String,
    /// Backend source
    pub source: BackendSource,
    /// Backend supervisor
    pub supervisor: Arc<Supervisor>,
    /// Policy enforcer
    pub enforcer: Arc<PolicyEnforcer>,
    /// Audit sink
    pub audit: Arc<dyn AuditSink>,
    /// Health monitor notified of failed calls
    pub monitor: Arc<HealthMonitor>,
    /// Retry policy for idempotent calls
    pub retry: RetryPolicy,
    /// Try backends in turn for unindexed resources
    pub trial_fallback: bool,
    /// How long an indexed resource URI stays routed
    pub uri_index_ttl: Duration,
}

impl Orchestrator {
    /// Assemble an orchestrator
    #[must_use]
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            kernel_id: parts.kernel_id,
            version: parts.version,
            source: parts.source,
            supervisor: parts.supervisor,
            enforcer: parts.enforcer,
            audit: parts.audit,
            monitor: parts.monitor,
            retry: parts.retry,
            trial_fallback: parts.trial_fallback,
            uri_index: DashMap::new(),
            uri_index_ttl: parts.uri_index_ttl,
        }
    }

    /// Gateway identity
    #[must_use]
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// Gateway version
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Status of every running backend
    #[must_use]
    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.supervisor.list_all().iter().map(|b| b.status()).collect()
    }

    /// Forget a tenant's backend set and routed resource URIs
    pub fn invalidate_tenant(&self, tenant: &str) {
        if let BackendSource::Dynamic(registry) = &self.source {
            registry.invalidate(tenant);
        }
        self.uri_index.retain(|(t, _), _| t != tenant);
    }

    /// Number of routed resource URIs, lapsed ones included until swept
    #[must_use]
    pub fn indexed_uris(&self) -> usize {
        self.uri_index.len()
    }

    /// Drop lapsed URI routes and evict stale tenant sets
    ///
    /// Backends of an evicted tenant are stopped; the next request for
    /// that tenant reloads its set and relaunches them on demand.
    pub async fn sweep(&self) -> SweepReport {
        let before = self.uri_index.len();
        self.uri_index
            .retain(|_, entry| entry.indexed_at.elapsed() < self.uri_index_ttl);

        let mut tenants = 0;
        if let BackendSource::Dynamic(registry) = &self.source {
            for (tenant, resolver) in registry.evict_stale() {
                self.uri_index.retain(|(t, _), _| *t != tenant);
                for desc in resolver.descriptors() {
                    self.supervisor.stop(&desc.id).await;
                }
                info!(tenant = %tenant, backends = resolver.len(), "Evicted idle tenant");
                tenants += 1;
            }
        }

        let report = SweepReport {
            uris: before.saturating_sub(self.uri_index.len()),
            tenants,
        };
        if report != SweepReport::default() {
            debug!(uris = report.uris, tenants = report.tenants, "Swept routing state");
        }
        report
    }

    /// Sweep every `interval` until cancelled
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.sweep().await; }
                () = cancel.cancelled() => return,
            }
        }
    }

    /// Handle one request; notifications produce no response
    #[instrument(skip(self, request, ctx), fields(method = %request.method, tenant = %ctx.tenant, request_id = %ctx.request_id))]
    pub async fn handle(&self, request: JsonRpcRequest, ctx: &RequestContext) -> Option<JsonRpcResponse> {
        let Some(id) = request.id.clone() else {
            debug!("Notification acknowledged");
            return None;
        };

        if request.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::error(
                id,
                crate::error::rpc_codes::INVALID_REQUEST,
                format!("Unsupported jsonrpc version '{}'", request.jsonrpc),
            ));
        }

        Some(self.respond(id, &request.method, request.params, ctx).await)
    }

    async fn respond(&self, id: RequestId, method: &str, params: Option<Value>, ctx: &RequestContext) -> JsonRpcResponse {
        match self.dispatch(method, params, ctx).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                debug!(error = %e, "Request failed");
                JsonRpcResponse::from_error(id, e.to_rpc_error())
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>, ctx: &RequestContext) -> Result<Value> {
        match method {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(json!({})),
            m if m.starts_with("notifications/") => Ok(json!({})),

            "tools/list" => self.list_tools(ctx).await,
            "prompts/list" => self.list_prompts(ctx).await,
            "resources/list" => self.list_resources(ctx).await,
            "resources/templates/list" => self.list_resource_templates(ctx).await,

            "tools/call" => {
                let call: ToolsCallParams = parse_params(params.as_ref())?;
                self.call_named(method, &call.name, params.unwrap_or_default(), ctx).await
            }
            "prompts/get" => {
                let get: PromptsGetParams = parse_params(params.as_ref())?;
                self.call_named(method, &get.name, params.unwrap_or_default(), ctx).await
            }
            "resources/read" | "resources/subscribe" | "resources/unsubscribe" => {
                let uri: ResourceUriParams = parse_params(params.as_ref())?;
                self.call_resource(method, &uri.uri, params.unwrap_or_default(), ctx).await
            }
            "sampling/createMessage" => {
                let params = params.ok_or_else(|| Error::Validation("missing params".to_string()))?;
                self.call_trial(method, UNSCOPED, params, ctx).await
            }

            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    fn initialize(&self) -> Value {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                prompts: Some(PromptsCapability::default()),
                resources: Some(ResourcesCapability {
                    subscribe: true,
                    list_changed: false,
                }),
                tools: Some(ToolsCapability::default()),
            },
            server_info: Info {
                name: self.kernel_id.clone(),
                version: self.version.clone(),
            },
            instructions: None,
        };
        serde_json::to_value(result).unwrap_or_else(|_| json!({}))
    }

    // ── Listings ──────────────────────────────────────────────────────

    /// Call `method` on every backend whose circuit admits traffic
    ///
    /// Failures are logged and skipped.
    async fn gather(&self, method: &str, ctx: &RequestContext) -> Result<Vec<(Arc<BackendDescriptor>, Value)>> {
        let resolver = self.source.resolver(&ctx.tenant).await?;
        let calls = resolver.descriptors().iter().map(|desc| async move {
            let result = async {
                let backend = self.supervisor.ensure(Arc::clone(desc)).await?;
                if !backend.failsafe().circuit_breaker.can_proceed() {
                    return Err(Error::BackendUnavailable(format!("Backend '{}' circuit is open", desc.id)));
                }
                backend.call(method, None, &self.retry).await
            }
            .await;
            (Arc::clone(desc), result)
        });

        Ok(join_all(calls)
            .await
            .into_iter()
            .filter_map(|(desc, result)| match result {
                Ok(value) => Some((desc, value)),
                Err(e) => {
                    warn!(backend = %desc.id, method, error = %e, "Backend skipped in listing");
                    None
                }
            })
            .collect())
    }

    async fn list_tools(&self, ctx: &RequestContext) -> Result<Value> {
        let mut tools = Vec::new();
        for (desc, value) in self.gather("tools/list", ctx).await? {
            match serde_json::from_value::<ToolsListResult>(value) {
                Ok(list) => tools.extend(list.tools.into_iter().map(|mut t| {
                    t.name = qualify(&desc, &t.name);
                    t
                })),
                Err(e) => warn!(backend = %desc.id, error = %e, "Malformed tools/list result"),
            }
        }
        to_value(&ToolsListResult { tools, next_cursor: None })
    }

    async fn list_prompts(&self, ctx: &RequestContext) -> Result<Value> {
        let mut prompts = Vec::new();
        for (desc, value) in self.gather("prompts/list", ctx).await? {
            match serde_json::from_value::<PromptsListResult>(value) {
                Ok(list) => prompts.extend(list.prompts.into_iter().map(|mut p| {
                    p.name = qualify(&desc, &p.name);
                    p
                })),
                Err(e) => warn!(backend = %desc.id, error = %e, "Malformed prompts/list result"),
            }
        }
        to_value(&PromptsListResult { prompts, next_cursor: None })
    }

    async fn list_resources(&self, ctx: &RequestContext) -> Result<Value> {
        let mut resources = Vec::new();
        for (desc, value) in self.gather("resources/list", ctx).await? {
            match serde_json::from_value::<ResourcesListResult>(value) {
                Ok(list) => {
                    for resource in &list.resources {
                        self.index_uri(&ctx.tenant, &resource.uri, &desc.id);
                    }
                    resources.extend(list.resources);
                }
                Err(e) => warn!(backend = %desc.id, error = %e, "Malformed resources/list result"),
            }
        }
        to_value(&ResourcesListResult { resources, next_cursor: None })
    }

    async fn list_resource_templates(&self, ctx: &RequestContext) -> Result<Value> {
        let mut resource_templates = Vec::new();
        for (desc, value) in self.gather("resources/templates/list", ctx).await? {
            match serde_json::from_value::<ResourcesTemplatesListResult>(value) {
                Ok(list) => resource_templates.extend(list.resource_templates),
                Err(e) => warn!(backend = %desc.id, error = %e, "Malformed resources/templates/list result"),
            }
        }
        to_value(&ResourcesTemplatesListResult {
            resource_templates,
            next_cursor: None,
        })
    }

    // ── Per-item calls ────────────────────────────────────────────────

    /// `tools/call` and `prompts/get`: routed by the name's namespace
    async fn call_named(&self, method: &str, symbol: &str, params: Value, ctx: &RequestContext) -> Result<Value> {
        let resolver = self.source.resolver(&ctx.tenant).await?;
        let desc = Arc::clone(resolver.resolve(symbol)?);

        let action = format!("{method}:{symbol}");
        let auth = self.authorize(&action, &params, None, ctx).await?;

        let mut forwarded = params;
        if let Some(obj) = forwarded.as_object_mut() {
            obj.insert("name".to_string(), Value::String(strip(&desc, symbol).to_string()));
        }

        let result = self.attempt(&desc, method, forwarded).await;
        self.audit_outcome(&action, &auth, &desc.id, ctx, &result);
        result
    }

    /// Resource calls: routed by the URI index, else by trial
    async fn call_resource(&self, method: &str, uri: &str, params: Value, ctx: &RequestContext) -> Result<Value> {
        let key = (ctx.tenant.clone(), uri.to_string());
        let indexed = self
            .uri_index
            .get(&key)
            .filter(|entry| entry.indexed_at.elapsed() < self.uri_index_ttl)
            .map(|entry| entry.backend_id.clone());

        if let Some(backend_id) = indexed {
            let resolver = self.source.resolver(&ctx.tenant).await?;
            if let Some(desc) = resolver.get(&backend_id).cloned() {
                let action = format!("{method}:{uri}");
                let auth = self.authorize(&action, &params, Some(&desc.id), ctx).await?;
                let result = self.attempt(&desc, method, params).await;
                self.audit_outcome(&action, &auth, &desc.id, ctx, &result);
                return result;
            }
        }
        self.uri_index.remove(&key);

        if !self.trial_fallback {
            return Err(Error::NoBackendFound(format!("No backend has listed resource '{uri}'")));
        }
        self.call_trial(method, uri, params, ctx).await
    }

    /// Authorize once, then try each backend in turn
    async fn call_trial(&self, method: &str, symbol: &str, params: Value, ctx: &RequestContext) -> Result<Value> {
        let resolver = self.source.resolver(&ctx.tenant).await?;
        if resolver.is_empty() {
            return Err(Error::NoBackendFound(format!("No backends for '{method}'")));
        }

        let action = format!("{method}:{symbol}");
        let auth = self.authorize(&action, &params, None, ctx).await?;

        let mut last_error = None;
        for desc in resolver.descriptors() {
            match self.attempt(desc, method, params.clone()).await {
                Ok(value) => {
                    if method.starts_with("resources/") {
                        self.index_uri(&ctx.tenant, symbol, &desc.id);
                    }
                    self.audit_outcome(&action, &auth, &desc.id, ctx, &Ok(Value::Null));
                    return Ok(value);
                }
                Err(e) => {
                    debug!(backend = %desc.id, method, error = %e, "Trial attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| Error::NoBackendFound(symbol.to_string()));
        warn!(method, symbol, error = %err, "No backend accepted the call");
        self.audit(
            AuditEvent::new(&self.kernel_id, &ctx.tenant, &ctx.actor, &action, AuditOutcome::Error)
                .with_decision(&auth.decision_id, auth.policy_id.as_deref())
                .with_request_id(&ctx.request_id)
                .with_payload_hash(&auth.fingerprint)
                .with_error(err.to_string()),
        );
        Err(err)
    }

    /// Authorize an action, auditing the verdict
    async fn authorize(
        &self,
        action: &str,
        params: &Value,
        backend: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Authorization> {
        let summary = sanitize(params);
        let fp = fingerprint(&summary);
        let outcome = self
            .enforcer
            .authorize_summary(action, summary, fp.clone(), &ctx.tenant, &ctx.actor)
            .await;

        let event = AuditEvent::new(
            &self.kernel_id,
            &ctx.tenant,
            &ctx.actor,
            action,
            if outcome.is_ok() { AuditOutcome::Allowed } else { AuditOutcome::Denied },
        )
        .with_request_id(&ctx.request_id)
        .with_payload_hash(&fp);
        let event = match backend {
            Some(id) => event.with_backend(id),
            None => event,
        };
        let event = match &outcome {
            Ok(auth) => event.with_decision(&auth.decision_id, auth.policy_id.as_deref()),
            Err(Error::Authorization(denial)) => event
                .with_decision(&denial.decision_id, denial.policy_id.as_deref())
                .with_error(denial.reason.clone().unwrap_or_else(|| denial.decision.to_string())),
            Err(e) => event.with_error(e.to_string()),
        };
        self.audit(event);

        outcome
    }

    /// Forward to one backend, spawning it if needed
    async fn attempt(&self, desc: &Arc<BackendDescriptor>, method: &str, params: Value) -> Result<Value> {
        let retry = if is_idempotent(method) {
            self.retry.clone()
        } else {
            RetryPolicy::none()
        };

        let backend = self.supervisor.ensure(Arc::clone(desc)).await?;
        let result = backend.call(method, Some(params), &retry).await;

        if let Err(e) = &result {
            if !matches!(e, Error::JsonRpc { .. }) {
                telemetry_metrics::counter!("gateway_forward_errors_total").increment(1);
            }
            if e.is_retryable() {
                self.monitor.on_call_failure(&desc.id);
            }
        }
        result
    }

    fn index_uri(&self, tenant: &str, uri: &str, backend_id: &str) {
        self.uri_index.insert(
            (tenant.to_string(), uri.to_string()),
            IndexedUri {
                backend_id: backend_id.to_string(),
                indexed_at: Instant::now(),
            },
        );
    }

    fn audit_outcome(
        &self,
        action: &str,
        auth: &Authorization,
        backend: &str,
        ctx: &RequestContext,
        result: &Result<Value>,
    ) {
        let outcome = if result.is_ok() { AuditOutcome::Success } else { AuditOutcome::Error };
        let event = AuditEvent::new(&self.kernel_id, &ctx.tenant, &ctx.actor, action, outcome)
            .with_decision(&auth.decision_id, auth.policy_id.as_deref())
            .with_backend(backend)
            .with_request_id(&ctx.request_id)
            .with_payload_hash(&auth.fingerprint);
        let event = match result {
            Err(e) => event.with_error(e.to_string()),
            Ok(_) => event,
        };
        self.audit(event);
    }

    fn audit(&self, event: AuditEvent) {
        self.audit.record(event);
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<&Value>) -> Result<T> {
    let params = params.ok_or_else(|| Error::Validation("missing params".to_string()))?;
    serde_json::from_value(params.clone()).map_err(|e| Error::Validation(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_calls_are_not_retried() {
        assert!(!is_idempotent("tools/call"));
        assert!(!is_idempotent("sampling/createMessage"));
        assert!(is_idempotent("resources/read"));
        assert!(is_idempotent("tools/list"));
    }

    #[test]
    fn params_are_validated() {
        let err = parse_params::<ToolsCallParams>(None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = parse_params::<ToolsCallParams>(Some(&json!({"arguments": {}}))).unwrap_err();
        assert_eq!(err.to_rpc_code(), crate::error::rpc_codes::INVALID_PARAMS);

        let ok: ToolsCallParams = parse_params(Some(&json!({"name": "fs.read"}))).unwrap();
        assert_eq!(ok.name, "fs.read");
    }
}

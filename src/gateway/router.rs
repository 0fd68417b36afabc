//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::future::join_all;
use serde_json::{Value, json};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::debug;

use super::orchestrator::{Orchestrator, RequestContext};
use crate::error::rpc_codes;
use crate::failsafe::CircuitState;
use crate::policy::Actor;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};

/// Shared application state
pub struct AppState {
    /// Request orchestrator
    pub orchestrator: Arc<Orchestrator>,
    /// Tenant used when a request carries no `x-tenant-id`
    pub default_tenant: Option<String>,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Time allowed for one HTTP request, batches included
    pub request_timeout: Duration,
    /// Prometheus exporter handle
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Create the router
///
/// Requests without an `x-request-id` get a generated one, which audit
/// events carry and the response echoes.
pub fn create_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/mcp", post(mcp_handler));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .layer(DefaultBodyLimit::max(state.max_body_size))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let statuses = state.orchestrator.statuses();
    let healthy = statuses.iter().all(|s| s.circuit_state != CircuitState::Open);

    let response = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "gateway": {
            "id": state.orchestrator.kernel_id(),
            "version": state.orchestrator.version(),
        },
        "backends": statuses,
    });

    if healthy {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// GET /metrics
#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// POST /mcp
async fn mcp_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_failure(StatusCode::BAD_REQUEST, rpc_codes::PARSE_ERROR, format!("Invalid JSON: {e}"));
        }
    };

    let Some(ctx) = request_context(&headers, state.default_tenant.as_deref()) else {
        return rpc_failure(
            StatusCode::BAD_REQUEST,
            rpc_codes::INVALID_REQUEST,
            "Missing x-tenant-id header".to_string(),
        );
    };

    match value {
        Value::Array(items) if items.is_empty() => {
            rpc_failure(StatusCode::BAD_REQUEST, rpc_codes::INVALID_REQUEST, "Empty batch".to_string())
        }
        Value::Array(items) => {
            let responses: Vec<JsonRpcResponse> = join_all(
                items
                    .into_iter()
                    .map(|item| handle_one(&state.orchestrator, item, &ctx)),
            )
            .await
            .into_iter()
            .flatten()
            .collect();
            if responses.is_empty() {
                StatusCode::ACCEPTED.into_response()
            } else {
                Json(responses).into_response()
            }
        }
        item => match handle_one(&state.orchestrator, item, &ctx).await {
            Some(response) => Json(response).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        },
    }
}

async fn handle_one(orchestrator: &Orchestrator, value: Value, ctx: &RequestContext) -> Option<JsonRpcResponse> {
    let id = value.get("id").and_then(extract_request_id);
    match serde_json::from_value::<JsonRpcRequest>(value) {
        Ok(request) => orchestrator.handle(request, ctx).await,
        Err(e) => {
            debug!(error = %e, "Invalid JSON-RPC request");
            Some(JsonRpcResponse::error(
                id.unwrap_or_default(),
                rpc_codes::INVALID_REQUEST,
                format!("Invalid request: {e}"),
            ))
        }
    }
}

/// Build the request context from headers
///
/// Actor precedence: `x-api-key-id`, then `x-user-id`, else system.
fn request_context(headers: &HeaderMap, default_tenant: Option<&str>) -> Option<RequestContext> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };

    let tenant = header("x-tenant-id").or_else(|| default_tenant.map(String::from))?;
    let actor = if let Some(id) = header("x-api-key-id") {
        Actor::ServiceKey { id }
    } else if let Some(id) = header("x-user-id") {
        Actor::User { id }
    } else {
        Actor::System
    };
    let request_id = header("x-request-id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Some(RequestContext {
        tenant,
        actor,
        request_id,
    })
}

/// Extract a `RequestId` from a JSON value
fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => Some(RequestId::Number(n.clone())),
        _ => None,
    }
}

fn rpc_failure(status: StatusCode, code: i32, message: String) -> Response {
    (status, Json(JsonRpcResponse::error(RequestId::Null, code, message))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn api_key_wins_over_user() {
        let ctx = request_context(
            &headers(&[("x-tenant-id", "acme"), ("x-api-key-id", "k1"), ("x-user-id", "u1")]),
            None,
        )
        .unwrap();
        assert_eq!(ctx.tenant, "acme");
        assert_eq!(ctx.actor, Actor::ServiceKey { id: "k1".into() });
    }

    #[test]
    fn tenant_falls_back_to_default() {
        let ctx = request_context(&headers(&[("x-user-id", "u1"), ("x-request-id", "r-7")]), Some("static")).unwrap();
        assert_eq!(ctx.tenant, "static");
        assert_eq!(ctx.actor, Actor::User { id: "u1".into() });
        assert_eq!(ctx.request_id, "r-7");

        assert!(request_context(&HeaderMap::new(), None).is_none());
    }

    #[test]
    fn missing_actor_is_system() {
        let ctx = request_context(&headers(&[("x-tenant-id", "t")]), None).unwrap();
        assert_eq!(ctx.actor, Actor::System);
        assert!(!ctx.request_id.is_empty());
    }

    #[test]
    fn request_ids_extracted() {
        assert_eq!(extract_request_id(&json!("abc")), Some(RequestId::String("abc".into())));
        assert_eq!(extract_request_id(&json!(-4)), Some(RequestId::Number((-4).into())));
        assert_eq!(extract_request_id(&json!(u64::MAX)), Some(RequestId::Number(u64::MAX.into())));
        assert_eq!(extract_request_id(&json!(null)), None);
        assert_eq!(extract_request_id(&json!(true)), None);
    }
}

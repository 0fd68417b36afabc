//! Decision service client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Actor, Verdict};
use crate::{Error, Result};

/// Authorization request sent to the decision service
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    /// Gateway identity
    pub kernel_id: String,
    /// Tenant making the call
    pub tenant_id: String,
    /// Who is calling
    pub actor: Actor,
    /// `"{method}:{symbol}"`
    pub action: String,
    /// Hex SHA-256 of the sanitized payload
    pub request_fingerprint: String,
    /// Bounded payload summary
    pub sanitized_summary: Value,
}

/// Decision returned by the decision service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Decision id
    pub decision_id: String,
    /// Verdict
    pub decision: Verdict,
    /// Human-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Policy that produced the verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// How long an allow may be cached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

/// External policy decision point
#[async_trait]
pub trait DecisionService: Send + Sync {
    /// Decide one authorization request
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<Decision>;
}

/// Decision service reached over HTTP
pub struct HttpDecisionService {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpDecisionService {
    /// Create a client for `{base_url}/v1/authorize`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the HTTP client cannot be built.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Config(format!("Decision client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}/v1/authorize", base_url.trim_end_matches('/')),
            token,
        })
    }
}

#[async_trait]
impl DecisionService for HttpDecisionService {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<Decision> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("Decision service: {e}"))
            } else {
                Error::Network(format!("Decision service: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Network(format!("Decision service returned HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Protocol(format!("Decision service returned HTTP {status}")));
        }

        let decision: Decision = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Decision service response: {e}")))?;
        debug!(decision_id = %decision.decision_id, verdict = %decision.decision, "Decision received");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decision_parses_minimal_and_full_shapes() {
        let minimal: Decision =
            serde_json::from_value(json!({"decision_id": "d1", "decision": "deny"})).unwrap();
        assert_eq!(minimal.decision, Verdict::Deny);
        assert!(minimal.ttl_ms.is_none());

        let full: Decision = serde_json::from_value(json!({
            "decision_id": "d2",
            "decision": "require_approval",
            "reason": "needs sign-off",
            "policy_id": "p9",
            "ttl_ms": 1500
        }))
        .unwrap();
        assert_eq!(full.decision, Verdict::RequireApproval);
        assert_eq!(full.ttl_ms, Some(1500));
    }

    #[test]
    fn request_serializes_actor() {
        let req = AuthorizationRequest {
            kernel_id: "k".into(),
            tenant_id: "acme".into(),
            actor: Actor::ServiceKey { id: "key-1".into() },
            action: "tools/call:fs.read".into(),
            request_fingerprint: "ab".into(),
            sanitized_summary: json!({}),
        };
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire["actor"], json!({"type": "api_key", "id": "key-1"}));
    }

    #[tokio::test]
    async fn unreachable_service_is_network_error() {
        let service =
            HttpDecisionService::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let req = AuthorizationRequest {
            kernel_id: "k".into(),
            tenant_id: "t".into(),
            actor: Actor::System,
            action: "tools/call:x.y".into(),
            request_fingerprint: String::new(),
            sanitized_summary: Value::Null,
        };
        let err = service.authorize(&req).await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }
}

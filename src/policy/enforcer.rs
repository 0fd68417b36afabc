//! Fail-closed authorization

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::sanitize::{fingerprint, sanitize};
use super::{Actor, AuthorizationCache, AuthorizationRequest, DecisionService, Verdict};
use crate::error::Denial;
use crate::{Error, Result};

/// Reason attached to locally generated denials
const UNAVAILABLE_REASON: &str = "authorization unavailable";

/// A granted authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    /// Decision id that allowed the call
    pub decision_id: String,
    /// Policy that allowed the call
    pub policy_id: Option<String>,
    /// Served from the cache
    pub cached: bool,
    /// Fingerprint of the sanitized payload
    pub fingerprint: String,
}

/// Authorizes calls against the decision service
pub struct PolicyEnforcer {
    kernel_id: String,
    service: Arc<dyn DecisionService>,
    cache: Arc<AuthorizationCache>,
    timeout: Duration,
}

impl PolicyEnforcer {
    /// Create an enforcer
    #[must_use]
    pub fn new(
        kernel_id: impl Into<String>,
        service: Arc<dyn DecisionService>,
        cache: Arc<AuthorizationCache>,
        timeout: Duration,
    ) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            service,
            cache,
            timeout,
        }
    }

    /// The decision cache
    #[must_use]
    pub fn cache(&self) -> &Arc<AuthorizationCache> {
        &self.cache
    }

    /// Authorize one call
    ///
    /// Never returns `Ok` unless the decision service (or a live cached
    /// decision) said allow.
    #[instrument(skip(self, params, actor), fields(kernel = %self.kernel_id))]
    pub async fn authorize(
        &self,
        action: &str,
        params: &Value,
        tenant: &str,
        actor: &Actor,
    ) -> Result<Authorization> {
        let summary = sanitize(params);
        let fp = fingerprint(&summary);
        self.authorize_summary(action, summary, fp, tenant, actor).await
    }

    /// Authorize with a summary and fingerprint computed by the caller
    pub async fn authorize_summary(
        &self,
        action: &str,
        summary: Value,
        fp: String,
        tenant: &str,
        actor: &Actor,
    ) -> Result<Authorization> {
        let key = AuthorizationCache::key(tenant, action, &fp);
        if let Some(hit) = self.cache.get(&key) {
            telemetry_metrics::counter!("gateway_decision_cache_hits_total").increment(1);
            debug!(decision_id = %hit.decision_id, "Authorization served from cache");
            return Ok(Authorization {
                decision_id: hit.decision_id,
                policy_id: hit.policy_id,
                cached: true,
                fingerprint: fp,
            });
        }

        let request = AuthorizationRequest {
            kernel_id: self.kernel_id.clone(),
            tenant_id: tenant.to_string(),
            actor: actor.clone(),
            action: action.to_string(),
            request_fingerprint: fp.clone(),
            sanitized_summary: summary,
        };

        let decision = match tokio::time::timeout(self.timeout, self.service.authorize(&request)).await {
            Err(_) => {
                record_outcome("timeout");
                warn!(timeout_ms = self.timeout.as_millis(), "Decision service timed out");
                return Err(Error::Timeout(format!(
                    "decision service did not answer within {}ms",
                    self.timeout.as_millis()
                )));
            }
            Ok(Err(e)) if e.is_retryable() => {
                record_outcome("unreachable");
                warn!(error = %e, "Decision service unreachable");
                return Err(match e {
                    Error::Timeout(_) | Error::Network(_) => e,
                    other => Error::Network(other.to_string()),
                });
            }
            Ok(Err(e)) => {
                record_outcome("error");
                warn!(error = %e, "Decision service failed, denying");
                return Err(Error::denied(Denial {
                    decision_id: format!("local-{}", uuid::Uuid::new_v4()),
                    decision: Verdict::Deny,
                    policy_id: None,
                    reason: Some(UNAVAILABLE_REASON.to_string()),
                }));
            }
            Ok(Ok(decision)) => decision,
        };

        record_outcome(&decision.decision.to_string());
        if decision.decision != Verdict::Allow {
            debug!(decision_id = %decision.decision_id, verdict = %decision.decision, "Call refused");
            return Err(Error::denied(Denial {
                decision_id: decision.decision_id,
                decision: decision.decision,
                policy_id: decision.policy_id,
                reason: decision.reason,
            }));
        }

        if let Err(e) = self.cache.insert(&key, &decision) {
            debug!(error = %e, "Allow decision not cached");
        }

        Ok(Authorization {
            decision_id: decision.decision_id,
            policy_id: decision.policy_id,
            cached: false,
            fingerprint: fp,
        })
    }
}

fn record_outcome(outcome: &str) {
    telemetry_metrics::counter!("gateway_decisions_total", "outcome" => outcome.to_string())
        .increment(1);
}

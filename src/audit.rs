//! Audit emission
//!
//! Every authorization and forwarding outcome produces an [`AuditEvent`].
//! Sinks are fire-and-forget: `record` never blocks the caller and never
//! fails the request. Events carry the payload fingerprint, never the raw
//! payload.
//!
//! ```text
//! INFO policy_gateway::audit audit={"event_id":"...","outcome":"allowed",...}
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::policy::Actor;
use crate::{Error, Result};

/// Outcome recorded by an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Policy allowed the call
    Allowed,
    /// Policy refused the call (or failed closed)
    Denied,
    /// Backend answered
    Success,
    /// Forwarding failed
    Error,
}

/// One audit record
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Unique event id
    pub event_id: String,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Gateway identity
    pub kernel_id: String,
    /// Tenant
    pub tenant_id: String,
    /// `system`, `api_key` or `user`
    pub actor_type: &'static str,
    /// Actor id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// `"{method}:{symbol}"`
    pub action: String,
    /// Outcome
    pub outcome: AuditOutcome,
    /// Decision that allowed or refused the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
    /// Policy behind the decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Backend that served (or would have served) the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Caller request id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Fingerprint of the sanitized payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
    /// Error message for denied/error outcomes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    /// Start an event for an action
    #[must_use]
    pub fn new(
        kernel_id: &str,
        tenant_id: &str,
        actor: &Actor,
        action: &str,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kernel_id: kernel_id.to_string(),
            tenant_id: tenant_id.to_string(),
            actor_type: actor.kind(),
            actor_id: actor.id().map(ToString::to_string),
            action: action.to_string(),
            outcome,
            decision_id: None,
            policy_id: None,
            backend: None,
            request_id: None,
            payload_hash: None,
            error: None,
        }
    }

    /// Attach decision metadata
    #[must_use]
    pub fn with_decision(mut self, decision_id: &str, policy_id: Option<&str>) -> Self {
        self.decision_id = Some(decision_id.to_string());
        self.policy_id = policy_id.map(ToString::to_string);
        self
    }

    /// Attach the backend id
    #[must_use]
    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_string());
        self
    }

    /// Attach the request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    /// Attach the payload fingerprint
    #[must_use]
    pub fn with_payload_hash(mut self, hash: &str) -> Self {
        self.payload_hash = Some(hash.to_string());
        self
    }

    /// Attach an error message
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Fire-and-forget audit destination
pub trait AuditSink: Send + Sync {
    /// Record an event without blocking
    fn record(&self, event: AuditEvent);
}

/// Emit an event as a structured `tracing` record
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, outcome = ?event.outcome, "audit"),
        Err(ref e) => warn!(error = %e, "Failed to serialize audit event"),
    }
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        emit(&event);
    }
}

/// Sink that logs and POSTs each event to an audit service
pub struct HttpAuditSink {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpAuditSink {
    /// Create a sink for `url`
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Audit client: {e}")))?;
        Ok(Arc::new(Self {
            client,
            url: url.to_string(),
            token,
        }))
    }
}

impl AuditSink for HttpAuditSink {
    fn record(&self, event: AuditEvent) {
        emit(&event);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, audit event not shipped");
            return;
        };
        let mut builder = self.client.post(&self.url).json(&event);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        handle.spawn(async move {
            match builder.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(status = %resp.status(), event_id = %event.event_id, "Audit sink rejected event"),
                Err(e) => warn!(error = %e, event_id = %event.event_id, "Audit sink unreachable"),
            }
        });
    }
}

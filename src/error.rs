//! Error types for the policy gateway

use std::io;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::protocol::JsonRpcError;

/// Result type alias for the policy gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Verdict returned by the decision service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Forward the call
    Allow,
    /// Refuse the call
    Deny,
    /// Refuse until a human approves
    RequireApproval,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny => f.write_str("deny"),
            Self::RequireApproval => f.write_str("require_approval"),
        }
    }
}

/// Metadata carried by an authorization failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    /// Decision id (service-issued, or locally generated on fail-closed)
    pub decision_id: String,
    /// Deny or require-approval
    pub decision: Verdict,
    /// Policy that produced the verdict
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Human-readable reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Policy gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Call refused by policy
    #[error("Authorization denied ({}): {}", .0.decision, .0.reason.as_deref().unwrap_or("no reason given"))]
    Authorization(Box<Denial>),

    /// Network failure talking to a collaborator or backend
    #[error("Network error: {0}")]
    Network(String),

    /// Deadline elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Backend process lifecycle failure
    #[error("Process error: {0}")]
    Process(String),

    /// Malformed or unexpected protocol traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bad caller input
    #[error("Invalid params: {0}")]
    Validation(String),

    /// Authorization cache failure (never propagated past the cache)
    #[error("Cache error: {0}")]
    Cache(String),

    /// No backend owns the symbol
    #[error("No backend found: {0}")]
    NoBackendFound(String),

    /// Backend exists but cannot take calls (retired, circuit open, not ready)
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Unknown protocol method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Error returned by a backend, passed through verbatim
    #[error("Backend error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<Value>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an authorization error
    pub fn denied(denial: Denial) -> Self {
        Self::Authorization(Box::new(denial))
    }

    /// Whether an identical retry may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Process(_) | Self::Io(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Authorization(_) => rpc_codes::AUTHORIZATION_DENIED,
            Self::Validation(_) => rpc_codes::INVALID_PARAMS,
            Self::MethodNotFound(_) => rpc_codes::METHOD_NOT_FOUND,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Timeout(_) => rpc_codes::REQUEST_TIMEOUT,
            Self::Http(e) if e.is_timeout() => rpc_codes::REQUEST_TIMEOUT,
            Self::Network(_)
            | Self::Process(_)
            | Self::Protocol(_)
            | Self::NoBackendFound(_)
            | Self::BackendUnavailable(_)
            | Self::Io(_)
            | Self::Http(_) => rpc_codes::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Cache(_) | Self::Internal(_) => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Convert to a caller-visible JSON-RPC error object
    ///
    /// Internal details of configuration and cache faults are not exposed.
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let code = self.to_rpc_code();
        match self {
            Self::Authorization(denial) => JsonRpcError {
                code,
                message: "Authorization denied".to_string(),
                data: serde_json::to_value(denial.as_ref()).ok(),
            },
            Self::JsonRpc { message, data, .. } => JsonRpcError {
                code,
                message: message.clone(),
                data: data.clone(),
            },
            Self::Config(_) | Self::Cache(_) | Self::Internal(_) => JsonRpcError {
                code,
                message: "Internal error".to_string(),
                data: None,
            },
            other => JsonRpcError {
                code,
                message: other.to_string(),
                data: other.is_retryable().then(|| json!({"retryable": true})),
            },
        }
    }
}

/// JSON-RPC error codes used by the gateway
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Backend or collaborator unavailable
    pub const SERVICE_UNAVAILABLE: i32 = -32000;
    /// Deadline elapsed
    pub const REQUEST_TIMEOUT: i32 = -32001;
    /// Refused by policy
    pub const AUTHORIZATION_DENIED: i32 = -32003;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_maps_to_authorization_code_with_metadata() {
        let err = Error::denied(Denial {
            decision_id: "dec-1".to_string(),
            decision: Verdict::RequireApproval,
            policy_id: Some("pol-9".to_string()),
            reason: Some("needs sign-off".to_string()),
        });

        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, rpc_codes::AUTHORIZATION_DENIED);
        let data = rpc.data.unwrap();
        assert_eq!(data["decision_id"], "dec-1");
        assert_eq!(data["decision"], "require_approval");
        assert_eq!(data["policy_id"], "pol-9");
        assert!(!err.is_retryable());
    }

    #[test]
    fn network_and_timeout_are_retryable() {
        assert!(Error::Network("refused".into()).is_retryable());
        assert!(Error::Timeout("5s".into()).is_retryable());
        assert!(Error::Process("exited".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::BackendUnavailable("x".into()).is_retryable());
    }

    #[test]
    fn retryable_errors_flag_data() {
        let rpc = Error::Timeout("decision service".into()).to_rpc_error();
        assert_eq!(rpc.code, rpc_codes::REQUEST_TIMEOUT);
        assert_eq!(rpc.data.unwrap()["retryable"], true);

        let rpc = Error::BackendUnavailable("fs".into()).to_rpc_error();
        assert_eq!(rpc.code, rpc_codes::SERVICE_UNAVAILABLE);
        assert!(rpc.data.is_none());
    }

    #[test]
    fn internal_details_are_redacted() {
        let rpc = Error::Internal("lock poisoned at cache.rs:12".into()).to_rpc_error();
        assert_eq!(rpc.code, rpc_codes::INTERNAL_ERROR);
        assert_eq!(rpc.message, "Internal error");
    }
}

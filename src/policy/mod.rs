//! Policy enforcement
//!
//! Every per-item call is sanitized, fingerprinted and authorized against an
//! external decision service before it reaches a backend. Allow decisions are
//! cached; anything else fails closed.

mod cache;
mod decision;
mod enforcer;
pub mod sanitize;

pub use cache::{AuthorizationCache, CacheStatsSnapshot, CachedDecision};
pub use decision::{AuthorizationRequest, Decision, DecisionService, HttpDecisionService};
pub use enforcer::{Authorization, PolicyEnforcer};

pub use crate::error::{Denial, Verdict};

use serde::{Deserialize, Serialize};

/// Who is making a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    /// The gateway itself, or an unauthenticated static deployment
    System,
    /// A service API key
    #[serde(rename = "api_key")]
    ServiceKey {
        /// Key id
        id: String,
    },
    /// An end user
    User {
        /// User id
        id: String,
    },
}

impl Actor {
    /// Actor type as reported to audit
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::ServiceKey { .. } => "api_key",
            Self::User { .. } => "user",
        }
    }

    /// Actor id, if any
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::System => None,
            Self::ServiceKey { id } | Self::User { id } => Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn actor_wire_shape() {
        assert_eq!(serde_json::to_value(Actor::System).unwrap(), json!({"type": "system"}));
        assert_eq!(
            serde_json::to_value(Actor::User { id: "u1".into() }).unwrap(),
            json!({"type": "user", "id": "u1"})
        );
        assert_eq!(Actor::ServiceKey { id: "k".into() }.kind(), "api_key");
        assert_eq!(Actor::System.id(), None);
    }
}

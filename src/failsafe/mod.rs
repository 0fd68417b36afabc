//! Backend protection
//!
//! Every supervised backend owns a [`Failsafe`]: a breaker that stops
//! traffic after repeated transport failures and a tracker whose
//! unhealthy flag drives the [`HealthMonitor`] restarts.

mod circuit_breaker;
mod health;
mod monitor;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use health::{HealthMetrics, HealthTracker, UNHEALTHY_AFTER};
pub use monitor::{CheckOutcome, HealthMonitor};
pub use retry::RetryPolicy;

use std::sync::Arc;

use crate::config::FailsafeConfig;

/// Per-backend breaker and health state, fed by the same call outcomes
#[derive(Clone)]
pub struct Failsafe {
    /// Admits or refuses calls
    pub circuit_breaker: Arc<CircuitBreaker>,
    /// Outcome counters and the healthy flag
    pub health_tracker: Arc<HealthTracker>,
}

impl Failsafe {
    /// Build the state for the backend `name`
    #[must_use]
    pub fn new(name: &str, config: &FailsafeConfig) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(name, &config.circuit_breaker)),
            health_tracker: Arc::new(HealthTracker::new(name)),
        }
    }

    /// Count a completed call toward both breaker and tracker
    pub fn record_success(&self, latency: std::time::Duration) {
        self.circuit_breaker.record_success();
        self.health_tracker.record_success(latency);
    }

    /// Count a transport failure toward both breaker and tracker
    pub fn record_failure(&self) {
        self.circuit_breaker.record_failure();
        self.health_tracker.record_failure();
    }

    /// Snapshot for `/health`
    #[must_use]
    pub fn health_metrics(&self) -> HealthMetrics {
        self.health_tracker.metrics()
    }
}

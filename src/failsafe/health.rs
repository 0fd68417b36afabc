//! Per-backend outcome counters
//!
//! A backend turns unhealthy after [`UNHEALTHY_AFTER`] failures in a row and
//! healthy again on its next success.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

/// Consecutive failures before a backend is marked unhealthy
pub const UNHEALTHY_AFTER: u64 = 3;

/// Outcome counters and healthy flag for one backend
pub struct HealthTracker {
    name: String,
    healthy: AtomicBool,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU64,
    last_latency_ms: AtomicU64,
    last_check: RwLock<Option<DateTime<Utc>>>,
}

impl HealthTracker {
    /// Tracker for `name`, healthy until proven otherwise
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: AtomicBool::new(true),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
            last_check: RwLock::new(None),
        }
    }

    /// Reset the failure streak and store the latency
    pub fn record_success(&self, latency: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_latency_ms.store(
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        *self.last_check.write() = Some(Utc::now());

        if !self.healthy.swap(true, Ordering::Relaxed) {
            info!(backend = %self.name, "Backend recovered");
        }
    }

    /// Extend the failure streak
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_check.write() = Some(Utc::now());

        if consecutive >= UNHEALTHY_AFTER && self.healthy.swap(false, Ordering::Relaxed) {
            warn!(
                backend = %self.name,
                consecutive_failures = consecutive,
                "Backend marked unhealthy"
            );
        }
    }

    /// Whether the failure streak is below the threshold
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Time of the last recorded outcome
    #[must_use]
    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.last_check.read()
    }

    /// Counters as reported by `/health`
    #[must_use]
    pub fn metrics(&self) -> HealthMetrics {
        HealthMetrics {
            healthy: self.is_healthy(),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
            last_check: self.last_check(),
        }
    }
}

/// Point-in-time copy of a tracker
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Healthy flag
    pub healthy: bool,
    /// Completed calls
    pub success_count: u64,
    /// Transport failures
    pub failure_count: u64,
    /// Current failure streak
    pub consecutive_failures: u64,
    /// Latency of the last success (milliseconds)
    pub last_latency_ms: u64,
    /// Time of the last recorded outcome
    pub last_check: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_records_latency_and_check_time() {
        let tracker = HealthTracker::new("test-backend");
        assert!(tracker.is_healthy());
        assert!(tracker.last_check().is_none());

        tracker.record_success(Duration::from_millis(50));

        let metrics = tracker.metrics();
        assert!(metrics.healthy);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.last_latency_ms, 50);
        assert!(metrics.last_check.is_some());
    }

    #[test]
    fn third_failure_in_a_row_marks_unhealthy() {
        let tracker = HealthTracker::new("test-backend");

        tracker.record_failure();
        tracker.record_failure();
        assert!(tracker.is_healthy());

        tracker.record_failure();
        assert!(!tracker.is_healthy());
        assert_eq!(tracker.metrics().consecutive_failures, 3);
    }

    #[test]
    fn one_success_restores_health() {
        let tracker = HealthTracker::new("test-backend");
        for _ in 0..3 {
            tracker.record_failure();
        }
        assert!(!tracker.is_healthy());

        tracker.record_success(Duration::from_millis(5));
        assert!(tracker.is_healthy());
        assert_eq!(tracker.metrics().consecutive_failures, 0);
        assert_eq!(tracker.metrics().failure_count, 3);
    }
}

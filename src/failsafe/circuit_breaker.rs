//! Circuit breaker implementation
//!
//! Closed → open after `failure_threshold` consecutive failures. Open for
//! `reset_timeout`, then half-open: exactly one probe is admitted at a time
//! until `success_threshold` probes succeed (closed) or one fails (open).

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (admitting a single probe)
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for backend protection
pub struct CircuitBreaker {
    /// Backend name
    name: String,
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            reset_timeout: config.reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn reset_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .is_none_or(|at| at.elapsed() >= self.reset_timeout)
    }

    /// Take a permit for one call
    ///
    /// In half-open state only one permit is outstanding at a time; it is
    /// returned by the next `record_success` or `record_failure`.
    #[tracing::instrument(skip(self), fields(backend = %self.name))]
    pub fn try_acquire(&self) -> bool {
        if !self.enabled {
            return true;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.reset_elapsed(&inner) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    debug!("Reset timeout elapsed, admitting probe");
                    true
                } else {
                    tracing::trace!("Circuit open, rejecting request");
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Whether a call would currently be admitted, without taking a permit
    #[must_use]
    pub fn can_proceed(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.reset_elapsed(&inner),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Record a successful request
    #[tracing::instrument(skip(self), fields(backend = %self.name))]
    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.successes += 1;
                if inner.successes >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => tracing::trace!("Success recorded in open state (ignored)"),
        }
    }

    /// Record a failed request
    #[tracing::instrument(skip(self), fields(backend = %self.name))]
    pub fn record_failure(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                debug!(failures = inner.failures, threshold = self.failure_threshold, "Failure in closed state");
                if inner.failures >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => tracing::trace!("Failure recorded in open state (ignored)"),
        }
    }

    /// Get current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn transition(&self, inner: &mut Inner, new_state: CircuitState) {
        if inner.state == new_state {
            return;
        }
        inner.state = new_state;

        match new_state {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.successes = 0;
                inner.opened_at = None;
                info!(backend = %self.name, "Circuit breaker closed");
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.successes = 0;
                warn!(backend = %self.name, failures = inner.failures, "Circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                inner.successes = 0;
                debug!(backend = %self.name, "Circuit breaker half-open");
            }
        }
    }
}

//! Periodic backend health monitoring

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::CircuitState;
use crate::backend::{Backend, Supervisor};
use crate::config::HealthCheckConfig;

/// Outcome of checking one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Probe succeeded
    Healthy,
    /// Probe failed; backend still within tolerance
    Failed,
    /// Circuit refused the probe
    Skipped,
    /// Backend was restarted
    Restarted,
    /// Backend was killed and retired
    Retired,
}

/// Probes every supervised backend on a fixed interval
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    interval: Duration,
    timeout: Duration,
    malformed_frame_limit: u64,
    enabled: bool,
}

impl HealthMonitor {
    /// Create a monitor over the supervisor's backends
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>, config: &HealthCheckConfig) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            interval: config.interval,
            timeout: config.timeout,
            malformed_frame_limit: config.malformed_frame_limit,
            enabled: config.enabled,
        })
    }

    /// Run until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.enabled {
            debug!("Health monitor disabled");
            return;
        }

        info!(interval_secs = self.interval.as_secs(), "Health monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                () = cancel.cancelled() => {
                    info!("Health monitor stopped");
                    return;
                }
            }
        }
    }

    /// Check every backend concurrently
    pub async fn check_all(&self) -> Vec<(String, CheckOutcome)> {
        let backends = self.supervisor.list_all();
        let outcomes = join_all(backends.iter().map(|b| self.check(b))).await;
        backends
            .iter()
            .map(|b| b.id().to_string())
            .zip(outcomes)
            .collect()
    }

    /// Check one backend: retire it on protocol garbage, probe it, and
    /// restart it if it is unhealthy while its circuit is not open
    ///
    /// While the circuit is open, recovery is left to its half-open trial.
    pub async fn check(&self, backend: &Arc<Backend>) -> CheckOutcome {
        let id = backend.id();

        let malformed = backend.transport().malformed_frames();
        if malformed > self.malformed_frame_limit {
            error!(backend = %id, malformed, limit = self.malformed_frame_limit, "Too many malformed frames");
            self.supervisor.kill(id).await;
            return CheckOutcome::Retired;
        }

        match backend.probe(self.timeout).await {
            None => {
                debug!(backend = %id, "Circuit open, probe skipped");
                CheckOutcome::Skipped
            }
            Some(true) => CheckOutcome::Healthy,
            Some(false) if backend.is_healthy() => CheckOutcome::Failed,
            Some(false) if backend.failsafe().circuit_breaker.state() == CircuitState::Open => {
                debug!(backend = %id, "Backend unhealthy with circuit open, not restarting");
                CheckOutcome::Failed
            }
            Some(false) => {
                warn!(backend = %id, circuit = ?backend.failsafe().circuit_breaker.state(), "Backend unhealthy, restarting");
                match self.supervisor.restart(id).await {
                    Ok(_) => CheckOutcome::Restarted,
                    Err(e) => {
                        warn!(backend = %id, error = %e, "Restart failed");
                        if self.supervisor.is_retired(id) {
                            CheckOutcome::Retired
                        } else {
                            CheckOutcome::Failed
                        }
                    }
                }
            }
        }
    }

    /// React to a failed forwarded call
    ///
    /// Schedules an immediate check unless the backend's circuit is already
    /// open (the breaker then paces further attempts).
    pub fn on_call_failure(self: &Arc<Self>, id: &str) {
        let Some(backend) = self.supervisor.get(id) else {
            return;
        };
        if backend.failsafe().circuit_breaker.state() == CircuitState::Open {
            return;
        }
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = monitor.check(&backend).await;
            debug!(backend = %backend.id(), ?outcome, "Checked backend after call failure");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendDescriptor, Launch};
    use crate::config::FailsafeConfig;
    use crate::protocol::{JsonRpcResponse, RequestId};
    use crate::transport::Transport;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct ScriptedTransport {
        ok: AtomicBool,
        malformed: AtomicU64,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn request(&self, _m: &str, _p: Option<Value>, _t: Duration) -> Result<JsonRpcResponse> {
            if self.ok.load(Ordering::Relaxed) {
                Ok(JsonRpcResponse::success(RequestId::Number(1.into()), Value::Null))
            } else {
                Err(Error::Timeout("ping".into()))
            }
        }
        async fn notify(&self, _m: &str, _p: Option<Value>) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn malformed_frames(&self) -> u64 {
            self.malformed.load(Ordering::Relaxed)
        }
    }

    fn setup(max_restarts: u32) -> (Arc<Supervisor>, Arc<HealthMonitor>) {
        setup_with_breaker(max_restarts, FailsafeConfig::default().circuit_breaker.failure_threshold)
    }

    fn setup_with_breaker(max_restarts: u32, failure_threshold: u32) -> (Arc<Supervisor>, Arc<HealthMonitor>) {
        let mut failsafe = FailsafeConfig::default();
        failsafe.supervisor.max_restarts = max_restarts;
        failsafe.circuit_breaker.failure_threshold = failure_threshold;
        let supervisor = Supervisor::new(failsafe, CancellationToken::new());
        let monitor = HealthMonitor::new(Arc::clone(&supervisor), &HealthCheckConfig::default());
        (supervisor, monitor)
    }

    fn descriptor() -> Arc<BackendDescriptor> {
        Arc::new(BackendDescriptor::new(
            "b",
            "b.",
            Launch::Http {
                url: "http://127.0.0.1:9/mcp".into(),
            },
        ))
    }

    #[tokio::test]
    async fn healthy_backend_passes() {
        let (sup, monitor) = setup(5);
        let backend = sup
            .install(
                descriptor(),
                Arc::new(ScriptedTransport {
                    ok: AtomicBool::new(true),
                    malformed: AtomicU64::new(0),
                }),
            )
            .await;

        assert_eq!(monitor.check(&backend).await, CheckOutcome::Healthy);
        assert!(backend.status().last_check.is_some());
    }

    #[tokio::test]
    async fn malformed_flood_kills_and_retires() {
        // GIVEN: a backend that emitted more garbage than tolerated
        let (sup, monitor) = setup(5);
        let backend = sup
            .install(
                descriptor(),
                Arc::new(ScriptedTransport {
                    ok: AtomicBool::new(true),
                    malformed: AtomicU64::new(21),
                }),
            )
            .await;

        // WHEN: the monitor checks it
        let outcome = monitor.check(&backend).await;

        // THEN: it is removed and retired
        assert_eq!(outcome, CheckOutcome::Retired);
        assert!(sup.get("b").is_none());
        assert!(sup.is_retired("b"));
    }

    fn failing() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            ok: AtomicBool::new(false),
            malformed: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn unhealthy_backend_with_open_circuit_is_not_restarted() {
        // GIVEN: default thresholds, where the third failed probe both opens
        // the circuit and marks the backend unhealthy
        let (sup, monitor) = setup(5);
        let backend = sup.install(descriptor(), failing()).await;

        // WHEN: three probes fail
        for _ in 0..3 {
            assert_eq!(monitor.check(&backend).await, CheckOutcome::Failed);
        }

        // THEN: the breaker holds the backend; the handle is the same one
        assert_eq!(backend.failsafe().circuit_breaker.state(), CircuitState::Open);
        assert!(!backend.is_healthy());
        let current = sup.get("b").unwrap();
        assert!(Arc::ptr_eq(&current, &backend));
        assert_eq!(current.restart_count(), 0);
        assert!(!sup.is_retired("b"));

        // AND: further checks are skipped while the circuit is open
        assert_eq!(monitor.check(&backend).await, CheckOutcome::Skipped);
    }

    #[tokio::test]
    async fn unhealthy_backend_at_ceiling_is_retired() {
        // Breaker stays closed so the unhealthy verdict triggers a restart
        let (sup, monitor) = setup_with_breaker(0, 10);
        let backend = sup
            .install(
                descriptor(),
                Arc::new(ScriptedTransport {
                    ok: AtomicBool::new(false),
                    malformed: AtomicU64::new(0),
                }),
            )
            .await;

        assert_eq!(monitor.check(&backend).await, CheckOutcome::Failed);
        assert_eq!(monitor.check(&backend).await, CheckOutcome::Failed);
        assert_eq!(monitor.check(&backend).await, CheckOutcome::Retired);
        assert!(sup.is_retired("b"));
    }
}

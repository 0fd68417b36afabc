//! Backend management

mod descriptor;
mod supervisor;

pub use descriptor::{BackendDescriptor, DEFAULT_CALL_TIMEOUT, Launch};
pub use supervisor::Supervisor;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::FailsafeConfig;
use crate::failsafe::{CircuitState, Failsafe, RetryPolicy};
use crate::transport::{Transport, call_with_retry};
use crate::{Error, Result};

/// Live binding of a descriptor to a transport
///
/// Created by the supervisor on spawn and on every restart; a restart
/// replaces the whole handle and carries `restart_count` over.
pub struct Backend {
    /// What this handle runs
    descriptor: Arc<BackendDescriptor>,
    /// Transport
    transport: Arc<dyn Transport>,
    /// Failsafe mechanisms
    failsafe: Failsafe,
    /// Restarts so far for this backend id
    restart_count: u32,
    /// When this handle was created
    started_at: DateTime<Utc>,
    /// Forwarded calls
    request_count: AtomicU64,
    /// Cancels the exit watcher
    cancel: CancellationToken,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("descriptor", &self.descriptor)
            .field("restart_count", &self.restart_count)
            .field("started_at", &self.started_at)
            .field("request_count", &self.request_count)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Bind a descriptor to a connected transport
    #[must_use]
    pub fn new(
        descriptor: Arc<BackendDescriptor>,
        transport: Arc<dyn Transport>,
        failsafe_config: &FailsafeConfig,
        restart_count: u32,
    ) -> Self {
        Self {
            failsafe: Failsafe::new(&descriptor.id, failsafe_config),
            descriptor,
            transport,
            restart_count,
            started_at: Utc::now(),
            request_count: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Backend id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Descriptor this handle was launched from
    #[must_use]
    pub fn descriptor(&self) -> &Arc<BackendDescriptor> {
        &self.descriptor
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Failsafe mechanisms
    #[must_use]
    pub fn failsafe(&self) -> &Failsafe {
        &self.failsafe
    }

    /// Restarts so far for this backend id
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Whether the transport can take calls
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.transport.is_connected()
    }

    /// Whether recent calls and probes succeed
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.failsafe.health_tracker.is_healthy()
    }

    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Forward a call with readiness check, circuit breaker and retries
    ///
    /// An error response from the backend counts as a healthy exchange.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the backend is not ready or its
    /// circuit is open, the backend's own error as `Error::JsonRpc`, or the
    /// transport failure once retries are exhausted.
    #[tracing::instrument(skip(self, params, retry), fields(backend = %self.descriptor.id))]
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        retry: &RetryPolicy,
    ) -> Result<Value> {
        if !self.is_running() {
            return Err(Error::BackendUnavailable(format!(
                "Backend '{}' is not running",
                self.descriptor.id
            )));
        }
        if !self.failsafe.circuit_breaker.try_acquire() {
            return Err(Error::BackendUnavailable(format!(
                "Backend '{}' circuit is open",
                self.descriptor.id
            )));
        }

        self.request_count.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = call_with_retry(
            self.transport.as_ref(),
            method,
            params,
            self.descriptor.timeout,
            retry,
        )
        .await;
        let latency = start.elapsed();

        match &result {
            Ok(_) | Err(Error::JsonRpc { .. }) => {
                debug!(latency_ms = latency.as_millis() as u64, "Call completed");
                self.failsafe.record_success(latency);
            }
            Err(e) => {
                debug!(error = %e, latency_ms = latency.as_millis() as u64, "Call failed");
                self.failsafe.record_failure();
            }
        }

        result
    }

    /// Ping the backend if its circuit admits a probe
    ///
    /// Returns `None` when the circuit refused the probe, otherwise whether
    /// the ping succeeded. The outcome is recorded either way.
    pub async fn probe(&self, timeout: Duration) -> Option<bool> {
        if !self.failsafe.circuit_breaker.try_acquire() {
            return None;
        }

        let start = Instant::now();
        let outcome = match self.transport.request("ping", None, timeout).await {
            Ok(response) => match response.into_result() {
                Ok(_) | Err(Error::JsonRpc { .. }) => Ok(()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.failsafe.record_success(start.elapsed());
                Some(true)
            }
            Err(e) => {
                debug!(backend = %self.descriptor.id, error = %e, "Health probe failed");
                self.failsafe.record_failure();
                Some(false)
            }
        }
    }

    /// Get backend status
    #[must_use]
    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            id: self.descriptor.id.clone(),
            namespace: self.descriptor.namespace.clone(),
            transport: self.descriptor.launch.transport_type().to_string(),
            running: self.is_running(),
            healthy: self.is_healthy(),
            circuit_state: self.failsafe.circuit_breaker.state(),
            restart_count: self.restart_count,
            request_count: self.request_count.load(Ordering::Relaxed),
            malformed_frames: self.transport.malformed_frames(),
            started_at: self.started_at,
            last_check: self.failsafe.health_tracker.last_check(),
        }
    }
}

/// Backend status information
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    /// Backend id
    pub id: String,
    /// Namespace prefix
    pub namespace: String,
    /// Transport type
    pub transport: String,
    /// Whether the transport can take calls
    pub running: bool,
    /// Health tracker verdict
    pub healthy: bool,
    /// Circuit breaker state
    pub circuit_state: CircuitState,
    /// Restarts so far
    pub restart_count: u32,
    /// Forwarded calls on this handle
    pub request_count: u64,
    /// Unparseable frames received
    pub malformed_frames: u64,
    /// When this handle was created
    pub started_at: DateTime<Utc>,
    /// Last probe or call outcome
    pub last_check: Option<DateTime<Utc>>,
}

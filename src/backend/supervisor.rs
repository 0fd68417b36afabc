//! Backend supervisor
//!
//! Owns the handle table (backend id → live [`Backend`]). Each handle has an
//! exit watcher; when its transport's connection ends unexpectedly the
//! supervisor relaunches it after a fixed backoff, up to `max_restarts`
//! times, then retires the id. Retired ids fail fast until `spawn` is
//! called for them again.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Backend, BackendDescriptor, Launch};
use crate::config::FailsafeConfig;
use crate::transport::{HttpTransport, StdioTransport, Transport};
use crate::{Error, Result};

/// Spawns, restarts and retires backends
pub struct Supervisor {
    /// Live handles by backend id
    handles: DashMap<String, Arc<Backend>>,
    /// Ids that exhausted their restarts
    retired: DashSet<String>,
    /// Serializes launches per id
    launching: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Failsafe settings for new handles
    failsafe: FailsafeConfig,
    /// Cancelled at gateway shutdown
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor
    #[must_use]
    pub fn new(failsafe: FailsafeConfig, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            handles: DashMap::new(),
            retired: DashSet::new(),
            launching: DashMap::new(),
            failsafe,
            shutdown,
        })
    }

    /// Launch a backend, clearing any earlier retirement
    ///
    /// Returns the existing handle if one is already registered.
    ///
    /// # Errors
    ///
    /// Returns the launch error (spawn failure, handshake failure).
    pub async fn spawn(self: &Arc<Self>, descriptor: Arc<BackendDescriptor>) -> Result<Arc<Backend>> {
        self.retired.remove(&descriptor.id);
        self.ensure(descriptor).await
    }

    /// Return the handle for a backend, launching it if absent
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the id is retired, or the
    /// launch error.
    pub async fn ensure(self: &Arc<Self>, descriptor: Arc<BackendDescriptor>) -> Result<Arc<Backend>> {
        if let Some(existing) = self.get(&descriptor.id) {
            return Ok(existing);
        }

        let lock = Arc::clone(
            self.launching
                .entry(descriptor.id.clone())
                .or_default()
                .value(),
        );
        let _guard = lock.lock().await;

        if self.is_retired(&descriptor.id) {
            return Err(retired_error(&descriptor.id));
        }
        if let Some(existing) = self.get(&descriptor.id) {
            return Ok(existing);
        }

        let backend = self.launch(&descriptor, 0).await?;
        self.handles
            .insert(descriptor.id.clone(), Arc::clone(&backend));
        self.watch(&backend);
        info!(backend = %descriptor.id, transport = descriptor.launch.transport_type(), "Backend started");
        Ok(backend)
    }

    /// Register a pre-built transport as a backend
    ///
    /// Replaces any existing handle for the id.
    pub async fn install(
        self: &Arc<Self>,
        descriptor: Arc<BackendDescriptor>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Backend> {
        self.retired.remove(&descriptor.id);
        let backend = Arc::new(Backend::new(descriptor, transport, &self.failsafe, 0));
        if let Some(old) = self
            .handles
            .insert(backend.id().to_string(), Arc::clone(&backend))
        {
            close(&old).await;
        }
        self.watch(&backend);
        backend
    }

    /// Stop a backend without restarting it
    ///
    /// Idempotent; the process is killed before the handle is dropped.
    pub async fn stop(&self, id: &str) {
        if let Some((_, backend)) = self.handles.remove(id) {
            close(&backend).await;
            info!(backend = %id, "Backend stopped");
        }
    }

    /// Force-kill a backend and retire its id
    pub async fn kill(&self, id: &str) {
        self.retired.insert(id.to_string());
        self.stop(id).await;
        telemetry_metrics::counter!("gateway_backend_retired_total").increment(1);
        error!(backend = %id, "Backend killed and retired");
    }

    /// Restart a backend, counting toward its restart ceiling
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the backend is unknown, was
    /// stopped meanwhile, or is retired by this restart.
    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<Arc<Backend>> {
        let current = self
            .get(id)
            .ok_or_else(|| Error::BackendUnavailable(format!("Backend '{id}' is not running")))?;
        self.recover(current, Duration::ZERO).await
    }

    /// Get a backend handle
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.handles.get(id).map(|b| Arc::clone(b.value()))
    }

    /// All backend handles, sorted by id
    #[must_use]
    pub fn list_all(&self) -> Vec<Arc<Backend>> {
        let mut all: Vec<Arc<Backend>> = self.handles.iter().map(|b| Arc::clone(b.value())).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Whether a backend has a handle that can take calls
    #[must_use]
    pub fn is_running(&self, id: &str) -> bool {
        self.handles.get(id).is_some_and(|b| b.is_running())
    }

    /// Whether a backend exhausted its restarts
    #[must_use]
    pub fn is_retired(&self, id: &str) -> bool {
        self.retired.contains(id)
    }

    /// Stop every backend
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.handles.iter().map(|b| b.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Stop backends whose ids are not in `keep`
    pub async fn retain(&self, keep: &[&str]) {
        let stale: Vec<String> = self
            .handles
            .iter()
            .map(|b| b.key().clone())
            .filter(|id| !keep.contains(&id.as_str()))
            .collect();
        for id in stale {
            self.stop(&id).await;
        }
    }

    /// Start the transport for a descriptor
    async fn launch(&self, descriptor: &Arc<BackendDescriptor>, restart_count: u32) -> Result<Arc<Backend>> {
        let transport: Arc<dyn Transport> = match &descriptor.launch {
            Launch::Process { command, args, cwd } => {
                StdioTransport::spawn(
                    &descriptor.id,
                    command,
                    args,
                    cwd.as_deref(),
                    &descriptor.env,
                    descriptor.timeout,
                )
                .await?
            }
            Launch::Http { url } => {
                let transport = HttpTransport::new(&descriptor.id, url, &descriptor.headers)?;
                // Unreachable at startup is not fatal; the health monitor
                // marks it running once a probe gets through
                if let Err(e) = transport.initialize(descriptor.timeout).await {
                    warn!(backend = %descriptor.id, error = %e, "HTTP backend not reachable yet");
                }
                transport
            }
        };

        Ok(Arc::new(Backend::new(
            Arc::clone(descriptor),
            transport,
            &self.failsafe,
            restart_count,
        )))
    }

    /// Watch a handle's transport and recover it when the connection ends
    fn watch(self: &Arc<Self>, backend: &Arc<Backend>) {
        let supervisor: Weak<Self> = Arc::downgrade(self);
        let backend = Arc::clone(backend);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let code = tokio::select! {
                code = backend.transport().closed() => code,
                () = backend.cancelled() => return,
                () = shutdown.cancelled() => return,
            };
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            warn!(backend = %backend.id(), code = ?code, "Backend exited unexpectedly");
            let backoff = supervisor.failsafe.supervisor.restart_backoff;
            if let Err(e) = supervisor.recover(backend, backoff).await {
                warn!(error = %e, "Backend not recovered");
            }
        });
    }

    /// Replace a dead or unhealthy handle, or retire it at the ceiling
    ///
    /// A failed relaunch counts as another crash.
    async fn recover(self: &Arc<Self>, old: Arc<Backend>, backoff: Duration) -> Result<Arc<Backend>> {
        let id = old.id().to_string();
        let max_restarts = self.failsafe.supervisor.max_restarts;
        old.shutdown();
        close(&old).await;

        let mut count = old.restart_count();
        loop {
            if !self.is_current(&id, &old) {
                return Err(Error::BackendUnavailable(format!("Backend '{id}' was stopped")));
            }

            if count >= max_restarts {
                self.retire(&id, &old);
                return Err(retired_error(&id));
            }

            count += 1;
            telemetry_metrics::counter!("gateway_backend_restarts_total").increment(1);
            warn!(backend = %id, attempt = count, max_restarts, "Restarting backend");

            if !backoff.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    () = self.shutdown.cancelled() => {
                        return Err(Error::BackendUnavailable("Gateway shutting down".to_string()));
                    }
                }
            }

            let fresh = match self.launch(old.descriptor(), count).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(backend = %id, attempt = count, error = %e, "Relaunch failed");
                    continue;
                }
            };

            let swapped = match self.handles.get_mut(&id) {
                Some(mut entry) if Arc::ptr_eq(entry.value(), &old) => {
                    *entry = Arc::clone(&fresh);
                    true
                }
                _ => false,
            };
            if !swapped {
                close(&fresh).await;
                return Err(Error::BackendUnavailable(format!("Backend '{id}' was stopped")));
            }

            self.watch(&fresh);
            info!(backend = %id, restart_count = count, "Backend restarted");
            return Ok(fresh);
        }
    }

    fn is_current(&self, id: &str, backend: &Arc<Backend>) -> bool {
        self.handles
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), backend))
    }

    fn retire(&self, id: &str, backend: &Arc<Backend>) {
        let removed = self
            .handles
            .remove_if(id, |_, current| Arc::ptr_eq(current, backend));
        if removed.is_some() {
            self.retired.insert(id.to_string());
            telemetry_metrics::counter!("gateway_backend_retired_total").increment(1);
            error!(
                backend = %id,
                restarts = backend.restart_count(),
                "Backend exceeded restart ceiling, retired"
            );
        }
    }
}

fn retired_error(id: &str) -> Error {
    Error::BackendUnavailable(format!("Backend '{id}' is retired after repeated crashes"))
}

async fn close(backend: &Backend) {
    backend.shutdown();
    if let Err(e) = backend.transport().close().await {
        warn!(backend = %backend.id(), error = %e, "Failed to close transport");
    }
}

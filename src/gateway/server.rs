//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::orchestrator::{BackendSource, Orchestrator, OrchestratorParts};
use super::router::{AppState, create_router};
use crate::audit::{AuditSink, HttpAuditSink, TracingAuditSink};
use crate::backend::{BackendDescriptor, Supervisor};
use crate::config::Config;
use crate::failsafe::{HealthMonitor, RetryPolicy};
use crate::namespace::NamespaceResolver;
use crate::policy::{AuthorizationCache, HttpDecisionService, PolicyEnforcer};
use crate::registry::{DynamicRegistry, HttpRegistryClient};
use crate::{Error, Result};

/// Policy gateway server
pub struct Gateway {
    config: Config,
    static_backends: Vec<Arc<BackendDescriptor>>,
    supervisor: Arc<Supervisor>,
    monitor: Arc<HealthMonitor>,
    cache: Arc<AuthorizationCache>,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build a gateway from validated configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        let descriptors = config.validate()?;
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor::new(config.failsafe.clone(), shutdown.clone());
        let monitor = HealthMonitor::new(Arc::clone(&supervisor), &config.failsafe.health_check);

        let decision_url = config
            .policy
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Config("policy.base_url is required".to_string()))?;
        let decisions = HttpDecisionService::new(decision_url, config.policy.token.clone(), config.policy.timeout)?;
        let cache = Arc::new(AuthorizationCache::new(config.policy.default_ttl));
        let enforcer = Arc::new(PolicyEnforcer::new(
            config.gateway.id.clone(),
            Arc::new(decisions),
            Arc::clone(&cache),
            config.policy.timeout,
        ));

        let audit: Arc<dyn AuditSink> = match config.audit.url.as_deref() {
            Some(url) => HttpAuditSink::new(url, config.audit.token.clone(), config.audit.timeout)?,
            None => Arc::new(TracingAuditSink),
        };

        let (source, static_backends) = if config.registry.enabled {
            let url = config
                .registry
                .base_url
                .as_deref()
                .ok_or_else(|| Error::Config("registry.base_url is required".to_string()))?;
            let client = HttpRegistryClient::new(url, config.registry.token.clone(), config.registry.timeout)?;
            let registry = DynamicRegistry::new(
                Arc::new(client),
                config.registry.tenant_ttl,
                config.registry.catalog_ttl,
            )
            .with_stale_grace(config.registry.stale_grace);
            (BackendSource::Dynamic(Arc::new(registry)), Vec::new())
        } else {
            let resolver = Arc::new(NamespaceResolver::new(descriptors)?);
            let backends = resolver.descriptors().to_vec();
            (BackendSource::Static(resolver), backends)
        };

        let orchestrator = Arc::new(Orchestrator::new(OrchestratorParts {
            kernel_id: config.gateway.id.clone(),
            version: config.gateway.version.clone(),
            source,
            supervisor: Arc::clone(&supervisor),
            enforcer,
            audit,
            monitor: Arc::clone(&monitor),
            retry: RetryPolicy::new(&config.failsafe.retry),
            trial_fallback: config.routing.trial_fallback,
            uri_index_ttl: config.routing.uri_index_ttl,
        }));

        Ok(Self {
            config,
            static_backends,
            supervisor,
            monitor,
            cache,
            orchestrator,
            shutdown,
        })
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        for desc in &self.static_backends {
            if let Err(e) = self.supervisor.spawn(Arc::clone(desc)).await {
                warn!(backend = %desc.id, namespace = %desc.namespace, error = %e, "Backend failed to start");
            }
        }

        tokio::spawn(Arc::clone(&self.monitor).run(self.shutdown.child_token()));
        tokio::spawn(
            Arc::clone(&self.cache).run_sweeper(self.config.policy.sweep_interval, self.shutdown.child_token()),
        );
        tokio::spawn(
            Arc::clone(&self.orchestrator)
                .run_sweeper(self.config.routing.sweep_interval, self.shutdown.child_token()),
        );

        let state = Arc::new(AppState {
            orchestrator: Arc::clone(&self.orchestrator),
            default_tenant: self.config.tenant_id.clone(),
            max_body_size: self.config.server.max_body_size,
            request_timeout: self.config.server.request_timeout,
            #[cfg(feature = "metrics")]
            prometheus: install_prometheus(),
        });
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("POLICY GATEWAY v{}", self.config.gateway.version);
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, kernel = %self.config.gateway.id, "Listening");
        if self.config.registry.enabled {
            info!("Backends: per-tenant from registry");
        } else {
            info!(backends = self.static_backends.len(), "Backends: static configuration");
        }
        match &self.config.tenant_id {
            Some(tenant) => info!(tenant = %tenant, "Default tenant"),
            None => info!("No default tenant, x-tenant-id header required"),
        }
        info!("============================================================");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutting down backends...");
        let drain = self.supervisor.stop_all();
        if tokio::time::timeout(self.config.server.shutdown_timeout, drain).await.is_err() {
            warn!("Backend shutdown timed out");
        }

        Ok(())
    }
}

#[cfg(feature = "metrics")]
fn install_prometheus() -> Option<metrics_exporter_prometheus::PrometheusHandle> {
    match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

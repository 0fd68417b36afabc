//! Dynamic per-tenant backend registry
//!
//! In registry mode each tenant's backend set comes from the registry
//! service instead of static configuration. Managed backends are resolved
//! against the connector catalog into process launches. Descriptor ids are
//! scoped as `tenant/id` so tenants never share a process.

mod client;

pub use client::{BackendMode, BackendSpec, CatalogEntry, HttpRegistryClient, RegistryService};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Result;
use crate::backend::{BackendDescriptor, Launch};
use crate::namespace::{NamespaceResolver, normalize_namespace};

struct TenantSet {
    resolver: Arc<NamespaceResolver>,
    fetched_at: Instant,
}

struct Catalog {
    entries: Arc<HashMap<String, CatalogEntry>>,
    fetched_at: Instant,
}

/// Default time a lapsed tenant set is kept before eviction
const DEFAULT_STALE_GRACE: Duration = Duration::from_secs(900);

/// Per-tenant descriptor sets with TTL caching
pub struct DynamicRegistry {
    service: Arc<dyn RegistryService>,
    tenant_ttl: Duration,
    catalog_ttl: Duration,
    stale_grace: Duration,
    tenants: DashMap<String, TenantSet>,
    catalog: RwLock<Option<Catalog>>,
}

impl DynamicRegistry {
    /// Create a registry over a registry service
    #[must_use]
    pub fn new(service: Arc<dyn RegistryService>, tenant_ttl: Duration, catalog_ttl: Duration) -> Self {
        Self {
            service,
            tenant_ttl,
            catalog_ttl,
            stale_grace: DEFAULT_STALE_GRACE,
            tenants: DashMap::new(),
            catalog: RwLock::new(None),
        }
    }

    /// Keep lapsed tenant sets this long before [`Self::evict_stale`] drops them
    #[must_use]
    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    /// Namespace resolver for a tenant's backends
    ///
    /// Served from cache while fresh. When a refresh fails and a stale set
    /// exists, the stale set is served.
    pub async fn resolver(&self, tenant: &str) -> Result<Arc<NamespaceResolver>> {
        let stale = match self.cached_tenant(tenant) {
            Some((resolver, true)) => return Ok(resolver),
            Some((resolver, false)) => Some(resolver),
            None => None,
        };

        match self.fetch_tenant(tenant).await {
            Ok(resolver) => {
                let resolver = Arc::new(resolver);
                self.tenants.insert(
                    tenant.to_string(),
                    TenantSet {
                        resolver: Arc::clone(&resolver),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(resolver)
            }
            Err(e) => match stale {
                Some(resolver) => {
                    warn!(tenant = %tenant, error = %e, "Registry refresh failed, serving stale backend set");
                    Ok(resolver)
                }
                None => Err(e),
            },
        }
    }

    /// A tenant's backend descriptors
    pub async fn descriptors(&self, tenant: &str) -> Result<Vec<Arc<BackendDescriptor>>> {
        Ok(self.resolver(tenant).await?.descriptors().to_vec())
    }

    /// Drop a tenant's cached set
    pub fn invalidate(&self, tenant: &str) {
        if self.tenants.remove(tenant).is_some() {
            debug!(tenant = %tenant, "Tenant backend set invalidated");
        }
    }

    /// Evict tenant sets older than TTL plus grace
    ///
    /// Returns the evicted tenants with the sets they held, so their
    /// backends can be stopped.
    pub fn evict_stale(&self) -> Vec<(String, Arc<NamespaceResolver>)> {
        let horizon = self.tenant_ttl.saturating_add(self.stale_grace);
        let expired: Vec<String> = self
            .tenants
            .iter()
            .filter(|set| set.fetched_at.elapsed() >= horizon)
            .map(|set| set.key().clone())
            .collect();

        let evicted: Vec<(String, Arc<NamespaceResolver>)> = expired
            .into_iter()
            .filter_map(|tenant| {
                self.tenants
                    .remove_if(&tenant, |_, set| set.fetched_at.elapsed() >= horizon)
                    .map(|(tenant, set)| (tenant, set.resolver))
            })
            .collect();
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Evicted stale tenant backend sets");
        }
        evicted
    }

    /// Drop the cached catalog
    pub fn invalidate_catalog(&self) {
        *self.catalog.write() = None;
    }

    /// Tenants with a cached set
    #[must_use]
    pub fn cached_tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.tenants.iter().map(|e| e.key().clone()).collect();
        tenants.sort_unstable();
        tenants
    }

    /// Cached resolver and whether it is still fresh
    fn cached_tenant(&self, tenant: &str) -> Option<(Arc<NamespaceResolver>, bool)> {
        self.tenants.get(tenant).map(|set| {
            (
                Arc::clone(&set.resolver),
                set.fetched_at.elapsed() < self.tenant_ttl,
            )
        })
    }

    fn cached_catalog(&self) -> Option<(Arc<HashMap<String, CatalogEntry>>, bool)> {
        self.catalog.read().as_ref().map(|c| {
            (
                Arc::clone(&c.entries),
                c.fetched_at.elapsed() < self.catalog_ttl,
            )
        })
    }

    async fn fetch_tenant(&self, tenant: &str) -> Result<NamespaceResolver> {
        let specs = self.service.list_backends(tenant).await?;
        let catalog = if specs.iter().any(|s| matches!(s.mode, BackendMode::Managed { .. })) {
            match self.catalog().await {
                Ok(catalog) => Some(catalog),
                Err(e) => {
                    warn!(tenant = %tenant, error = %e, "Catalog unavailable, loading direct backends only");
                    None
                }
            }
        } else {
            None
        };

        let descriptors: Vec<BackendDescriptor> = specs
            .into_iter()
            .filter_map(|spec| {
                let id = spec.id.clone();
                to_descriptor(tenant, spec, catalog.as_deref())
                    .inspect_err(|reason| warn!(tenant = %tenant, backend = %id, reason = %reason, "Skipping registry backend"))
                    .ok()
            })
            .collect();

        let resolver = NamespaceResolver::lenient(descriptors);
        info!(tenant = %tenant, backends = resolver.len(), "Loaded tenant backend set");
        Ok(resolver)
    }

    async fn catalog(&self) -> Result<Arc<HashMap<String, CatalogEntry>>> {
        let stale = match self.cached_catalog() {
            Some((entries, true)) => return Ok(entries),
            Some((entries, false)) => Some(entries),
            None => None,
        };

        match self.service.list_catalog().await {
            Ok(entries) => {
                let entries: Arc<HashMap<String, CatalogEntry>> =
                    Arc::new(entries.into_iter().map(|e| (e.id.clone(), e)).collect());
                *self.catalog.write() = Some(Catalog {
                    entries: Arc::clone(&entries),
                    fetched_at: Instant::now(),
                });
                Ok(entries)
            }
            Err(e) => match stale {
                Some(entries) => {
                    warn!(error = %e, "Catalog refresh failed, serving stale catalog");
                    Ok(entries)
                }
                None => Err(e),
            },
        }
    }
}

/// Resolve one spec into a tenant-scoped descriptor
fn to_descriptor(
    tenant: &str,
    spec: BackendSpec,
    catalog: Option<&HashMap<String, CatalogEntry>>,
) -> std::result::Result<BackendDescriptor, String> {
    if spec.id.trim().is_empty() || spec.id.contains('/') {
        return Err(format!("invalid backend id '{}'", spec.id));
    }

    let (launch, declared, mut env) = match spec.mode {
        BackendMode::Direct { launch } => (launch, None, HashMap::new()),
        BackendMode::Managed { catalog_id, config } => {
            let entry = catalog
                .ok_or_else(|| "catalog unavailable".to_string())?
                .get(&catalog_id)
                .ok_or_else(|| format!("unknown catalog id '{catalog_id}'"))?;
            let mut env = entry.env.clone();
            env.extend(config_env(&config, entry.config_schema.as_ref()));
            let launch = Launch::Process {
                command: entry.command.clone(),
                args: entry.args.clone(),
                cwd: None,
            };
            (launch, entry.namespace.clone(), env)
        }
    };
    env.extend(spec.env);

    let raw = spec
        .namespace
        .or(declared)
        .ok_or_else(|| "no namespace".to_string())?;
    let namespace = normalize_namespace(&raw).ok_or_else(|| format!("invalid namespace '{raw}'"))?;
    let launch = launch.normalized().map_err(|e| e.to_string())?;

    let mut descriptor = BackendDescriptor::new(format!("{tenant}/{}", spec.id), namespace, launch);
    descriptor.env = env;
    descriptor.headers = spec.headers;
    Ok(descriptor)
}

/// Map tenant configuration values to environment variables
///
/// The variable name is the schema property's `env` field, or the
/// upper-snake-cased property name.
fn config_env(config: &Map<String, Value>, schema: Option<&Value>) -> HashMap<String, String> {
    let properties = schema.and_then(|s| s.get("properties"));
    config
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(name, value)| {
            let key = properties
                .and_then(|p| p.get(name))
                .and_then(|p| p.get("env"))
                .and_then(Value::as_str)
                .map_or_else(|| upper_snake(name), ToString::to_string);
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

fn upper_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c.to_ascii_uppercase());
        } else {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out
}

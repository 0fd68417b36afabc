//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendDescriptor, DEFAULT_CALL_TIMEOUT, Launch};
use crate::namespace::validate_namespaces;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Gateway identity reported to the decision and audit services
    pub gateway: GatewayIdentity,
    /// Static tenant used when a request carries no tenant header
    pub tenant_id: Option<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Failsafe configuration
    pub failsafe: FailsafeConfig,
    /// Static backend configurations
    pub backends: HashMap<String, BackendConfig>,
    /// Policy decision service
    pub policy: PolicyConfig,
    /// Dynamic per-tenant backend registry
    pub registry: RegistryConfig,
    /// Audit sink
    pub audit: AuditConfig,
    /// Request routing
    pub routing: RoutingConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("POLICY_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files first so their variables are visible to expansion
        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in URLs, headers, env values and tokens
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for backend in self.backends.values_mut() {
            for value in backend.headers.values_mut() {
                *value = expand_string(&re, value);
            }
            for value in backend.env.values_mut() {
                *value = expand_string(&re, value);
            }
            match &mut backend.transport {
                Launch::Http { url } => *url = expand_string(&re, url),
                Launch::Process { args, .. } => {
                    for arg in args.iter_mut() {
                        *arg = expand_string(&re, arg);
                    }
                }
            }
        }

        for value in [
            &mut self.policy.base_url,
            &mut self.policy.token,
            &mut self.registry.base_url,
            &mut self.registry.token,
            &mut self.audit.url,
            &mut self.audit.token,
        ]
        .into_iter()
        .flatten()
        {
            *value = expand_string(&re, value);
        }

        Ok(())
    }

    /// Get enabled backends only
    pub fn enabled_backends(&self) -> impl Iterator<Item = (&String, &BackendConfig)> {
        self.backends.iter().filter(|(_, b)| b.enabled)
    }

    /// Check the configuration and build the static backend descriptors
    ///
    /// Runs before anything reaches the supervisor; the gateway refuses to
    /// start on any error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a missing decision service URL, a registry
    /// without a URL, an invalid transport, or a missing, malformed,
    /// duplicated or overlapping namespace prefix.
    pub fn validate(&self) -> Result<Vec<BackendDescriptor>> {
        let decision_url = self.policy.base_url.as_deref().ok_or_else(|| {
            Error::Config(
                "policy.base_url is required (or set POLICY_GATEWAY_DECISION_URL)".to_string(),
            )
        })?;
        check_url("policy.base_url", decision_url)?;

        if self.registry.enabled {
            let registry_url = self.registry.base_url.as_deref().ok_or_else(|| {
                Error::Config("registry.base_url is required when registry is enabled".to_string())
            })?;
            check_url("registry.base_url", registry_url)?;
        }
        if let Some(url) = self.audit.url.as_deref() {
            check_url("audit.url", url)?;
        }

        validate_namespaces(
            self.enabled_backends()
                .map(|(id, b)| (id.as_str(), b.namespace.as_str())),
        )?;

        let mut descriptors = self
            .enabled_backends()
            .map(|(id, b)| b.to_descriptor(id))
            .collect::<Result<Vec<_>>>()?;
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));

        if descriptors.is_empty() && !self.registry.enabled {
            tracing::warn!("No backends configured and registry disabled");
        }

        Ok(descriptors)
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

fn check_url(field: &str, value: &str) -> Result<()> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| Error::Config(format!("{field}: invalid URL '{value}': {e}")))
}

/// Gateway identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayIdentity {
    /// Gateway (kernel) id sent with every authorization request and audit event
    pub id: String,
    /// Version reported by `/health` and `initialize`
    pub version: String,
}

impl Default for GatewayIdentity {
    fn default() -> Self {
        Self {
            id: "policy-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39400,
            request_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Failsafe configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailsafeConfig {
    /// Circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry settings
    pub retry: RetryConfig,
    /// Health check settings
    pub health_check: HealthCheckConfig,
    /// Process restart settings
    pub supervisor: SupervisorConfig,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Successes in half-open before closing
    pub success_threshold: u32,
    /// Time to stay open before admitting a probe
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Fixed delay between attempts
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            delay: Duration::from_millis(200),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable periodic health checks
    pub enabled: bool,
    /// Interval between checks
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Ping timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Malformed frames tolerated before a backend is killed and retired
    pub malformed_frame_limit: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            malformed_frame_limit: 20,
        }
    }
}

/// Process restart configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Restarts allowed before a backend is retired
    pub max_restarts: u32,
    /// Fixed wait before each relaunch
    #[serde(with = "humantime_serde")]
    pub restart_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_backoff: Duration::from_secs(1),
        }
    }
}

/// Policy decision service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Base URL of the decision service
    pub base_url: Option<String>,
    /// Bearer credential
    pub token: Option<String>,
    /// Hard deadline for one decision
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Cache TTL when a decision carries no `ttl_ms`
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Interval of the expired-entry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout: Duration::from_secs(5),
            default_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Dynamic registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Resolve backends per tenant from the registry service
    pub enabled: bool,
    /// Base URL of the registry service
    pub base_url: Option<String>,
    /// Bearer credential
    pub token: Option<String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// How long a tenant's backend set is cached
    #[serde(with = "humantime_serde")]
    pub tenant_ttl: Duration,
    /// How long the connector catalog is cached
    #[serde(with = "humantime_serde")]
    pub catalog_ttl: Duration,
    /// How long past its TTL a tenant set is kept as an outage fallback
    /// before the sweep evicts it and stops its backends
    #[serde(with = "humantime_serde")]
    pub stale_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            token: None,
            timeout: Duration::from_secs(10),
            tenant_ttl: Duration::from_secs(60),
            catalog_ttl: Duration::from_secs(3600),
            stale_grace: Duration::from_secs(900),
        }
    }
}

/// Audit sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Audit ingestion endpoint; events are only logged when unset
    pub url: Option<String>,
    /// Bearer credential
    pub token: Option<String>,
    /// Per-event delivery timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Try each backend in turn when a resource URI is not in the index
    pub trial_fallback: bool,
    /// How long a resource URI stays routed to the backend that listed it
    #[serde(with = "humantime_serde")]
    pub uri_index_ttl: Duration,
    /// Interval of the URI index and tenant set sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            trial_fallback: true,
            uri_index_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Whether this backend is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Transport configuration
    #[serde(flatten)]
    pub transport: Launch,
    /// Namespace prefix owned by this backend
    #[serde(default)]
    pub namespace: String,
    /// Per-call timeout
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Environment variables for process backends
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// HTTP headers for HTTP backends
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

impl BackendConfig {
    /// Build the descriptor for backend `id`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the transport is invalid.
    pub fn to_descriptor(&self, id: &str) -> Result<BackendDescriptor> {
        let launch = self
            .transport
            .clone()
            .normalized()
            .map_err(|e| Error::Config(format!("Backend '{id}': {e}")))?;
        Ok(BackendDescriptor {
            id: id.to_string(),
            namespace: self.namespace.clone(),
            launch,
            env: self.env.clone(),
            headers: self.headers.clone(),
            timeout: self.timeout,
        })
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// Bare numbers are seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        let s = s.trim();

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

//! Registry service client and wire types

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::backend::Launch;
use crate::{Error, Result};

/// How a tenant backend is launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendMode {
    /// Launched from a catalog entry with per-tenant configuration
    Managed {
        /// Catalog entry id
        catalog_id: String,
        /// Tenant configuration values
        #[serde(default)]
        config: Map<String, Value>,
    },
    /// Launched exactly as described
    Direct {
        /// Transport and target
        launch: Launch,
    },
}

/// A backend as delivered by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Tenant-local backend id
    pub id: String,
    /// Launch mode
    pub mode: BackendMode,
    /// Namespace prefix; managed backends fall back to the catalog's
    #[serde(default)]
    pub namespace: Option<String>,
    /// Extra environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Extra headers for HTTP backends
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A connector template in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Catalog id
    pub id: String,
    /// Program to launch
    pub command: String,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Fixed environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Declared namespace prefix
    #[serde(default)]
    pub namespace: Option<String>,
    /// JSON schema for tenant configuration
    #[serde(default)]
    pub config_schema: Option<Value>,
}

/// Source of tenant backend sets and the connector catalog
#[async_trait]
pub trait RegistryService: Send + Sync {
    /// Backends configured for a tenant
    async fn list_backends(&self, tenant: &str) -> Result<Vec<BackendSpec>>;

    /// The connector catalog
    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>>;
}

/// Registry service reached over HTTP
pub struct HttpRegistryClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRegistryClient {
    /// Create a client for `base_url`
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Registry client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str, field: &str) -> Result<Vec<T>> {
        let url = format!("{}{path}", self.base_url);
        let mut builder = self.client.get(&url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("Registry: {e}"))
            } else {
                Error::Network(format!("Registry: {e}"))
            }
        })?;
        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Network(format!("Registry returned HTTP {status} for {path}")));
        }
        if !status.is_success() {
            return Err(Error::Protocol(format!("Registry returned HTTP {status} for {path}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Registry response for {path}: {e}")))?;
        Ok(parse_items(body, field))
    }
}

/// Parse a list body (bare array, or an object holding the array under
/// `field`), skipping items that do not deserialize
pub(crate) fn parse_items<T: DeserializeOwned>(body: Value, field: &str) -> Vec<T> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(field) {
            Some(Value::Array(items)) => items,
            _ => {
                warn!(field, "Registry response has no item list");
                return Vec::new();
            }
        },
        _ => {
            warn!("Registry response is not a list");
            return Vec::new();
        }
    };

    items
        .into_iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
            serde_json::from_value(item)
                .inspect_err(|e| warn!(id = %id, error = %e, "Skipping malformed registry item"))
                .ok()
        })
        .collect()
}

#[async_trait]
impl RegistryService for HttpRegistryClient {
    async fn list_backends(&self, tenant: &str) -> Result<Vec<BackendSpec>> {
        let tenant: String = url::form_urlencoded::byte_serialize(tenant.as_bytes()).collect();
        let specs = self
            .get_list(&format!("/v1/tenants/{tenant}/backends"), "backends")
            .await?;
        debug!(tenant = %tenant, count = specs.len(), "Fetched tenant backends");
        Ok(specs)
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let entries = self.get_list("/v1/catalog", "catalog").await?;
        debug!(count = entries.len(), "Fetched connector catalog");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_modes_parse() {
        let specs: Vec<BackendSpec> = parse_items(
            json!([
                {"id": "fs", "mode": {"type": "managed", "catalog_id": "filesystem", "config": {"root": "/srv"}}},
                {"id": "search", "namespace": "search.", "mode": {"type": "direct", "launch": {"transport": "http", "url": "https://s.example/mcp"}}}
            ]),
            "backends",
        );

        assert_eq!(specs.len(), 2);
        assert!(matches!(&specs[0].mode, BackendMode::Managed { catalog_id, .. } if catalog_id == "filesystem"));
        assert!(matches!(&specs[1].mode, BackendMode::Direct { launch: Launch::Http { .. } }));
    }

    #[test]
    fn malformed_items_are_skipped() {
        let specs: Vec<BackendSpec> = parse_items(
            json!({"backends": [
                {"id": "ok", "mode": {"type": "direct", "launch": {"transport": "process", "command": "srv"}}},
                {"id": "bad", "mode": {"type": "teleport"}},
                "not even an object"
            ]}),
            "backends",
        );
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, "ok");
    }

    #[test]
    fn non_list_body_yields_nothing() {
        let entries: Vec<CatalogEntry> = parse_items(json!({"error": "nope"}), "catalog");
        assert!(entries.is_empty());
    }
}

//! Policy Gateway Library
//!
//! Governance-enforcing Model Context Protocol (MCP) gateway. Callers speak
//! JSON-RPC to one endpoint; the gateway fans calls out to supervised
//! backends chosen by namespace prefix, after authorizing each one against
//! an external policy decision service.
//!
//! # Features
//!
//! - **Namespacing**: `fs.read_file` routes to the backend owning `fs.`
//! - **Fail-closed policy**: every per-item call is authorized; only allows are cached
//! - **Supervision**: restarts with a ceiling, circuit breakers, periodic health probes
//! - **Multi-tenant**: static backends, or per-tenant sets from a registry service
//! - **Audit**: fire-and-forget events for every verdict and outcome
//!
//! # Protocol Version
//!
//! Implements MCP protocol version 2025-11-25.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod namespace;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Tracing already initialized: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Tracing already initialized: {e}"))),
    }
}

//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// Governance-enforcing MCP gateway
#[derive(Parser, Debug)]
#[command(name = "policy-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "POLICY_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "POLICY_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "POLICY_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "POLICY_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "POLICY_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Tenant used for requests without an `x-tenant-id` header
    #[arg(long, env = "POLICY_GATEWAY_TENANT_ID", global = true)]
    pub tenant_id: Option<String>,

    /// Base URL of the policy decision service
    #[arg(long, env = "POLICY_GATEWAY_DECISION_URL", global = true)]
    pub decision_url: Option<String>,

    /// Bearer credential for the policy decision service
    #[arg(long, env = "POLICY_GATEWAY_DECISION_TOKEN", global = true, hide_env_values = true)]
    pub decision_token: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate configuration, then print the namespace table
    Check,
}

impl Cli {
    /// Apply command-line overrides to a loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(tenant) = &self.tenant_id {
            config.tenant_id = Some(tenant.clone());
        }
        if let Some(url) = &self.decision_url {
            config.policy.base_url = Some(url.clone());
        }
        if let Some(token) = &self.decision_token {
            config.policy.token = Some(token.clone());
        }
    }
}

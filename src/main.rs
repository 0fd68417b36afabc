//! Policy Gateway - governance-enforcing MCP gateway

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use policy_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    namespace::NamespaceResolver,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            cli.apply(&mut config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Check) => run_check(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Validate configuration and print the namespace table
fn run_check(config: &Config) -> ExitCode {
    let resolver = match config.validate().and_then(NamespaceResolver::new) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("✅ Configuration valid ({} backend(s))", resolver.len());
    if config.registry.enabled {
        println!("   Registry mode: tenant backends are resolved at request time");
    }
    for desc in resolver.descriptors() {
        println!(
            "   {:<20} {:<10} {}",
            desc.namespace,
            desc.launch.transport_type(),
            desc.id
        );
    }
    ExitCode::SUCCESS
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        kernel = %config.gateway.id,
        port = config.server.port,
        backends = config.backends.len(),
        registry = config.registry.enabled,
        "Starting policy gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

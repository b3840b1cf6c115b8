//! MCP hub - unified Model Context Protocol endpoints
//!
//! One URL per unified endpoint, many tool servers behind it.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcp_hub::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => check_config(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Validate config without serving
fn check_config(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    println!("Configuration OK");
    println!("  listen:     {}:{}", config.server.host, config.server.port);
    println!("  base url:   {}", config.server.base_url());
    println!("  issuers:    {}", config.auth.issuers.len());
    println!("  backends:   {}", config.store.backends.len());
    println!("  endpoints:  {}", config.store.endpoints.len());
    println!("  api keys:   {}", config.store.api_keys.len());
    println!(
        "  pii:        {}",
        if config.transform.pii.enabled { "on" } else { "off" }
    );
    ExitCode::SUCCESS
}

/// Run the hub server
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        backends = config.store.backends.len(),
        "Starting MCP hub"
    );

    let gateway = match Gateway::new(config).await {
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

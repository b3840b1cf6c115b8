//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// MCP hub - unified MCP endpoints over many tool servers
#[derive(Parser, Debug)]
#[command(name = "mcp-hub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_HUB_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_HUB_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_HUB_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_HUB_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_HUB_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the hub server (default)
    Serve,

    /// Load and validate the configuration, then print a summary
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["mcp-hub"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn check_config_accepts_global_config_flag() {
        let cli = Cli::try_parse_from(["mcp-hub", "check-config", "-c", "hub.yaml"]).unwrap();
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("hub.yaml")));
    }

    #[test]
    fn overrides_parse() {
        let cli = Cli::try_parse_from(["mcp-hub", "--port", "8080", "--host", "0.0.0.0", "serve"])
            .unwrap();
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert!(matches!(cli.command, Some(Command::Serve)));
    }
}

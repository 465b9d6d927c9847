//! Burrow Agent - tunnel agent CLI
//!
//! Connects to a burrow server, authenticates with an opaque token and keeps
//! the control session alive, forwarding traffic per the pushed catalog.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow_agent::{Agent, AgentConfig};

/// Burrow tunnel agent - exposes local services through a burrow server
#[derive(Parser, Debug)]
#[command(name = "burrow-agent")]
#[command(about = "Burrow tunnel agent - exposes local services through a burrow server")]
#[command(version)]
#[command(long_about = r#"
Burrow Agent holds a long-lived control connection to a burrow server and
tunnels traffic for the port forwards configured there.

EXAMPLES:
  # Start the agent against a server
  burrow-agent --server tunnel.example.com:7000 --token $TOKEN

  # Start the agent using a config file
  burrow-agent --config agent.yaml

ENVIRONMENT VARIABLES:
  BURROW_SERVER  Server control address (host:port)
  BURROW_TOKEN   Authentication token
"#)]
struct Args {
    /// Server control address (e.g., tunnel.example.com:7000)
    #[arg(long, env = "BURROW_SERVER")]
    server: Option<String>,

    /// Authentication token
    #[arg(long, env = "BURROW_TOKEN")]
    token: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    /// Server control address
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,

    /// Environment variable name holding the auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    token_env: Option<String>,

    /// Direct auth token (prefer token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with the config file; CLI args win.
fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let file_token = if let Some(env_var) = &file.token_env {
        Some(
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
        )
    } else {
        file.token
    };

    let server = args
        .server
        .or(file.server)
        .context("Server address is required (use --server or config file)")?;
    let token = args
        .token
        .or(file_token)
        .context("Auth token is required (use --token, environment variable, or config file)")?;

    validate_address(&server)?;

    Ok(AgentConfig::new(server, token))
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str) -> Result<()> {
    let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
    if parts.len() != 2 || parts[1].is_empty() {
        anyhow::bail!("Invalid server address format: '{}' (expected host:port)", addr);
    }
    parts[0]
        .parse::<u16>()
        .with_context(|| format!("Invalid port in server address: {}", addr))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Burrow Agent starting...");

    let config = build_agent_config(args).context("Failed to build agent configuration")?;
    info!("Server: {}", config.server_addr);

    let agent = Agent::new(config);

    tokio::select! {
        result = agent.run() => {
            if let Err(e) = result {
                error!("Agent error: {:#}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address() {
        assert!(validate_address("tunnel.example.com:7000").is_ok());
        assert!(validate_address("localhost:8080").is_ok());
        assert!(validate_address("192.168.1.1:9000").is_ok());

        assert!(validate_address("tunnel.example.com").is_err());
        assert!(validate_address("tunnel.example.com:").is_err());
        assert!(validate_address("tunnel.example.com:abc").is_err());
        assert!(validate_address(":7000").is_err());
        assert!(validate_address("").is_err());
    }
}

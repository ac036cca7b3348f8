//! agentbus - agent process entry point

use agentbus::config::AgentConfig;
use agentbus::observability::init_default_logging;
use agentbus::{AgentError, AgentResult, AgentRuntime};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["agentbus.toml", "config/agentbus.toml"];

/// Reliable pub/sub bus and workflow runtime for cooperating agents
#[derive(Parser)]
#[command(name = "agentbus")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "AGENTBUS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until SIGINT or SIGTERM
    Run,
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let result = match load_configuration(cli.config.as_ref()) {
        Ok(config) => match cli.command {
            Commands::Run => run_agent(config).await,
            Commands::Config { show } => handle_config_command(&config, show),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(error = %e.sanitized_message(), "agentbus failed");
        process::exit(1);
    }
}

fn load_configuration(path: Option<&PathBuf>) -> AgentResult<AgentConfig> {
    if let Some(path) = path {
        info!(path = %path.display(), "Loading configuration");
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            return Ok(AgentConfig::load_from_file(&path)?);
        }
    }

    Err(AgentError::internal(
        "No configuration file found; pass -c/--config or create agentbus.toml",
    ))
}

async fn run_agent(config: AgentConfig) -> AgentResult<()> {
    info!(
        agent = %config.agent.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting agentbus"
    );

    let mut runtime = AgentRuntime::build(config).await?;
    runtime.start().await?;

    wait_for_shutdown_signal().await?;

    runtime.shutdown().await?;
    info!("agentbus shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> AgentResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| AgentError::internal(format!("Cannot install SIGINT handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| AgentError::internal(format!("Cannot install SIGTERM handler: {e}")))?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> AgentResult<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AgentError::internal(format!("Cannot listen for ctrl-c: {e}")))?;
    info!("Received ctrl-c, shutting down");
    Ok(())
}

fn handle_config_command(config: &AgentConfig, show: bool) -> AgentResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| AgentError::internal(format!("Cannot render configuration: {e}")))?;
        println!("{rendered}");
    }
    info!(
        agent = %config.agent.name,
        workflows = config.workflows.len(),
        rulers = config.rulers.len(),
        "Configuration is valid"
    );
    Ok(())
}

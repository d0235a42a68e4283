//! --- LogiChain Node Main Entrypoint ---

use clap::{Parser, Subcommand};
use logichain::{
    config::{Config, ConfigError},
    node::{Node, NodeError},
    p2p::NoopBroadcaster,
    persistence::{FileStore, StorageError},
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Error)]
enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Node failed: {0}")]
    Node(#[from] NodeError),
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = "A LogiChain ledger node: chain state, mempool, consensus and mining."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the node.
    Start {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Write a default configuration file.
    InitConfig {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        output: PathBuf,
    },
}

fn initialize_logging(level: &str) {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(level))
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging subscriber: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { output } => {
            initialize_logging("info");
            Config::default().save(&output.display().to_string())?;
            info!("Default configuration written to '{}'.", output.display());
        }
        Commands::Start { config } => start_node(config).await?,
    }

    Ok(())
}

async fn start_node(config_path: PathBuf) -> Result<(), CliError> {
    let config = Config::load(&config_path.display().to_string())?;
    initialize_logging(&config.logging.level);

    info!("LogiChain node starting up...");
    info!("Configuration loaded from '{}'.", config_path.display());

    let store = Arc::new(FileStore::open(std::path::Path::new(&config.data_path))?);
    let node = Arc::new(Node::new(config, store, Arc::new(NoopBroadcaster))?);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received."),
                Err(e) => error!("Failed to listen for shutdown signal: {e}"),
            }
            shutdown.cancel();
        });
    }

    info!("Node initialized. Starting main loop... (Press Ctrl+C for graceful shutdown)");
    node.run(shutdown).await?;

    info!("LogiChain node has shut down.");
    Ok(())
}

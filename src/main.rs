use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chain_multiplex::config::NodeConfig;
use chain_multiplex::privval::FilePv;
use chain_multiplex::reactor::MultiplexReactor;

#[derive(Parser)]
#[command(author, version, about = "Multi-tenant chain node multiplexer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the multiplex using the provided configuration file
    Start {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
    },
    /// Generate a default node configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/node.toml")]
        path: PathBuf,
    },
    /// Generate a priv validator keypair
    Keygen {
        #[arg(short, long, default_value = "config/priv_validator_key.json")]
        key_path: PathBuf,
        #[arg(short, long, default_value = "data/priv_validator_state.json")]
        state_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_multiplex(config).await?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Keygen {
            key_path,
            state_path,
        } => keygen(key_path, state_path)?,
    }

    Ok(())
}

async fn start_multiplex(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        let config = NodeConfig::default();
        config.save(&config_path)?;
        config
    };

    let reactor = MultiplexReactor::new(config)?;
    reactor.start().await?;

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    reactor.stop();
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = NodeConfig::default();
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(key_path: PathBuf, state_path: PathBuf) -> Result<()> {
    let priv_validator = FilePv::load_or_generate(&key_path, &state_path)?;
    info!(
        ?key_path,
        address = priv_validator.address(),
        "generated priv validator key"
    );
    Ok(())
}

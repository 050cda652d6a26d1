use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

mod client;
mod config;
mod keys;
mod net;
mod relay;
mod trustee;

use crate::config::{NodeConfig, Role};

#[derive(Parser)]
#[command(name = "daga-node")]
#[command(about = "Relay, trustee or client for the DAGA setup handshake")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Node configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the role named in the configuration file
    Run,

    /// Print a fresh key pair for a config file
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug { "daga=debug,info" } else { "daga=info,warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Run => {
            let path = cli.config.context("`run` needs --config <file>")?;
            let config = NodeConfig::load(&path)?;
            info!(id = config.id, name = %config.name, role = ?config.role, "starting node");
            match config.role {
                Role::Relay => relay::run(config).await,
                Role::Trustee => trustee::run(config).await,
                Role::Client => client::run(config).await,
            }
        }
        Commands::Keygen => {
            let pair = keys::KeyPair::generate();
            println!("private_key = \"{}\"", keys::encode_secret(&pair.secret));
            println!("public_key = \"{}\"", keys::encode_public(&pair.public));
            Ok(())
        }
    }
}

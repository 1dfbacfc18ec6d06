//! OIDC session agent command line.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::RngCore;
use std::path::PathBuf;
use tracing::info;

use oidc_session_agent::agent::{AgentConfig, SessionAgent};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "oidc-session-agent")]
#[command(about = "OIDC session and token lifecycle agent")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, env = "VERBOSE")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh cookie secret (32 bytes, hex)
    GenKey,

    /// Load and validate a configuration, then contact the provider
    CheckConfig {
        /// Path to the JSON configuration file
        #[arg(long, env = "OIDC_AGENT_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    match args.command {
        Command::GenKey => {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            println!("{}", hex::encode(key));
        }
        Command::CheckConfig { config } => {
            let agent_config = AgentConfig::load(&config)?;
            info!(path = ?config, "Configuration loaded");

            let agent = SessionAgent::connect(agent_config).await?;
            let metadata = agent.flow().metadata();

            info!(
                issuer = %metadata.issuer,
                client_id = %agent.config().oidc.client_id,
                par = metadata.supports_par(),
                end_session = metadata.end_session_endpoint.is_some(),
                revocation = metadata.revocation_endpoint.is_some(),
                signing_keys = agent.jwks().key_count(),
                store = ?agent.config().store,
                embed_tokens = agent.config().cookie.embed_tokens,
                "Provider reachable, configuration OK"
            );
        }
    }

    Ok(())
}

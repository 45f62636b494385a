//! IonNet Node
//!
//! Command-line front end for the IonNet encrypted RPC protocol.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ionnet_node::client;
use ionnet_node::config::{default_config_path, Config};
use ionnet_node::server::{Server, ServerEvent};
use ionnet_protocol::{CryptoProvider, MessageKind};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// IonNet - encrypted RPC envelopes over WebSockets.
#[derive(Parser, Debug)]
#[command(name = "ionnet")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the echo server
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long, short)]
        listen: Option<String>,
    },

    /// Send a request and print the reply
    Call {
        /// Endpoint name
        endpoint: String,

        /// JSON payload (default: null)
        payload: Option<String>,

        /// Server URL (overrides the config file)
        #[arg(long, short)]
        url: Option<String>,
    },

    /// Send a notification
    Push {
        /// Endpoint name
        endpoint: String,

        /// JSON payload (default: null)
        payload: Option<String>,

        /// Server URL (overrides the config file)
        #[arg(long, short)]
        url: Option<String>,
    },

    /// Generate a key pair and print its public key
    Keys,

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    // Initialize tracing; RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.node.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve { listen } => {
            if let Some(listen) = listen {
                config.network.listen_addr = listen;
            }
            config.validate()?;
            run_server(config).await?;
        }
        Commands::Call {
            endpoint,
            payload,
            url,
        } => {
            if let Some(url) = url {
                config.network.url = url;
            }
            config.validate()?;

            let payload = parse_payload(payload.as_deref())?;
            let crypto = CryptoProvider::new();
            let reply = client::call(
                &config.network.url,
                &endpoint,
                payload,
                &crypto,
                &config.protocol,
            )
            .await?;

            let body = reply.payload.clone().unwrap_or(Value::Null);
            if reply.kind == MessageKind::Error {
                anyhow::bail!(
                    "{} returned error {}: {}",
                    endpoint,
                    reply.code.unwrap_or_default(),
                    body
                );
            }
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Push {
            endpoint,
            payload,
            url,
        } => {
            if let Some(url) = url {
                config.network.url = url;
            }
            config.validate()?;

            let payload = parse_payload(payload.as_deref())?;
            let crypto = CryptoProvider::new();
            client::push(
                &config.network.url,
                &endpoint,
                payload,
                &crypto,
                &config.protocol,
            )
            .await?;
            println!("Pushed to {}", endpoint);
        }
        Commands::Keys => {
            let crypto = CryptoProvider::new();
            let keys = crypto.key_pair();
            println!("Public key:  {}", keys.public_key_hex());
            println!("Fingerprint: {}", keys.fingerprint());
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
    }

    Ok(())
}

/// Parses a command-line JSON payload; absent means null.
fn parse_payload(raw: Option<&str>) -> anyhow::Result<Value> {
    match raw {
        None => Ok(Value::Null),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("Payload is not valid JSON: {}", e)),
    }
}

/// Run the echo server until a shutdown signal arrives.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let crypto = Arc::new(CryptoProvider::new());
    tracing::info!("Node fingerprint: {}", crypto.key_pair().fingerprint());

    let mut server = Server::new(config, crypto);
    let mut events = server.subscribe();

    // Spawn event logging task
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::StateChanged(state) => {
                    tracing::debug!("Server state: {:?}", state);
                }
                ServerEvent::PeerConnected { id, fingerprint } => {
                    tracing::debug!("Peer {} authenticated (local key {})", id, fingerprint);
                }
                ServerEvent::PeerDisconnected { id } => {
                    tracing::debug!("Peer {} gone", id);
                }
            }
        }
    });

    server.start().await?;

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    server.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

mod config;
mod state;
mod tcp;

use config::RelayConfig;
use state::RelayState;

#[derive(Parser)]
#[command(name = "veilchat-relay", about = "Untrusted message relay for veilchat")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// TCP port, overrides config
    #[arg(long)]
    port: Option<u16>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// Maximum concurrent peers, overrides config
    #[arg(long)]
    max_users: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "veilchat_relay=info".into()),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        RelayConfig::default()
    };

    // CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(max_users) = args.max_users {
        config.max_users = max_users;
    }

    info!("veilchat relay starting");
    info!(host = %config.host, port = config.port, max_users = config.max_users);

    let state = Arc::new(RelayState::new(&config));

    let listener = TcpListener::bind(format!("{}:{}", config.host, config.port))
        .await
        .with_context(|| format!("failed to bind TCP on {}:{}", config.host, config.port))?;

    info!("relay ready, accepting connections");

    loop {
        let (tcp_stream, peer_addr) = match listener.accept().await {
            Ok(result) => result,
            Err(e) => {
                error!("TCP accept error: {}", e);
                continue;
            }
        };
        let _ = tcp_stream.set_nodelay(true);

        let state = state.clone();
        tokio::spawn(tcp::handle_connection(tcp_stream, peer_addr.to_string(), state));
    }
}

//! Kasmix daemon binary.
//!
//! Wires the chain RPC client, the session and wallet stores, the engine
//! and its monitors, and the JSON-RPC API server into a running service
//! with graceful Ctrl+C shutdown.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use kasmix_chain::{ChainRpc, NodeClient};
use kasmix_core::address::Network;
use kasmix_core::constants::{DEFAULT_API_PORT, DEFAULT_NODE_URL};
use kasmix_engine::{Engine, EngineConfig, Supervisor};
use kasmix_service::{start_api_server, SettingsStore};
use kasmix_session::SessionStore;
use kasmix_wallet::{Wallet, WalletStore};

/// Kasmix daemon — non-custodial mixing and CoinJoin for Kaspa.
#[derive(Parser, Debug)]
#[command(
    name = "kasmixd",
    version,
    about = "Kasmix daemon: mixing sessions and CoinJoin coordination"
)]
struct Args {
    /// Data directory for sessions, wallet, and settings
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// Chain node WebSocket URL
    #[arg(long, default_value = DEFAULT_NODE_URL)]
    node_url: String,

    /// API server bind address
    #[arg(long, default_value = "127.0.0.1")]
    api_bind: String,

    /// API server port
    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    api_port: u16,

    /// Operator pool address for trusted-mode CoinJoin
    #[arg(long)]
    pool_address: Option<String>,

    /// Operator pool private key (hex); the trusted batcher idles
    /// without it. Prefer KASMIX_POOL_KEY over the flag.
    #[arg(long, env = "KASMIX_POOL_KEY", hide_env_values = true)]
    pool_private_key: Option<String>,

    /// Minimum participants for zero-trust builds
    #[arg(long, default_value_t = kasmix_core::constants::MIN_ZERO_TRUST_PARTICIPANTS)]
    min_zero_trust: usize,

    /// Minimum entered sessions before the trusted batcher runs
    #[arg(long, default_value_t = kasmix_core::constants::MIN_TRUSTED_PARTICIPANTS)]
    min_trusted: usize,

    /// Equal-amount policing window in milliseconds
    #[arg(long, default_value_t = kasmix_core::constants::POLICING_WINDOW_MS)]
    policing_window_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Use the test network
    #[arg(long)]
    testnet: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let network = if args.testnet { Network::Testnet } else { Network::Mainnet };
    let data_dir = args.data_dir.clone().unwrap_or_else(|| {
        let suffix = if args.testnet { "kasmix-testnet" } else { "kasmix" };
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(suffix)
    });

    info!("Kasmix daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(network = ?network, data_dir = %data_dir.display(), node_url = %args.node_url, "starting");

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!("failed to create data_dir: {e}");
        process::exit(1);
    }

    // Stores.
    let sessions = match SessionStore::open(data_dir.join("sessions.json")) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open session store: {e}");
            process::exit(1);
        }
    };
    let wallet_store = match WalletStore::open(data_dir.join("wallet.json")) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open wallet store: {e}");
            process::exit(1);
        }
    };
    let settings = match SettingsStore::open(data_dir.join("settings.json")) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open settings store: {e}");
            process::exit(1);
        }
    };

    // Chain client (dials lazily on first use).
    let rpc: Arc<dyn ChainRpc> = Arc::new(NodeClient::new(args.node_url.clone()));
    let wallet = Arc::new(Wallet::new(Arc::clone(&rpc), wallet_store, network));

    let config = EngineConfig {
        network,
        min_zero_trust: args.min_zero_trust,
        min_trusted: args.min_trusted,
        policing_window_ms: args.policing_window_ms,
        pool_address: args.pool_address.clone(),
        pool_private_key: args.pool_private_key.clone(),
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(rpc, sessions, wallet, config));

    info!(
        sessions = engine.sessions().len(),
        "engine initialized"
    );

    // Monitors.
    let supervisor = Supervisor::start(Arc::clone(&engine));

    // API server.
    let api_addr = format!("{}:{}", args.api_bind, args.api_port);
    let api_handle = match start_api_server(&api_addr, Arc::clone(&engine), settings).await {
        Ok(handle) => {
            info!("API server listening on {api_addr}");
            handle
        }
        Err(e) => {
            error!("failed to start API server: {e}");
            process::exit(1);
        }
    };

    info!("kasmixd running (Ctrl+C to stop)");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("received Ctrl+C, shutting down...");

    supervisor.shutdown().await;
    api_handle.stop().ok();
    info!("kasmixd shutdown complete");
}

/// Initialize tracing subscriber with the given log level and output format.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

//! Gateway entry point: loads configuration, wires up the adapter stack
//! and shared singletons, and runs `ConnectionMux` until the process is
//! signaled to stop.
//!
//! Usage: vox-gateway [--config <path>]

use std::env;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use vox_gateway::adapters::Adapters;
use vox_gateway::config::{GatewayConfig, LogFormat};
use vox_gateway::{ConnectionMux, PeerRegistry};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

fn config_path() -> String {
    let args: Vec<String> = env::args().collect();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            if let Some(path) = iter.next() {
                return path.clone();
            }
        }
    }
    env::var("GATEWAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

fn init_logging(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(GatewayConfig::load(&config_path())?);
    init_logging(&config);

    tracing::info!(
        bind_addr = %config.server.bind_addr(),
        max_sessions = config.server.max_sessions,
        "vox-gateway starting"
    );

    // The stub adapter stack (§4.4) is the only implementation this
    // crate ships — it's what makes the kernel runnable standalone.
    // Production deployments construct `Adapters` from network-backed
    // clients implementing the same traits and swap them in here.
    let adapters = Adapters::stub();
    let peer_registry = Arc::new(PeerRegistry::new());
    let mux = Arc::new(ConnectionMux::new(Arc::clone(&config), adapters, peer_registry));

    mux.serve().await?;
    Ok(())
}

//! TunnelCow client entry point: establishes the Link to the server,
//! restores persisted tunnels/domains, and keeps the dispatcher and ping
//! loop running until the Link drops, then reconnects after §5's 5s delay.

mod config;
mod inspect;
mod manager;
mod store;

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use tunnelcow_protocol::{Mode, Session};

use config::{Args, ClientConfig};
use manager::ClientManager;
use store::{FileStore, StateStore};

const CLIENT_CONFIG_KEY: &str = "client_config";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(&args.data_dir));

    let config = match store::load_json::<ClientConfig>(store.as_ref(), CLIENT_CONFIG_KEY) {
        Some(mut cfg) => {
            if let Some(addr) = args.server_addr.clone() {
                cfg.server_addr = addr;
            }
            if let Some(token) = args.token.clone() {
                cfg.token = token;
            }
            cfg.debug = args.debug;
            cfg
        }
        None => ClientConfig::from_args(&args)?,
    };
    store::save_json(store.as_ref(), CLIENT_CONFIG_KEY, &config);

    loop {
        if let Err(e) = run_link(&config, store.clone()).await {
            warn!("link error: {e}");
        }
        info!(
            "reconnecting in {:?}",
            tunnelcow_protocol::RECONNECT_DELAY
        );
        tokio::time::sleep(tunnelcow_protocol::RECONNECT_DELAY).await;
    }
}

/// Establishes one Link end to end: TCP connect, token handshake,
/// multiplexer setup, control substream open, then runs the ping loop,
/// control read loop, and data-substream dispatcher concurrently until
/// any of them ends.
async fn run_link(config: &ClientConfig, store: Arc<dyn StateStore>) -> anyhow::Result<()> {
    info!("connecting to {}", config.server_addr);
    let mut stream = TcpStream::connect(&config.server_addr).await?;
    let local_addr = stream.local_addr()?;

    stream.write_all(config.token.as_bytes()).await?;

    let mut session = Session::new(stream, Mode::Client);
    let control = session
        .open()
        .await
        .map_err(|e| anyhow::anyhow!("failed to open control substream: {e}"))?;

    let (manager, control_reader) =
        ClientManager::new(control, store, config.control_port(), local_addr);
    let manager = Arc::new(manager);

    info!("link established");
    manager.restore_tunnels().await;

    let ping_manager = manager.clone();
    let ping_task = tokio::spawn(async move {
        ping_manager.run_ping_loop().await;
    });

    let read_manager = manager.clone();
    let read_task = tokio::spawn(async move {
        read_manager.run_read_loop(control_reader).await;
    });

    let dispatch_manager = manager.clone();
    let dispatch_task = tokio::spawn(async move {
        manager::listen_for_streams(dispatch_manager, session).await;
    });

    tokio::select! {
        _ = ping_task => {}
        _ = read_task => {}
        _ = dispatch_task => {}
    }

    error!("link torn down");
    Ok(())
}

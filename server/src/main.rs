//! TunnelCow relay server entry point: loads configuration and state,
//! starts the token-gated control-port listener (§4.H), and the `:80`/
//! `:443` virtual-host router (§4.I) behind a dynamic per-SNI TLS
//! resolver (§4.J).

mod auth;
mod certs;
mod config;
mod domain;
mod pwhash;
mod ratelimit;
mod registry;
mod router;
mod session;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use tunnelcow_protocol::session::SharedStats;
use tunnelcow_protocol::{Mode, Session};

use certs::{CertManager, ChallengeStore, DynamicCertResolver};
use config::{Args, ServerConfig};
use domain::DomainRegistry;
use ratelimit::RateLimiter;
use registry::SessionRegistry;
use router::RouterState;
use store::{load_json, save_json, FileStore, StateStore};

const SERVER_CONFIG_KEY: &str = "server_config";

fn generate_token() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("rustls crypto provider installs exactly once");

    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(&args.data_dir));

    let config = match load_json::<ServerConfig>(store.as_ref(), SERVER_CONFIG_KEY) {
        Some(mut cfg) => {
            if let Some(token) = args.token.clone() {
                cfg.token = token;
            }
            cfg.port = args.port;
            cfg.debug = args.debug;
            cfg
        }
        None => ServerConfig::from_args(&args, generate_token),
    };
    save_json(store.as_ref(), SERVER_CONFIG_KEY, &config);
    info!("server token: {}", config.token);

    let domains = Arc::new(DomainRegistry::new(store.clone()));
    let sessions = Arc::new(SessionRegistry::new());
    let limiter = Arc::new(RateLimiter::new());
    ratelimit::spawn_sweeper(limiter.clone());

    let challenges = ChallengeStore::default();
    let cert_manager = Arc::new(CertManager::new(
        &args.data_dir,
        domains.clone(),
        args.acme_email.clone(),
        args.no_acme,
        challenges.clone(),
    ));
    let resolver = Arc::new(DynamicCertResolver::new(cert_manager));

    let router_state = Arc::new(RouterState {
        domains: domains.clone(),
        sessions: sessions.clone(),
        limiter: limiter.clone(),
        server_token: config.token.clone(),
        http_client: reqwest::Client::builder()
            .build()
            .expect("reqwest client must build"),
        challenges,
    });

    let plain_app = router::plain_router(router_state.clone())
        .into_make_service_with_connect_info::<SocketAddr>();
    let secure_app = router::secure_router(router_state)
        .into_make_service_with_connect_info::<SocketAddr>();

    let plain_addr: SocketAddr = ([0, 0, 0, 0], 80).into();
    tokio::spawn(async move {
        if let Err(e) = axum_server::bind(plain_addr).serve(plain_app).await {
            error!("plain-HTTP router exited: {e}");
        }
    });

    let rustls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config));
    let secure_addr: SocketAddr = ([0, 0, 0, 0], 443).into();
    tokio::spawn(async move {
        if let Err(e) = axum_server::bind_rustls(secure_addr, tls_config)
            .serve(secure_app)
            .await
        {
            error!("TLS router exited: {e}");
        }
    });

    run_control_listener(config, domains, sessions).await
}

/// §4.H: the token-gated control-port listener. Accepts raw TCP
/// connections, performs the write-then-compare token handshake, then
/// hands the connection to the multiplexer as the yamux server side and
/// waits for the client to `Open` its control substream.
async fn run_control_listener(
    config: ServerConfig,
    domains: Arc<DomainRegistry>,
    sessions: Arc<SessionRegistry>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("control listener bound on :{}", config.port);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("control accept failed: {e}");
                continue;
            }
        };

        let token = config.token.clone();
        let control_port = config.port;
        let domains = domains.clone();
        let sessions = sessions.clone();

        tokio::spawn(async move {
            if let Err(e) =
                handle_incoming_link(stream, peer, &token, control_port, domains, sessions).await
            {
                warn!("link from {peer} rejected: {e}");
            }
        });
    }
}

async fn handle_incoming_link(
    mut stream: TcpStream,
    peer: SocketAddr,
    token: &str,
    control_port: u16,
    domains: Arc<DomainRegistry>,
    sessions: Arc<SessionRegistry>,
) -> anyhow::Result<()> {
    let mut presented = vec![0u8; token.len()];
    stream.read_exact(&mut presented).await?;
    if presented != token.as_bytes() {
        stream.shutdown().await.ok();
        anyhow::bail!("token mismatch");
    }

    let mut session = Session::new(stream, Mode::Server);
    let opener = session.opener();
    let stats: SharedStats = Default::default();

    let control = session
        .accept()
        .await
        .ok_or_else(|| anyhow::anyhow!("link closed before control substream was opened"))?;

    tokio::spawn(async move {
        session::handle_control_loop(control, peer, control_port, domains, sessions, opener, stats)
            .await;
        session.close().await;
    });

    Ok(())
}

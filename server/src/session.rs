//! §4.G Client Session (server side) and §4.H Public-Port Listener.
//!
//! One [`ClientSessionHandle`] exists per connected client for the
//! lifetime of its Link. `handle_control_loop` is the authoritative task:
//! when it exits for any reason, every listener it owns is closed and
//! every port it registered is unregistered — the guaranteed cleanup the
//! spec requires.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use tunnelcow_protocol::{
    counters::{CountingStream, Direction},
    session::{SessionOpener, SharedStats},
    Message, MessageCodec, Substream,
};

use crate::domain::DomainRegistry;
use crate::registry::SessionRegistry;

type ControlWriter = FramedWrite<WriteHalf<Substream>, MessageCodec>;
type ControlReader = FramedRead<ReadHalf<Substream>, MessageCodec>;

struct BoundListener {
    local_port: u16,
    accept_task: tokio::task::JoinHandle<()>,
}

/// Owns this client's listeners and the control substream's write half.
/// Shared (via `Arc`) between the control loop and anything that needs
/// to write to this client unprompted — the INSPECT_DATA shipper, chiefly.
pub struct ClientSessionHandle {
    pub client_addr: std::net::SocketAddr,
    control_tx: Mutex<ControlWriter>,
    listeners: Mutex<HashMap<u16, BoundListener>>,
    control_port: u16,
}

impl ClientSessionHandle {
    /// Writes one framed message on the control substream, serialized
    /// against every other writer (ping echo, inspect shipper, bind/unbind
    /// acks) by the same mutex — the "control-write mutex" of §5.
    pub async fn send_control(&self, msg: Message) -> std::io::Result<()> {
        use futures::SinkExt;
        let mut tx = self.control_tx.lock().await;
        tx.send(msg)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    async fn bind(
        self: &Arc<Self>,
        public_port: u16,
        local_port: u16,
        session_registry: Arc<SessionRegistry>,
        opener: SessionOpener,
        stats: SharedStats,
    ) -> Result<(), BindError> {
        if public_port == 0 {
            return Err(BindError::OutOfRange);
        }
        if public_port == self.control_port {
            return Err(BindError::IsControlPort);
        }
        if self.listeners.lock().await.contains_key(&public_port) {
            return Err(BindError::AlreadyBound);
        }

        let listener = TcpListener::bind(("0.0.0.0", public_port))
            .await
            .map_err(BindError::Listen)?;

        session_registry.register(public_port, self.clone());

        let this = self.clone();
        let accept_task = tokio::spawn(async move {
            accept_public_connections(listener, public_port, opener, this, stats).await;
        });

        self.listeners.lock().await.insert(
            public_port,
            BoundListener {
                local_port,
                accept_task,
            },
        );
        Ok(())
    }

    async fn unbind(&self, public_port: u16, session_registry: &SessionRegistry) {
        if let Some(b) = self.listeners.lock().await.remove(&public_port) {
            b.accept_task.abort();
        }
        session_registry.unregister(public_port);
    }

    async fn cleanup(&self, session_registry: &SessionRegistry) {
        let mut listeners = self.listeners.lock().await;
        for (port, b) in listeners.drain() {
            b.accept_task.abort();
            session_registry.unregister(port);
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum BindError {
    #[error("public port out of range")]
    OutOfRange,
    #[error("public port collides with the control port")]
    IsControlPort,
    #[error("public port already bound in this session")]
    AlreadyBound,
    #[error("listen failed: {0}")]
    Listen(std::io::Error),
}

/// Runs the control loop until the substream errs or closes. On every
/// exit path, all of this client's listeners are torn down and
/// unregistered — see SPEC_FULL.md §4.H.
pub async fn handle_control_loop(
    control: Substream,
    client_addr: std::net::SocketAddr,
    control_port: u16,
    domain_registry: Arc<DomainRegistry>,
    session_registry: Arc<SessionRegistry>,
    opener: SessionOpener,
    stats: SharedStats,
) {
    let (read_half, write_half) = tokio::io::split(control);
    let mut reader: ControlReader = FramedRead::new(read_half, MessageCodec);
    let writer: ControlWriter = FramedWrite::new(write_half, MessageCodec);

    let handle = Arc::new(ClientSessionHandle {
        client_addr,
        control_tx: Mutex::new(writer),
        listeners: Mutex::new(HashMap::new()),
        control_port,
    });

    info!("client session started: {client_addr}");

    while let Some(frame) = reader.next().await {
        let msg = match frame {
            Ok(m) => m,
            Err(e) => {
                warn!("control protocol error from {client_addr}: {e}");
                continue;
            }
        };

        match msg {
            Message::ReqBind {
                public_port,
                local_port,
            } => {
                match handle
                    .bind(
                        public_port,
                        local_port,
                        session_registry.clone(),
                        opener.clone(),
                        stats.clone(),
                    )
                    .await
                {
                    Ok(()) => info!("{client_addr} bound public port {public_port} -> {local_port}"),
                    Err(e) => warn!("{client_addr} bind {public_port} rejected: {e}"),
                }
            }
            Message::ReqUnbind { public_port } => {
                handle.unbind(public_port, &session_registry).await;
                info!("{client_addr} unbound public port {public_port}");
            }
            Message::ReqDomainMap {
                domain,
                public_port,
                mode,
                auth_user,
                auth_pass,
                rate_limit,
                smart_shield,
            } => {
                domain_registry.add(
                    domain,
                    crate::domain::DomainEntry {
                        public_port,
                        mode,
                        auth_user,
                        auth_pass,
                        rate_limit: rate_limit.unwrap_or(0),
                        smart_shield: smart_shield.unwrap_or(false),
                    },
                );
            }
            Message::ReqDomainUnmap { domain } => {
                domain_registry.remove(&domain);
            }
            Message::Ping { ts } => {
                if let Err(e) = handle.send_control(Message::Ping { ts }).await {
                    warn!("failed to echo ping to {client_addr}: {e}");
                    break;
                }
            }
            Message::NewConn { .. } | Message::InspectData(_) | Message::Unknown => {
                debug!("ignoring unexpected control-substream tag from {client_addr}");
            }
        }
    }

    handle.cleanup(&session_registry).await;
    info!("client session ended: {client_addr}");
}

/// §4.H: accept loop for one bound public port.
async fn accept_public_connections(
    listener: TcpListener,
    public_port: u16,
    mut opener: SessionOpener,
    _owner: Arc<ClientSessionHandle>,
    stats: SharedStats,
) {
    loop {
        let (public_stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed on public port {public_port}: {e}");
                break;
            }
        };

        let mut stream = match opener.open().await {
            Ok(s) => s,
            Err(e) => {
                error!("failed to open substream for {peer} on port {public_port}: {e}");
                continue;
            }
        };

        let stats = stats.clone();
        tokio::spawn(async move {
            let header = Message::NewConn { public_port };
            let line = match serde_json::to_vec(&header) {
                Ok(mut v) => {
                    v.push(b'\n');
                    v
                }
                Err(e) => {
                    error!("failed to encode NEW_CONN header: {e}");
                    return;
                }
            };
            if let Err(e) = stream.write_all(&line).await {
                error!("failed to write NEW_CONN header for {peer}: {e}");
                return;
            }
            let mut public_stream = CountingStream::new(public_stream, stats, Direction::Up);
            if let Err(e) =
                tokio::io::copy_bidirectional(&mut public_stream, &mut stream).await
            {
                debug!("splice ended for {peer} on port {public_port}: {e}");
            }
        });
    }
}

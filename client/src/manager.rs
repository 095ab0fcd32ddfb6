//! §4.K Client Manager — owns the Link's control substream and the
//! in-memory `tunnels`/`domains` maps, with synchronous persistence on
//! every mutation. Resolves the Open Question in SPEC_FULL.md §9 as
//! option (a): every mutation sends its control message *then* stores
//! and persists, all under the same write-lock acquisition, so a write
//! failure can only ever leave the wire ahead of local state, never the
//! reverse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use tunnelcow_protocol::{
    counters::{CountingStream, Direction},
    read_one_line, session::SharedStats, Message, MessageCodec, Substream,
};

use crate::config::DASHBOARD_PORT;
use crate::inspect::InspectionBuffer;
use crate::store::{load_json, save_json, StateStore};

type ControlWriter = FramedWrite<WriteHalf<Substream>, MessageCodec>;
type ControlReader = FramedRead<ReadHalf<Substream>, MessageCodec>;

const TUNNELS_KEY: &str = "tunnels";
const DOMAINS_KEY: &str = "client_domains";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelRecord {
    pub public: u16,
    pub local: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain: String,
    pub port: u16,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart_shield: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("port collides with the dashboard port")]
    DashboardPort,
    #[error("port collides with the server control port")]
    ServerControlPort,
    #[error("port collides with the Link's own local port")]
    LinkLocalPort,
    #[error("public port {0} is already tunneled")]
    AlreadyTunneled(u16),
    #[error("public port {0} is not currently tunneled")]
    NotTunneled(u16),
    #[error("invalid range spec: {0}")]
    BadRange(String),
    #[error("control write failed: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ClientManager {
    control_tx: Mutex<ControlWriter>,
    tunnels: RwLock<Vec<TunnelRecord>>,
    domains: RwLock<Vec<DomainRecord>>,
    store: Arc<dyn StateStore>,
    control_port: Option<u16>,
    link_local_port: u16,
    pub stats: SharedStats,
    pub inspect: Arc<InspectionBuffer>,
}

impl ClientManager {
    pub fn new(
        control: Substream,
        store: Arc<dyn StateStore>,
        control_port: Option<u16>,
        link_local_addr: SocketAddr,
    ) -> (Self, ControlReader) {
        let (read_half, write_half) = tokio::io::split(control);
        let reader: ControlReader = FramedRead::new(read_half, MessageCodec);
        let writer: ControlWriter = FramedWrite::new(write_half, MessageCodec);

        let tunnels = load_json::<Vec<TunnelRecord>>(store.as_ref(), TUNNELS_KEY).unwrap_or_default();
        let domains = load_json::<Vec<DomainRecord>>(store.as_ref(), DOMAINS_KEY).unwrap_or_default();

        let manager = ClientManager {
            control_tx: Mutex::new(writer),
            tunnels: RwLock::new(tunnels),
            domains: RwLock::new(domains),
            store,
            control_port,
            link_local_port: link_local_addr.port(),
            stats: SharedStats::default(),
            inspect: Arc::new(InspectionBuffer::new()),
        };
        (manager, reader)
    }

    async fn send_control(&self, msg: Message) -> Result<(), ManagerError> {
        let mut tx = self.control_tx.lock().await;
        tx.send(msg).await.map_err(|e| {
            ManagerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })
    }

    fn validate_port(&self, port: u16) -> Result<(), ManagerError> {
        if port == DASHBOARD_PORT {
            return Err(ManagerError::DashboardPort);
        }
        if self.control_port == Some(port) {
            return Err(ManagerError::ServerControlPort);
        }
        if port == self.link_local_port {
            return Err(ManagerError::LinkLocalPort);
        }
        Ok(())
    }

    fn persist_tunnels(&self, tunnels: &[TunnelRecord]) {
        save_json(self.store.as_ref(), TUNNELS_KEY, &tunnels.to_vec());
    }

    fn persist_domains(&self, domains: &[DomainRecord]) {
        save_json(self.store.as_ref(), DOMAINS_KEY, &domains.to_vec());
    }

    /// §4.K `AddTunnel`: validates both ports against the dashboard port,
    /// the server's own control port, and the Link's ephemeral local
    /// port, then rejects a duplicate `public_port` before sending.
    pub async fn add_tunnel(&self, public_port: u16, local_port: u16) -> Result<(), ManagerError> {
        self.validate_port(public_port)?;
        self.validate_port(local_port)?;

        let mut tunnels = self.tunnels.write().await;
        if tunnels.iter().any(|t| t.public == public_port) {
            return Err(ManagerError::AlreadyTunneled(public_port));
        }

        self.send_control(Message::ReqBind {
            public_port,
            local_port,
        })
        .await?;

        tunnels.push(TunnelRecord {
            public: public_port,
            local: local_port,
        });
        self.persist_tunnels(&tunnels);
        info!("tunnel added: {public_port} -> {local_port}");
        Ok(())
    }

    /// §4.K `AddRange`: parses `"a-b"`/`"c-d"`, then attempts
    /// `AddTunnel(a+i, c+i)` for each offset; a single item's failure is
    /// logged and does not abort the remaining items.
    pub async fn add_range(&self, public_spec: &str, local_spec: &str) -> Result<(), ManagerError> {
        let (pub_start, pub_end) = parse_range(public_spec)?;
        let (local_start, _local_end) = parse_range(local_spec)?;

        for offset in 0..=(pub_end - pub_start) {
            let public_port = pub_start + offset;
            let local_port = local_start + offset;
            if let Err(e) = self.add_tunnel(public_port, local_port).await {
                warn!("range add {public_port} -> {local_port} failed: {e}");
            }
        }
        Ok(())
    }

    /// §4.K `RemoveTunnel`: unbinds, then cascades removal to every
    /// domain that referenced this `public_port` (the client-side orphan
    /// cascade — the server keeps a domain mapping until told to drop it).
    pub async fn remove_tunnel(&self, public_port: u16) -> Result<(), ManagerError> {
        self.send_control(Message::ReqUnbind { public_port }).await?;

        {
            let mut tunnels = self.tunnels.write().await;
            tunnels.retain(|t| t.public != public_port);
            self.persist_tunnels(&tunnels);
        }

        let mut domains = self.domains.write().await;
        let orphans: Vec<String> = domains
            .iter()
            .filter(|d| d.port == public_port)
            .map(|d| d.domain.clone())
            .collect();
        for host in orphans {
            if let Err(e) = self
                .send_control(Message::ReqDomainUnmap {
                    domain: host.clone(),
                })
                .await
            {
                warn!("failed to unmap orphaned domain {host}: {e}");
            }
            domains.retain(|d| d.domain != host);
        }
        self.persist_domains(&domains);
        info!("tunnel removed: {public_port}");
        Ok(())
    }

    /// §4.K `AddDomain`: the referenced port must currently be tunneled.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_domain(
        &self,
        domain: String,
        port: u16,
        mode: String,
        auth_user: Option<String>,
        auth_pass: Option<String>,
        rate_limit: Option<u32>,
        smart_shield: Option<bool>,
    ) -> Result<(), ManagerError> {
        {
            let tunnels = self.tunnels.read().await;
            if !tunnels.iter().any(|t| t.public == port) {
                return Err(ManagerError::NotTunneled(port));
            }
        }

        let mut domains = self.domains.write().await;
        self.send_control(Message::ReqDomainMap {
            domain: domain.clone(),
            public_port: port,
            mode: mode.clone(),
            auth_user: auth_user.clone(),
            auth_pass: auth_pass.clone(),
            rate_limit,
            smart_shield,
        })
        .await?;

        domains.retain(|d| d.domain != domain);
        domains.push(DomainRecord {
            domain,
            port,
            mode,
            auth_user,
            auth_pass,
            rate_limit,
            smart_shield,
        });
        self.persist_domains(&domains);
        Ok(())
    }

    /// §4.K `RemoveDomain`.
    pub async fn remove_domain(&self, domain: &str) -> Result<(), ManagerError> {
        self.send_control(Message::ReqDomainUnmap {
            domain: domain.to_string(),
        })
        .await?;

        let mut domains = self.domains.write().await;
        domains.retain(|d| d.domain != domain);
        self.persist_domains(&domains);
        Ok(())
    }

    /// §4.K `RestoreTunnels`: on (re)connect, replays persisted tunnels
    /// then persisted domains in stored order. Resends the wire message
    /// directly — the mappings are already stored, so this does not go
    /// through `add_tunnel`'s validation/persistence path again.
    pub async fn restore_tunnels(&self) {
        let tunnels = self.tunnels.read().await.clone();
        for t in &tunnels {
            if let Err(e) = self
                .send_control(Message::ReqBind {
                    public_port: t.public,
                    local_port: t.local,
                })
                .await
            {
                error!("failed to restore tunnel {}->{}: {e}", t.public, t.local);
            }
        }

        let domains = self.domains.read().await.clone();
        for d in &domains {
            if let Err(e) = self
                .send_control(Message::ReqDomainMap {
                    domain: d.domain.clone(),
                    public_port: d.port,
                    mode: d.mode.clone(),
                    auth_user: d.auth_user.clone(),
                    auth_pass: d.auth_pass.clone(),
                    rate_limit: d.rate_limit,
                    smart_shield: d.smart_shield,
                })
                .await
            {
                error!("failed to restore domain {}: {e}", d.domain);
            }
        }
        info!(
            "restored {} tunnel(s) and {} domain(s)",
            tunnels.len(),
            domains.len()
        );
    }

    pub async fn local_port_for(&self, public_port: u16) -> Option<u16> {
        self.tunnels
            .read()
            .await
            .iter()
            .find(|t| t.public == public_port)
            .map(|t| t.local)
    }

    /// §4.K `startPingLoop`: writes `PING{ts=now}` every
    /// [`tunnelcow_protocol::PING_INTERVAL`], serialized through the same
    /// control-write mutex as every other writer.
    pub async fn run_ping_loop(&self) {
        let mut tick = tokio::time::interval(tunnelcow_protocol::PING_INTERVAL);
        loop {
            tick.tick().await;
            let ts = now_nanos();
            if let Err(e) = self.send_control(Message::Ping { ts }).await {
                warn!("ping write failed: {e}");
                return;
            }
        }
    }

    /// §4.K `readControlLoop`: `PING` echoes update latency; `INSPECT_DATA`
    /// pushes into the Inspection Buffer. Returns once the control
    /// substream closes or errors, mirroring the server's control loop.
    pub async fn run_read_loop(&self, mut reader: ControlReader) {
        while let Some(frame) = reader.next().await {
            let msg = match frame {
                Ok(m) => m,
                Err(e) => {
                    warn!("control protocol error: {e}");
                    continue;
                }
            };

            match msg {
                Message::Ping { ts } => {
                    let rtt_nanos = now_nanos().saturating_sub(ts);
                    let rtt_ms = (rtt_nanos / 1_000_000) as u64;
                    tunnelcow_protocol::counters::record_rtt(&self.stats, rtt_ms);
                }
                Message::InspectData(rec) => {
                    self.inspect.append(rec);
                }
                Message::ReqBind { .. }
                | Message::ReqUnbind { .. }
                | Message::NewConn { .. }
                | Message::ReqDomainMap { .. }
                | Message::ReqDomainUnmap { .. }
                | Message::Unknown => {
                    debug!("ignoring unexpected control-substream tag");
                }
            }
        }
        info!("control read loop ended");
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn parse_range(spec: &str) -> Result<(u16, u16), ManagerError> {
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| ManagerError::BadRange(spec.to_string()))?;
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| ManagerError::BadRange(spec.to_string()))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| ManagerError::BadRange(spec.to_string()))?;
    if end < start {
        return Err(ManagerError::BadRange(spec.to_string()));
    }
    Ok((start, end))
}

/// §4.K `ListenForStreams`: accepts inbound data substreams opened by the
/// server (one per accepted public connection) and hands each to
/// [`handle_stream`].
pub async fn listen_for_streams(manager: Arc<ClientManager>, mut session: tunnelcow_protocol::Session) {
    while let Some(stream) = session.accept().await {
        let manager = manager.clone();
        tokio::spawn(async move {
            handle_stream(manager, stream).await;
        });
    }
    info!("substream accept loop ended");
}

/// Reads the `NEW_CONN{public_port}` header line, dials the mapped local
/// service, and splices bytes with traffic counters. A missing mapping
/// closes the stream without dialing anything.
async fn handle_stream(manager: Arc<ClientManager>, stream: Substream) {
    let mut buffered = tokio::io::BufReader::new(stream);
    let header = match read_one_line(&mut buffered).await {
        Ok(Message::NewConn { public_port }) => public_port,
        Ok(other) => {
            warn!("expected NEW_CONN header, got {other:?}");
            return;
        }
        Err(e) => {
            warn!("failed to read substream header: {e}");
            return;
        }
    };

    let Some(local_port) = manager.local_port_for(header).await else {
        debug!("no local mapping for public port {header}, dropping stream");
        return;
    };

    let local_stream = match TcpStream::connect(("127.0.0.1", local_port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to dial local service on :{local_port}: {e}");
            return;
        }
    };

    let mut counted_local = CountingStream::new(local_stream, manager.stats.clone(), Direction::Up);
    if let Err(e) = tokio::io::copy_bidirectional(&mut buffered, &mut counted_local).await {
        debug!("splice ended for public port {header}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_rejects_descending() {
        assert!(parse_range("10-5").is_err());
    }

    #[test]
    fn parse_range_parses_inclusive_bounds() {
        assert_eq!(parse_range("9000-9002").unwrap(), (9000, 9002));
    }
}

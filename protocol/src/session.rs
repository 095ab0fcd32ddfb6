//! §4.B Multiplexed Session: a thin wrapper over [`yamux`] giving both
//! ends of a Link the same symmetric `open`/`accept` contract regardless
//! of which side is the yamux client or server.
//!
//! The server always opens the Link's TCP connection as the yamux
//! *client* role (it initiated the Link per §6), and the relay server
//! accepts it as the yamux *server* role — naming here tracks who
//! dialed the TCP connection, not which side opens more substreams; both
//! sides open and accept substreams freely.

use std::sync::Arc;

use futures::future::poll_fn;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use yamux::{Config, Connection, ConnectionError};

pub use yamux::Mode;

pub type Substream = yamux::Stream;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("yamux connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("session is closed")]
    Closed,
}

/// One end of a Link's multiplexed session. `open()` asks the driver task
/// for a new outbound substream; inbound substreams arrive on `inbound`.
pub struct Session {
    control: yamux::Control,
    inbound: mpsc::Receiver<Substream>,
    driver: JoinHandle<()>,
}

impl Session {
    /// Wraps `io` (the Link's TCP stream) in a yamux connection and spawns
    /// the background task that drives its I/O. `mode` selects which side
    /// of the yamux handshake this end plays.
    pub fn new<T>(io: T, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = Connection::new(io, Config::default(), mode);
        let control = conn.control();
        let (tx, inbound) = mpsc::channel(64);

        let driver = tokio::spawn(async move {
            loop {
                match poll_fn(|cx| conn.poll_next_inbound(cx)).await {
                    Some(Ok(stream)) => {
                        if tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("session driver error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        });

        Session {
            control,
            inbound,
            driver,
        }
    }

    /// Opens a new outbound substream. Mirrors §4.B's `Open()`.
    pub async fn open(&mut self) -> Result<Substream, SessionError> {
        Ok(self.control.open_stream().await?)
    }

    /// Blocks for the next inbound substream. Mirrors §4.B's `Accept()`.
    /// Returns `None` once the session has torn down.
    pub async fn accept(&mut self) -> Option<Substream> {
        self.inbound.recv().await
    }

    /// Returns a cheaply cloneable handle that can open outbound
    /// substreams concurrently with `self` and with other handles — used
    /// when several tasks (one per bound public port) each need to open
    /// substreams on the same Link at the same time.
    pub fn opener(&self) -> SessionOpener {
        SessionOpener {
            control: self.control.clone(),
        }
    }

    /// Closes the session; every pending `open`/`accept`/read/write on
    /// every substream subsequently errors, per §5's cancellation model.
    pub async fn close(mut self) {
        let _ = self.control.close().await;
        self.driver.abort();
    }
}

/// A cloneable capability to open outbound substreams on a [`Session`],
/// independent of the `Session` value itself (which also needs to drive
/// `accept()` from its owning task).
#[derive(Clone)]
pub struct SessionOpener {
    control: yamux::Control,
}

impl SessionOpener {
    pub async fn open(&mut self) -> Result<Substream, SessionError> {
        Ok(self.control.open_stream().await?)
    }
}

/// Shared, process-wide RTT/latency counter updated by the PING handler
/// on either end. Kept alongside the session module because both the
/// control loop and the counters below feed it.
#[derive(Default)]
pub struct TrafficStats {
    pub bytes_up: std::sync::atomic::AtomicU64,
    pub bytes_down: std::sync::atomic::AtomicU64,
    pub latency_ms: std::sync::atomic::AtomicU64,
}

pub type SharedStats = Arc<TrafficStats>;

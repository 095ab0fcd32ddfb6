//! # tunnelcow-protocol
//!
//! The session core shared by the TunnelCow server and client:
//! newline-framed control messages ([`message`], [`codec`]), the
//! symmetric substream multiplexer ([`session`]), and traffic counters
//! ([`counters`]). Everything here is pure library code with no
//! knowledge of ports, domains, or HTTP — those live in `server`/`client`.

pub mod codec;
pub mod counters;
pub mod inspect;
pub mod message;
pub mod session;

pub use codec::{read_one_line, MessageCodec, ProtocolError};
pub use inspect::InspectRecord;
pub use message::Message;
pub use session::{Mode, Session, SessionError, SharedStats, Substream, TrafficStats};

/// Default control port per spec §6.
pub const DEFAULT_CONTROL_PORT: u16 = 64290;

/// How often the client sends a PING on the control substream (spec §4.A).
pub const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// How long the client waits before reconnecting after a Link error (spec §5).
pub const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

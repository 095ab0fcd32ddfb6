//! Client-side configuration: command-line flags / environment variables,
//! merged with the persisted `client_config.json` (§6) on startup.

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "TunnelCow client")]
pub struct Args {
    /// Server control address, e.g. "1.2.3.4:64290".
    #[arg(long, env = "TUNNELCOW_SERVER_ADDR")]
    pub server_addr: Option<String>,

    /// Shared token presented during the Link handshake.
    #[arg(long, env = "TUNNELCOW_TOKEN")]
    pub token: Option<String>,

    /// Directory holding the client's JSON state files.
    #[arg(long, default_value = "./data", env = "TUNNELCOW_DATA_DIR")]
    pub data_dir: std::path::PathBuf,

    /// Verbose debug logging.
    #[arg(long, env = "TUNNELCOW_DEBUG")]
    pub debug: bool,
}

/// The persisted slice of client configuration (`client_config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_addr: String,
    pub token: String,
    pub debug: bool,
}

/// Reserved dashboard port (§6) — out-of-core, but still a tunnel-port
/// validation boundary per §4.K's `AddTunnel` rejection rules.
pub const DASHBOARD_PORT: u16 = 10000;

impl ClientConfig {
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        let server_addr = args
            .server_addr
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--server-addr is required on first run"))?;
        let token = args
            .token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--token is required on first run"))?;
        Ok(ClientConfig {
            server_addr,
            token,
            debug: args.debug,
        })
    }

    /// The control port parsed out of `server_addr`, used by `AddTunnel`'s
    /// "collides with the server's own control port" rejection.
    pub fn control_port(&self) -> Option<u16> {
        self.server_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server_addr: &str) -> ClientConfig {
        ClientConfig {
            server_addr: server_addr.to_string(),
            token: "tok".to_string(),
            debug: false,
        }
    }

    #[test]
    fn control_port_parses_the_trailing_port() {
        assert_eq!(config("1.2.3.4:64290").control_port(), Some(64290));
    }

    #[test]
    fn control_port_is_none_without_a_colon() {
        assert_eq!(config("not-an-address").control_port(), None);
    }
}

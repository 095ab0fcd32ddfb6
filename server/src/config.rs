//! Server-side configuration: command-line flags / environment variables,
//! merged with the persisted `server_config.json` (§6) on startup.

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "TunnelCow relay server")]
pub struct Args {
    /// Control port clients dial to establish a Link.
    #[arg(long, default_value_t = tunnelcow_protocol::DEFAULT_CONTROL_PORT, env = "TUNNELCOW_PORT")]
    pub port: u16,

    /// Shared token clients must present on connect.
    #[arg(long, env = "TUNNELCOW_TOKEN")]
    pub token: Option<String>,

    /// Directory holding the JSON state files and the ACME cert cache.
    #[arg(long, default_value = "./data", env = "TUNNELCOW_DATA_DIR")]
    pub data_dir: std::path::PathBuf,

    /// Contact email used for ACME account registration.
    #[arg(long, env = "TUNNELCOW_ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// Disable ACME issuance; terminate TLS with a locally generated
    /// self-signed certificate instead.
    #[arg(long, env = "TUNNELCOW_NO_ACME")]
    pub no_acme: bool,

    /// Verbose debug logging.
    #[arg(long, env = "TUNNELCOW_DEBUG")]
    pub debug: bool,
}

/// The persisted slice of server configuration (`server_config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub token: String,
    pub port: u16,
    pub debug: bool,
}

impl ServerConfig {
    pub fn from_args(args: &Args, generated_token: impl FnOnce() -> String) -> Self {
        ServerConfig {
            token: args.token.clone().unwrap_or_else(generated_token),
            port: args.port,
            debug: args.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_args_generates_a_token_when_none_is_given() {
        let args = Args::parse_from(["tunnelcow-server"]);
        let config = ServerConfig::from_args(&args, || "generated".to_string());
        assert_eq!(config.token, "generated");
        assert_eq!(config.port, tunnelcow_protocol::DEFAULT_CONTROL_PORT);
    }

    #[test]
    fn from_args_prefers_the_explicit_token() {
        let args = Args::parse_from(["tunnelcow-server", "--token", "abc"]);
        let config = ServerConfig::from_args(&args, || "generated".to_string());
        assert_eq!(config.token, "abc");
    }
}

use std::path::PathBuf;

use clap::Parser;

use crate::session::DEFAULT_HISTORY_BYTES;
use crate::tunnel::TunnelType;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Serve persistent shell sessions over WebSocket, optionally through a public tunnel."
)]
pub struct Args {
    /// Host to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the HTTP and WebSocket server
    #[arg(long, env = "PORT", default_value_t = 3456)]
    pub port: u16,

    /// Tunnel to expose the server through
    #[arg(long, env = "TUNNEL_TYPE", value_enum, default_value_t = TunnelType::Auto)]
    pub tunnel: TunnelType,

    /// Shared access token (a random one is generated when omitted)
    #[arg(long, env = "SHELLMUX_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Shell started for every new session
    #[arg(long, env = "SHELL", default_value = "/bin/bash")]
    pub shell: String,

    /// Bytes of output kept per session for replay on attach
    #[arg(long, default_value_t = DEFAULT_HISTORY_BYTES)]
    pub history_bytes: usize,

    /// Working directory for sessions created without one (defaults to the current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,
}

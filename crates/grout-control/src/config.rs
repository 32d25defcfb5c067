//! Daemon configuration.

use std::path::PathBuf;

use grout_api::frame::MAX_MSG_LEN;

pub const DEFAULT_SOCK_PATH: &str = "/run/grout.sock";

/// Startup options, filled in by the daemon's argument parser.
#[derive(Debug, Clone)]
pub struct Config {
    /// API socket path: `-s` flag, else `GROUT_SOCK_PATH`, else the default.
    pub api_sock_path: PathBuf,
    /// Disable the datapath micro-sleep (busy poll).
    pub poll_mode: bool,
    /// Run without hugepages or pinned cores.
    pub test_mode: bool,
    /// Log every ingress/egress packet.
    pub trace_packets: bool,
    /// Largest accepted request payload.
    pub max_msg_len: u32,
}

impl Default for Config {
    fn default() -> Self {
        let api_sock_path = std::env::var_os("GROUT_SOCK_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCK_PATH));
        Self {
            api_sock_path,
            poll_mode: false,
            test_mode: false,
            trace_packets: false,
            max_msg_len: MAX_MSG_LEN,
        }
    }
}

impl Config {
    pub fn with_sock_path(path: impl Into<PathBuf>) -> Self {
        Self { api_sock_path: path.into(), ..Self::default() }
    }
}

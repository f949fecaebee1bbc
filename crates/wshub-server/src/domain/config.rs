//! Runtime configuration types.
//!
//! [`ServerConfig`] describes one listening server; [`SupervisorConfig`]
//! describes the process tree that runs several of them.  Both are plain
//! structs populated from CLI arguments in `main.rs`.  Nothing here reads the
//! environment or the filesystem.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How long a partial frame or handshake may take to finish arriving.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a single write to a peer may block.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest frame payload a server will buffer (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Largest upgrade request accepted before the blank line (8 KiB).
pub const DEFAULT_MAX_HANDSHAKE: usize = 8 * 1024;

/// Settings for a single [`ServerProcess`](crate::infrastructure::ServerProcess).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address and port the listening socket binds to.
    pub bind_addr: SocketAddr,

    /// Deadline for completing a partially received frame or handshake,
    /// measured from its first byte.
    pub receive_timeout: Duration,

    /// Upper bound on one blocking write to a peer.
    pub send_timeout: Duration,

    /// Frames declaring a larger payload are a protocol error.
    pub max_payload: usize,

    /// Upgrade requests larger than this are rejected with HTTP 400.
    pub max_handshake: usize,
}

impl ServerConfig {
    /// Default limits on the given address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    /// | Field           | Default        |
    /// |-----------------|----------------|
    /// | bind_addr       | `0.0.0.0:0`    |
    /// | receive_timeout | 3 seconds      |
    /// | send_timeout    | 3 seconds      |
    /// | max_payload     | 16 MiB         |
    /// | max_handshake   | 8 KiB          |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            receive_timeout: RECEIVE_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_handshake: DEFAULT_MAX_HANDSHAKE,
        }
    }
}

/// Settings for the [`DaemonSupervisor`](crate::infrastructure::DaemonSupervisor).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Address every worker binds to.
    pub address: IpAddr,

    /// Number of workers, one per consecutive port.
    pub servers: u16,

    /// Stay attached to the terminal instead of running the detach sequence.
    pub foreground: bool,
}

impl SupervisorConfig {
    /// Server config for the worker listening on `port`.
    pub fn server_config(&self, port: u16) -> ServerConfig {
        ServerConfig::new(SocketAddr::new(self.address, port))
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            servers: 2,
            foreground: false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

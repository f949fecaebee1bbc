//! ServerProcess: one bound listening socket plus the event loop serving it.

use std::io;
use std::net::{SocketAddr, TcpListener};

use thiserror::Error;
use tracing::info;

use crate::domain::ServerConfig;
use crate::infrastructure::event_loop::{EventLoop, StopHandle};

/// Fatal errors for a server process.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listening socket setup failed: {0}")]
    Socket(#[source] io::Error),

    #[error("readiness poller failed: {0}")]
    Poll(#[source] io::Error),
}

/// A listening socket and the [`EventLoop`] that serves it.
///
/// # Example
///
/// ```rust,no_run
/// use wshub_server::domain::ServerConfig;
/// use wshub_server::infrastructure::ServerProcess;
///
/// let server = ServerProcess::bind(ServerConfig::new("127.0.0.1:9001".parse().unwrap()))?;
/// let stop = server.stop_handle();
/// std::thread::spawn(move || server.run());
/// // ... later
/// stop.stop();
/// # Ok::<(), wshub_server::infrastructure::ServerError>(())
/// ```
pub struct ServerProcess {
    local_addr: SocketAddr,
    event_loop: EventLoop,
}

impl ServerProcess {
    /// Binds `config.bind_addr` and prepares the event loop.
    ///
    /// `SO_REUSEADDR` is set by the standard library on Unix, so a restart
    /// can rebind a port whose old connections are still in `TIME_WAIT`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if the socket cannot be bound or configured,
    /// or the poller cannot be created.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = config.bind_addr;
        let listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        listener.set_nonblocking(true).map_err(ServerError::Socket)?;
        let local_addr = listener.local_addr().map_err(ServerError::Socket)?;
        let event_loop = EventLoop::new(listener, config)?;

        Ok(Self {
            local_addr,
            event_loop,
        })
    }

    /// The bound address, with the real port when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.event_loop.stop_handle()
    }

    /// Serves connections until the stop handle fires (or, in a supervised
    /// worker, until SIGTERM ends the process).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Poll`] if waiting for readiness fails.
    pub fn run(self) -> Result<(), ServerError> {
        info!("listening on {}", self.local_addr);
        self.event_loop.run()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

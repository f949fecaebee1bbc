//! DaemonSupervisor: detaches from the terminal and runs one worker process
//! per assigned port.
//!
//! # Process tree (for beginners)
//!
//! ```text
//! wshub start 3
//!   └─ fork ─► exits            (shell gets its prompt back)
//!        └─ setsid, fork ─► exits
//!             └─ supervisor     (no terminal, cwd "/", stdio → /dev/null)
//!                  ├─ worker :base
//!                  ├─ worker :base+1
//!                  └─ worker :base+2
//! ```
//!
//! The supervisor itself never touches a socket.  It waits for its workers to
//! exit and, when it receives SIGTERM, forwards SIGTERM to every worker.
//! Workers run with the default SIGTERM disposition, so they die at once and
//! the kernel closes their sockets.  Once every worker has been reaped the
//! supervisor exits with status 0.

use std::io;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use crate::domain::{ChildProcess, ChildTable, PortAssignment, PortError, SupervisorConfig};
use crate::infrastructure::process::{self, ChildExit, Fork, Reaped};
use crate::infrastructure::ServerProcess;

/// Pause between non-blocking reap attempts.
const REAP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Ports(#[from] PortError),

    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),

    #[error("failed to detach from the terminal: {0}")]
    Detach(#[source] io::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("waiting for workers failed: {0}")]
    Reap(#[source] io::Error),
}

pub struct DaemonSupervisor {
    config: SupervisorConfig,
    ports: PortAssignment,
    children: ChildTable,
}

impl DaemonSupervisor {
    pub fn new(config: SupervisorConfig, ports: PortAssignment) -> Self {
        Self {
            config,
            ports,
            children: ChildTable::new(),
        }
    }

    /// Picks a random port range for `config.servers` workers.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Ports`] if the count is zero or too large.
    pub fn from_config(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let ports = PortAssignment::random(config.servers)?;
        Ok(Self::new(config, ports))
    }

    pub fn ports(&self) -> PortAssignment {
        self.ports
    }

    /// Detaches (unless in foreground mode), forks the workers and reaps
    /// them.  Returns once every worker is gone.
    ///
    /// In detached mode the calling process and an intermediate child exit
    /// with status 0 inside this call; only the daemon returns.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError`] if detaching, installing the signal
    /// handler, forking or waiting fails.  Workers already started are
    /// terminated and reaped before a fork error is returned.
    pub fn run(mut self) -> Result<(), SupervisorError> {
        if self.config.foreground {
            process::install_termination_handler(libc::SIGINT)
                .map_err(SupervisorError::Signal)?;
        } else {
            info!(
                "detaching; {} servers will listen on ports {}..={}",
                self.ports.count(),
                self.ports.base(),
                last_port(self.ports)
            );
            detach()?;
        }
        process::install_termination_handler(libc::SIGTERM).map_err(SupervisorError::Signal)?;
        info!(
            pid = std::process::id(),
            "supervising {} servers on ports {}..={}",
            self.ports.count(),
            self.ports.base(),
            last_port(self.ports)
        );

        let mut spawn_error = None;
        for port in self.ports.ports() {
            match self.spawn(port) {
                Ok(child) => self.children.insert(child),
                Err(e) => {
                    error!("cannot start server on port {port}: {e}");
                    spawn_error = Some(e);
                    break;
                }
            }
        }
        if spawn_error.is_some() {
            self.forward_termination();
        }

        self.reap_all()?;
        info!("all servers stopped");
        spawn_error.map_or(Ok(()), Err)
    }

    fn spawn(&self, port: u16) -> Result<ChildProcess, SupervisorError> {
        match process::fork().map_err(SupervisorError::Fork)? {
            Fork::Child => std::process::exit(run_worker(&self.config, port)),
            Fork::Parent(pid) => {
                info!("server on port {port} started as pid {pid}");
                Ok(ChildProcess { pid, port })
            }
        }
    }

    fn forward_termination(&self) {
        info!("forwarding SIGTERM to {} servers", self.children.len());
        for child in self.children.iter() {
            if let Err(e) = process::send_signal(child.pid, libc::SIGTERM) {
                warn!(
                    "failed to signal pid {} (port {}): {e}",
                    child.pid, child.port
                );
            }
        }
    }

    fn reap_all(&mut self) -> Result<(), SupervisorError> {
        while !self.children.is_empty() {
            if process::take_termination_request() {
                self.forward_termination();
            }

            match process::reap_nonblocking() {
                Ok(Reaped::Exited { pid, exit }) => {
                    match self.children.remove(pid) {
                        Some(child) => log_exit(child, exit),
                        None => debug!("reaped untracked pid {pid}"),
                    }
                    continue;
                }
                Ok(Reaped::NoneReady) => {}
                Ok(Reaped::NoChildren) => {
                    warn!(
                        "no workers left to wait for; forgetting {} entries",
                        self.children.len()
                    );
                    self.children.clear();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SupervisorError::Reap(e)),
            }
            thread::sleep(REAP_INTERVAL);
        }
        Ok(())
    }
}

/// Fork, exit, `setsid`, ignore SIGINT/SIGHUP, fork, exit, then cut the
/// remaining ties to the launching environment.
fn detach() -> Result<(), SupervisorError> {
    if let Fork::Parent(_) = process::fork().map_err(SupervisorError::Fork)? {
        std::process::exit(0);
    }
    process::create_session().map_err(SupervisorError::Detach)?;
    for signal in [libc::SIGINT, libc::SIGHUP] {
        process::ignore_signal(signal).map_err(SupervisorError::Signal)?;
    }
    if let Fork::Parent(_) = process::fork().map_err(SupervisorError::Fork)? {
        std::process::exit(0);
    }
    process::clear_file_mode_mask();
    std::env::set_current_dir("/").map_err(SupervisorError::Detach)?;
    process::redirect_std_streams_to_null().map_err(SupervisorError::Detach)
}

/// Body of a forked worker.  Returns the process exit code.
fn run_worker(config: &SupervisorConfig, port: u16) -> i32 {
    let span = info_span!("server", port, pid = std::process::id());
    let _guard = span.enter();

    if let Err(e) = process::default_signal(libc::SIGTERM) {
        error!("cannot restore SIGTERM: {e}");
        return 1;
    }
    // A SIGTERM that landed before the reset only set the inherited flag.
    if process::take_termination_request() {
        return 0;
    }

    let server = match ServerProcess::bind(config.server_config(port)) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };
    match server.run() {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    }
}

fn log_exit(child: ChildProcess, exit: ChildExit) {
    match exit {
        ChildExit::Code(0) => info!("server on port {} (pid {}) exited", child.port, child.pid),
        ChildExit::Code(code) => warn!(
            "server on port {} (pid {}) exited with status {code}",
            child.port, child.pid
        ),
        ChildExit::Signal(signal) => info!(
            "server on port {} (pid {}) terminated by signal {signal}",
            child.port, child.pid
        ),
    }
}

fn last_port(ports: PortAssignment) -> u16 {
    ports.ports().last().unwrap_or(ports.base())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Infrastructure layer for wshub-server.
//!
//! Everything that talks to the operating system lives here.
//!
//! # Responsibilities
//!
//! - Binding the listening socket and waiting for readiness (`polling`)
//! - Reading from and writing to peer sockets
//! - Forking workers, handling signals and reaping children (`libc`)
//!
//! # What does NOT belong here?
//!
//! - Frame and handshake parsing (that is `wshub-core`)
//! - Who receives a broadcast (that is the application layer)
//! - Configuration parsing (that is done in `main.rs`)

pub mod event_loop;
pub mod process;
pub mod server;
pub mod supervisor;

pub use event_loop::{EventLoop, StopHandle};
pub use server::{ServerError, ServerProcess};
pub use supervisor::{DaemonSupervisor, SupervisorError};

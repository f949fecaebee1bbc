//! Application layer for wshub-server.
//!
//! The application layer decides *what* happens to a message: who receives
//! it, how it is announced, and which peers are dropped when delivery fails.
//! It never touches the readiness poller or the OS directly.
//!
//! # Responsibilities
//!
//! - Owning the OPEN connections of one server process
//! - Best-effort fan-out with per-peer failure isolation
//! - Formatting the join / leave / relay announcements
//!
//! # What does NOT belong here?
//!
//! - Accepting sockets and waiting for readiness (that is infrastructure)
//! - The upgrade handshake and frame codec (that is `wshub-core`)

pub mod registry;

pub use registry::{Connection, ConnectionRegistry, Fanout};

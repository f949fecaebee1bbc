//! Domain layer for wshub-server.
//!
//! Pure types with no sockets, no syscalls and no logging: configuration,
//! connection identity and lifecycle, port ranges, and the supervisor's
//! child table.  Everything here is testable without a network.

pub mod children;
pub mod config;
pub mod connection;
pub mod ports;

pub use children::{ChildProcess, ChildTable, Pid};
pub use config::{ServerConfig, SupervisorConfig};
pub use connection::{ConnectionId, ConnectionIdAllocator, ConnectionState, StateError};
pub use ports::{PortAssignment, PortError};

//! wshub-server library crate.
//!
//! A multi-port WebSocket broadcast server: every message a client sends is
//! relayed to every other client connected to the same port.  One worker
//! process serves each port; a supervisor process starts the workers and
//! stops them on SIGTERM.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! wshub start N
//!   └── DaemonSupervisor            forks one worker per port
//!         └── ServerProcess         one listening socket
//!               └── EventLoop       readiness wait, accept, read
//!                     ├── wshub-core        handshake + frame codec
//!                     └── ConnectionRegistry best-effort fan-out
//! ```
//!
//! - `domain/`         Pure types: config, connection ids and states, ports
//! - `application/`    ConnectionRegistry and the join/leave announcements
//! - `infrastructure/` Event loop, server process, supervisor, libc wrappers
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no logging.
//! - `application` depends on `domain` and `wshub-core`; it is generic over
//!   the socket type so it can be tested with in-memory writers.
//! - `infrastructure` depends on all other layers plus `polling` and `libc`.

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: connection registry and broadcast.
pub mod application;

/// Infrastructure layer: sockets, readiness, processes and signals.
pub mod infrastructure;

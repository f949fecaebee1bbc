//! # wshub-core
//!
//! Wire-level building blocks for the wshub WebSocket server: the RFC 6455
//! frame codec and the server side of the HTTP Upgrade handshake.
//!
//! This crate has no dependencies on sockets, processes, or OS APIs.  It
//! turns bytes into typed values and back, which keeps it trivially testable
//! and lets the server crate own every I/O decision.
//!
//! # Architecture overview (for beginners)
//!
//! A WebSocket connection starts life as an ordinary HTTP request.  The
//! client asks the server to "upgrade" the TCP connection; if the server
//! agrees, both sides stop speaking HTTP and start exchanging *frames*.
//!
//! - **`protocol::handshake`** – Validates the upgrade request and computes
//!   the `Sec-WebSocket-Accept` proof (`base64(SHA1(key + GUID))`).
//!
//! - **`protocol::frame`** – Encodes and decodes frames: a 2–14 byte header
//!   (FIN flag, opcode, three-tier payload length, optional mask key)
//!   followed by the payload.

pub mod protocol;

// Re-export the most-used items at the crate root so callers can write
// `wshub_core::decode_frame` instead of `wshub_core::protocol::frame::decode_frame`.
pub use protocol::frame::{decode_frame, encode_frame, peek_header, Frame, FrameError, Opcode};
pub use protocol::handshake::{negotiate, HandshakeError, Negotiation};

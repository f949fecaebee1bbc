//! Protocol module containing the frame codec and the upgrade handshake.

pub mod frame;
pub mod handshake;

pub use frame::{decode_frame, encode_frame, peek_header, Frame, FrameError, FrameHeader, Opcode};
pub use handshake::{
    compute_accept_key, find_request_end, negotiate, reject, HandshakeError, Negotiation,
};

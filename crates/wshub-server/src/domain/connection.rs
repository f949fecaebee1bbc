//! Connection identity and lifecycle.
//!
//! # Connection lifecycle (for beginners)
//!
//! ```text
//! Accepted ──► Handshaking ──► Open ──► Closing ──► Closed
//!                   │            │                    ▲
//!                   └────────────┴────────────────────┘
//! ```
//!
//! - `Accepted`: the TCP connection was accepted from the listening socket.
//! - `Handshaking`: waiting for (or processing) the HTTP upgrade request.
//! - `Open`: frames are flowing; the connection is in the registry.
//! - `Closing`: a Close frame was received and is being echoed back.
//! - `Closed`: the socket is gone.
//!
//! A rejected handshake goes straight from `Handshaking` to `Closed`.  A read
//! error, EOF or failed write goes straight from `Open` to `Closed`;
//! `Closing` is only used for the Close-frame exchange.

use std::fmt;

use thiserror::Error;

/// Stable identifier for a connection within one server process.
///
/// Ids are handed out in increasing order and never reused, so unlike a raw
/// socket descriptor an id cannot alias a later connection after the OS
/// recycles the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out increasing [`ConnectionId`]s starting at `first`.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: u64,
}

impl ConnectionIdAllocator {
    pub fn starting_at(first: u64) -> Self {
        Self { next: first }
    }

    pub fn allocate(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next);
        self.next += 1;
        id
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Attempted a transition the lifecycle does not allow.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid connection state transition: {from:?} -> {to:?}")]
pub struct StateError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    /// Returns `true` if the lifecycle has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Accepted, Handshaking)
                | (Handshaking, Open)
                | (Handshaking, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }

    /// Moves to `next`, or reports the illegal edge.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the transition is not part of the lifecycle.
    pub fn advance(self, next: ConnectionState) -> Result<ConnectionState, StateError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateError {
                from: self,
                to: next,
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path_transitions() {
        let state = Accepted
            .advance(Handshaking)
            .and_then(|s| s.advance(Open))
            .and_then(|s| s.advance(Closing))
            .and_then(|s| s.advance(Closed));
        assert_eq!(state, Ok(Closed));
    }

    #[test]
    fn test_rejected_handshake_closes_directly() {
        assert_eq!(Handshaking.advance(Closed), Ok(Closed));
    }

    #[test]
    fn test_open_closes_directly_on_error() {
        assert_eq!(Open.advance(Closed), Ok(Closed));
    }

    #[test]
    fn test_accepted_cannot_skip_handshake() {
        assert_eq!(
            Accepted.advance(Open),
            Err(StateError {
                from: Accepted,
                to: Open
            })
        );
    }

    #[test]
    fn test_closing_only_reachable_from_open() {
        assert!(!Handshaking.can_transition_to(Closing));
        assert!(!Accepted.can_transition_to(Closing));
        assert!(Open.can_transition_to(Closing));
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in [Accepted, Handshaking, Open, Closing, Closed] {
            assert!(!Closed.can_transition_to(next), "Closed -> {next:?}");
        }
    }

    #[test]
    fn test_allocator_hands_out_increasing_ids() {
        let mut ids = ConnectionIdAllocator::starting_at(1);
        let a = ids.allocate();
        let b = ids.allocate();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
        assert!(a < b);
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(42).to_string(), "42");
    }
}

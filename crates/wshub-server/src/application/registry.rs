//! ConnectionRegistry: the set of OPEN connections and best-effort fan-out.
//!
//! # Broadcast semantics (for beginners)
//!
//! A broadcast encodes the message *once* and then writes the same bytes to
//! every registered peer, one after another, in the order the peers joined.
//! If the write to one peer fails (it hung up, its buffer is full for longer
//! than the send timeout, ...), that peer alone is removed and the broadcast
//! carries on with the next one.  Nothing is retried and nothing is rolled
//! back: delivery is *best effort*.
//!
//! Evicted peers are handed back to the caller inside [`Fanout`] so the event
//! loop can stop watching their sockets before they are closed, and announce
//! their departure to everyone else.
//!
//! # Ownership
//!
//! The registry owns each [`Connection`] outright, including its socket.  It
//! is generic over the socket type `S` (anything implementing
//! [`std::io::Write`]) so tests can use in-memory peers instead of
//! `TcpStream`.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use wshub_core::{encode_frame, Frame, Opcode};

use crate::domain::{ConnectionId, ConnectionState, StateError};

/// One peer connection: socket, identity, lifecycle state, and any partial
/// inbound data that has not yet formed a complete frame or request.
#[derive(Debug)]
pub struct Connection<S> {
    id: ConnectionId,
    stream: S,
    state: ConnectionState,
    peer_addr: Option<SocketAddr>,
    joined_at: Instant,
    inbox: Vec<u8>,
    partial_since: Option<Instant>,
}

impl<S> Connection<S> {
    /// A freshly accepted connection.
    pub fn new(id: ConnectionId, stream: S, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            stream,
            state: ConnectionState::Accepted,
            peer_addr,
            joined_at: Instant::now(),
            inbox: Vec::new(),
            partial_since: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// When the connection reached OPEN (or was accepted, before that).
    pub fn joined_at(&self) -> Instant {
        self.joined_at
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Moves the lifecycle forward; entering OPEN stamps the join time.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] for an edge the lifecycle does not have.
    pub fn advance(&mut self, next: ConnectionState) -> Result<(), StateError> {
        self.state = self.state.advance(next)?;
        if next == ConnectionState::Open {
            self.joined_at = Instant::now();
        }
        Ok(())
    }

    /// Bytes received but not yet consumed.
    pub fn inbox(&self) -> &[u8] {
        &self.inbox
    }

    /// Appends freshly read bytes.  The receive clock starts with the first
    /// byte of a partial unit.
    pub fn buffer_inbound(&mut self, bytes: &[u8], now: Instant) {
        if bytes.is_empty() {
            return;
        }
        if self.inbox.is_empty() {
            self.partial_since = Some(now);
        }
        self.inbox.extend_from_slice(bytes);
    }

    /// Drops the first `n` buffered bytes after a complete frame or request
    /// was parsed from them.  Any remainder is a new partial unit.
    pub fn consume_inbound(&mut self, n: usize, now: Instant) {
        self.inbox.drain(..n.min(self.inbox.len()));
        self.partial_since = if self.inbox.is_empty() {
            None
        } else {
            Some(now)
        };
    }

    /// Instant by which the buffered partial data must be completed.
    pub fn receive_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.partial_since.map(|since| since + timeout)
    }
}

/// Result of one fan-out.
#[derive(Debug)]
pub struct Fanout<S> {
    /// Peers that received the message.
    pub delivered: usize,
    /// Peers whose write failed; already removed and marked CLOSED.
    pub evicted: Vec<Connection<S>>,
}

impl<S> Default for Fanout<S> {
    fn default() -> Self {
        Self {
            delivered: 0,
            evicted: Vec::new(),
        }
    }
}

/// Insertion-ordered table of OPEN connections for one server process.
///
/// Connection ids are allocated in increasing order, so a `BTreeMap` keyed
/// by id iterates in join order.
#[derive(Debug)]
pub struct ConnectionRegistry<S> {
    connections: BTreeMap<ConnectionId, Connection<S>>,
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self {
            connections: BTreeMap::new(),
        }
    }
}

impl<S: Write> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an OPEN connection.
    pub fn register(&mut self, connection: Connection<S>) {
        debug_assert_eq!(connection.state(), ConnectionState::Open);
        self.connections.insert(connection.id(), connection);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection<S>> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<S>> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids in join order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Connections in join order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection<S>> {
        self.connections.values()
    }

    /// Empties the registry, yielding every connection.
    pub fn drain(&mut self) -> Vec<Connection<S>> {
        std::mem::take(&mut self.connections).into_values().collect()
    }

    /// Encodes `message` once and writes it to every connection except
    /// `exclude`.
    ///
    /// A peer whose write fails is marked CLOSED, removed, and returned in
    /// [`Fanout::evicted`]; the remaining peers still receive the message.
    pub fn broadcast(
        &mut self,
        message: &[u8],
        opcode: Opcode,
        exclude: Option<ConnectionId>,
    ) -> Fanout<S> {
        let bytes = encode_frame(message, opcode);
        let mut fanout = Fanout::default();
        let mut failed = Vec::new();

        for (id, connection) in self.connections.iter_mut() {
            if Some(*id) == exclude {
                continue;
            }
            match connection.stream.write_all(&bytes) {
                Ok(()) => {
                    fanout.delivered += 1;
                    debug!("written {} bytes to client({id})", bytes.len());
                }
                Err(e) => {
                    warn!("write to client({id}) failed: {e}");
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            if let Some(mut connection) = self.connections.remove(&id) {
                if let Err(e) = connection.advance(ConnectionState::Closed) {
                    warn!("client({id}): {e}");
                }
                fanout.evicted.push(connection);
            }
        }
        fanout
    }

    /// Announces `id` to everyone else.
    pub fn notify_joined(&mut self, id: ConnectionId) -> Fanout<S> {
        self.broadcast(joined_notice(id).as_bytes(), Opcode::Text, Some(id))
    }

    /// Announces that `id` left.  `id` is normally already unregistered.
    pub fn notify_left(&mut self, id: ConnectionId) -> Fanout<S> {
        self.broadcast(left_notice(id).as_bytes(), Opcode::Text, Some(id))
    }

    /// Forwards a data frame from `from` to every other peer.
    ///
    /// Text is wrapped in a `Client(<id>) said: ...` announcement; binary
    /// payloads are relayed verbatim.
    pub fn relay(&mut self, from: ConnectionId, frame: &Frame) -> Fanout<S> {
        match frame.opcode {
            Opcode::Binary => self.broadcast(&frame.payload, Opcode::Binary, Some(from)),
            _ => {
                let text = String::from_utf8_lossy(&frame.payload);
                self.broadcast(said_notice(from, &text).as_bytes(), Opcode::Text, Some(from))
            }
        }
    }
}

// ── Announcements ─────────────────────────────────────────────────────────────

pub fn joined_notice(id: ConnectionId) -> String {
    format!("Client({id}) joined")
}

pub fn left_notice(id: ConnectionId) -> String {
    format!("Client({id}) left")
}

pub fn said_notice(id: ConnectionId, text: &str) -> String {
    format!("Client({id}) said: {text}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io;

    use wshub_core::decode_frame;

    use super::*;

    /// In-memory peer that records every write, or fails every write when
    /// `should_fail` is set.
    #[derive(Debug, Default)]
    struct MockPeer {
        written: Vec<u8>,
        should_fail: bool,
    }

    impl MockPeer {
        fn failing() -> Self {
            Self {
                should_fail: true,
                ..Self::default()
            }
        }

        /// Decodes every frame written so far.
        fn frames(&self) -> Vec<Frame> {
            let mut frames = Vec::new();
            let mut rest = self.written.as_slice();
            while !rest.is_empty() {
                let (frame, used) = decode_frame(rest).expect("valid frame");
                frames.push(frame);
                rest = &rest[used..];
            }
            frames
        }

        fn texts(&self) -> Vec<String> {
            self.frames()
                .into_iter()
                .map(|f| String::from_utf8(f.payload).unwrap())
                .collect()
        }
    }

    impl Write for MockPeer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.should_fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn open(id: u64, peer: MockPeer) -> Connection<MockPeer> {
        let mut connection = Connection::new(ConnectionId::new(id), peer, None);
        connection.advance(ConnectionState::Handshaking).unwrap();
        connection.advance(ConnectionState::Open).unwrap();
        connection
    }

    fn registry_of(peers: Vec<MockPeer>) -> ConnectionRegistry<MockPeer> {
        let mut registry = ConnectionRegistry::new();
        for (i, peer) in peers.into_iter().enumerate() {
            registry.register(open(i as u64 + 1, peer));
        }
        registry
    }

    fn id(raw: u64) -> ConnectionId {
        ConnectionId::new(raw)
    }

    // ── Broadcast ─────────────────────────────────────────────────────────────

    #[test]
    fn test_broadcast_isolates_failing_peer() {
        // Arrange: #2 fails every write
        let mut registry =
            registry_of(vec![MockPeer::default(), MockPeer::failing(), MockPeer::default()]);

        // Act
        let fanout = registry.broadcast(b"hello", Opcode::Text, None);

        // Assert: #1 and #3 received it, #2 was evicted
        assert_eq!(fanout.delivered, 2);
        assert_eq!(fanout.evicted.len(), 1);
        assert_eq!(fanout.evicted[0].id(), id(2));
        assert_eq!(fanout.evicted[0].state(), ConnectionState::Closed);
        assert_eq!(registry.ids(), vec![id(1), id(3)]);
        for survivor in [1, 3] {
            let peer = registry.get(id(survivor)).unwrap().stream();
            assert_eq!(peer.texts(), vec!["hello".to_string()]);
        }
    }

    #[test]
    fn test_broadcast_skips_excluded_connection() {
        let mut registry = registry_of(vec![MockPeer::default(), MockPeer::default()]);

        let fanout = registry.broadcast(b"x", Opcode::Text, Some(id(1)));

        assert_eq!(fanout.delivered, 1);
        assert!(registry.get(id(1)).unwrap().stream().written.is_empty());
        assert_eq!(registry.get(id(2)).unwrap().stream().texts(), vec!["x"]);
    }

    #[test]
    fn test_broadcast_to_empty_registry_delivers_nothing() {
        let mut registry: ConnectionRegistry<MockPeer> = ConnectionRegistry::new();
        let fanout = registry.broadcast(b"anyone?", Opcode::Text, None);
        assert_eq!(fanout.delivered, 0);
        assert!(fanout.evicted.is_empty());
    }

    #[test]
    fn test_broadcast_writes_single_unmasked_frame_per_peer() {
        let mut registry = registry_of(vec![MockPeer::default()]);
        let payload = vec![b'a'; 70_000];

        registry.broadcast(&payload, Opcode::Text, None);

        let frames = registry.get(id(1)).unwrap().stream().frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mask_key, None);
        assert_eq!(frames[0].payload, payload);
    }

    // ── Announcements ─────────────────────────────────────────────────────────

    #[test]
    fn test_notify_joined_reaches_everyone_but_newcomer() {
        let mut registry = registry_of(vec![MockPeer::default(), MockPeer::default()]);

        registry.notify_joined(id(2));

        assert_eq!(
            registry.get(id(1)).unwrap().stream().texts(),
            vec!["Client(2) joined"]
        );
        assert!(registry.get(id(2)).unwrap().stream().written.is_empty());
    }

    #[test]
    fn test_notify_left_after_removal() {
        let mut registry = registry_of(vec![MockPeer::default(), MockPeer::default()]);
        registry.remove(id(1));

        registry.notify_left(id(1));

        assert_eq!(
            registry.get(id(2)).unwrap().stream().texts(),
            vec!["Client(1) left"]
        );
    }

    #[test]
    fn test_relay_text_prefixes_sender() {
        let mut registry = registry_of(vec![MockPeer::default(), MockPeer::default()]);

        registry.relay(id(1), &Frame::text("hi all"));

        assert_eq!(
            registry.get(id(2)).unwrap().stream().texts(),
            vec!["Client(1) said: hi all"]
        );
        assert!(registry.get(id(1)).unwrap().stream().written.is_empty());
    }

    #[test]
    fn test_relay_binary_is_verbatim() {
        let mut registry = registry_of(vec![MockPeer::default(), MockPeer::default()]);
        let frame = Frame::new(Opcode::Binary, vec![0u8, 159, 146, 150]);

        registry.relay(id(2), &frame);

        let frames = registry.get(id(1)).unwrap().stream().frames();
        assert_eq!(frames[0].opcode, Opcode::Binary);
        assert_eq!(frames[0].payload, vec![0u8, 159, 146, 150]);
    }

    #[test]
    fn test_drain_empties_registry_in_join_order() {
        let mut registry = registry_of(vec![MockPeer::default(), MockPeer::default()]);
        let drained: Vec<ConnectionId> = registry.drain().iter().map(Connection::id).collect();
        assert_eq!(drained, vec![id(1), id(2)]);
        assert!(registry.is_empty());
    }

    // ── Connection buffering ──────────────────────────────────────────────────

    #[test]
    fn test_receive_deadline_starts_with_first_partial_byte() {
        let mut connection = Connection::new(id(1), MockPeer::default(), None);
        let t0 = Instant::now();
        assert_eq!(connection.receive_deadline(Duration::from_secs(3)), None);

        connection.buffer_inbound(b"ab", t0);
        connection.buffer_inbound(b"cd", t0 + Duration::from_secs(1));

        assert_eq!(
            connection.receive_deadline(Duration::from_secs(3)),
            Some(t0 + Duration::from_secs(3))
        );
    }

    #[test]
    fn test_consume_inbound_clears_deadline_when_empty() {
        let mut connection = Connection::new(id(1), MockPeer::default(), None);
        let t0 = Instant::now();
        connection.buffer_inbound(b"abcd", t0);

        connection.consume_inbound(2, t0);
        assert_eq!(connection.inbox(), b"cd");
        assert!(connection.receive_deadline(Duration::from_secs(3)).is_some());

        connection.consume_inbound(2, t0);
        assert!(connection.inbox().is_empty());
        assert_eq!(connection.receive_deadline(Duration::from_secs(3)), None);
    }

    #[test]
    fn test_advance_rejects_illegal_edge() {
        let mut connection = Connection::new(id(1), MockPeer::default(), None);
        assert!(connection.advance(ConnectionState::Open).is_err());
        assert_eq!(connection.state(), ConnectionState::Accepted);
    }
}

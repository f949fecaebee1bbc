//! Readiness-driven event loop for one listening socket.
//!
//! # How one iteration works (for beginners)
//!
//! 1. Check the stop flag.
//! 2. Block in a single readiness wait over the listener and every client
//!    socket.  The wait has no timeout unless some client has sent part of
//!    a frame (or handshake); then it wakes at the earliest deadline.
//! 3. For each ready socket:
//!    - the listener: accept every queued connection and start its
//!      handshake;
//!    - a handshaking client: read once, and negotiate when the request is
//!      complete;
//!    - an open client: read once, then handle every complete frame now in
//!      its buffer.
//! 4. Drop every client whose partial frame or handshake missed its deadline.
//!
//! Peer sockets stay in blocking mode.  Readiness guarantees a single read
//! will not block, and writes are capped by the send timeout.
//!
//! # Poller keys
//!
//! Key `0` is the listener.  Each client is registered under its
//! [`ConnectionId`], which is never reused, so a late event for a socket that
//! was already closed is recognised and ignored.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use polling::{Event, Events, PollMode, Poller};
use tracing::{debug, info, warn};
use wshub_core::protocol::frame::MAX_INLINE_LEN;
use wshub_core::protocol::handshake::{bad_request_response, find_request_end, reject};
use wshub_core::{
    decode_frame, encode_frame, negotiate, peek_header, Frame, FrameError, HandshakeError,
    Negotiation, Opcode,
};

use crate::application::{Connection, ConnectionRegistry, Fanout};
use crate::domain::{ConnectionId, ConnectionIdAllocator, ConnectionState, ServerConfig};
use crate::infrastructure::server::ServerError;

/// Poller key of the listening socket.
const LISTENER_KEY: usize = 0;

/// Bytes requested from a ready socket per read.
const READ_CHUNK: usize = 16 * 1024;

type Peer = Connection<TcpStream>;

/// Requests shutdown of a running [`EventLoop`] from another thread.
#[derive(Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    poller: Arc<Poller>,
}

impl StopHandle {
    /// Sets the stop flag and wakes the readiness wait.
    pub fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.poller.notify() {
            warn!("failed to wake event loop: {e}");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("requested", &self.is_stopped())
            .finish()
    }
}

enum ReadOutcome {
    Data,
    Eof,
    Failed(io::Error),
}

/// Accept/read/broadcast loop over one listening socket.
pub struct EventLoop {
    poller: Arc<Poller>,
    listener: TcpListener,
    config: ServerConfig,
    ids: ConnectionIdAllocator,
    /// Connections still in the upgrade handshake.
    handshaking: BTreeMap<ConnectionId, Peer>,
    registry: ConnectionRegistry<TcpStream>,
    stop: Arc<AtomicBool>,
    scratch: Vec<u8>,
}

impl EventLoop {
    /// Takes ownership of a bound, non-blocking listener and watches it.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Poll`] if the poller cannot be created or the
    /// listener cannot be registered.
    pub fn new(listener: TcpListener, config: ServerConfig) -> Result<Self, ServerError> {
        let poller = Poller::new().map_err(ServerError::Poll)?;
        // SAFETY: the listener is owned by the loop and removed from the
        // poller in `shutdown` before it is dropped.
        unsafe {
            poller.add_with_mode(&listener, Event::readable(LISTENER_KEY), PollMode::Level)
        }
        .map_err(ServerError::Poll)?;

        Ok(Self {
            poller: Arc::new(poller),
            listener,
            config,
            ids: ConnectionIdAllocator::starting_at(1),
            handshaking: BTreeMap::new(),
            registry: ConnectionRegistry::new(),
            stop: Arc::new(AtomicBool::new(false)),
            scratch: vec![0; READ_CHUNK],
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            requested: Arc::clone(&self.stop),
            poller: Arc::clone(&self.poller),
        }
    }

    /// Runs until the stop handle fires.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Poll`] if the readiness wait itself fails.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::new();
        let result = loop {
            if self.stop.load(Ordering::SeqCst) {
                break Ok(());
            }

            events.clear();
            let timeout = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            match self.poller.wait(&mut events, timeout) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(ServerError::Poll(e)),
            }

            for event in events.iter() {
                if event.key == LISTENER_KEY {
                    self.accept_pending();
                } else {
                    self.on_readable(ConnectionId::new(event.key as u64));
                }
            }
            self.expire_partials(Instant::now());
        };
        self.shutdown();
        result
    }

    // ── Accept ────────────────────────────────────────────────────────────────

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.ids.allocate();
        if let Err(e) = self.configure(&stream) {
            warn!("client({id}) from {peer}: socket setup failed: {e}");
            return;
        }
        // SAFETY: the stream is owned by `handshaking` or `registry` for as
        // long as it is registered; `release` deletes it before dropping.
        let added = unsafe {
            self.poller
                .add_with_mode(&stream, Event::readable(key_of(id)), PollMode::Level)
        };
        if let Err(e) = added {
            warn!("client({id}) from {peer}: cannot watch socket: {e}");
            return;
        }

        let mut connection = Connection::new(id, stream, Some(peer));
        advance(&mut connection, ConnectionState::Handshaking);
        debug!("client({id}) connected from {peer}");
        self.handshaking.insert(id, connection);
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        // Accepted sockets inherit O_NONBLOCK from the listener on some
        // platforms.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.receive_timeout))?;
        stream.set_write_timeout(Some(self.config.send_timeout))?;
        stream.set_nodelay(true)
    }

    fn on_readable(&mut self, id: ConnectionId) {
        if self.handshaking.contains_key(&id) {
            self.read_handshake(id);
        } else if self.registry.contains(id) {
            self.read_frames(id);
        }
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    fn read_handshake(&mut self, id: ConnectionId) {
        let now = Instant::now();
        let Some(connection) = self.handshaking.get_mut(&id) else {
            return;
        };
        match read_into(connection, &mut self.scratch, now) {
            ReadOutcome::Data => {}
            ReadOutcome::Eof => {
                debug!("client({id}) hung up during handshake");
                self.abandon(id);
                return;
            }
            ReadOutcome::Failed(e) => {
                warn!("client({id}) read failed during handshake: {e}");
                self.abandon(id);
                return;
            }
        }

        let limit = self.config.max_handshake;
        let negotiation = match find_request_end(connection.inbox()) {
            Some(end) if end <= limit => {
                let negotiation = negotiate(&connection.inbox()[..end]);
                connection.consume_inbound(end, now);
                negotiation
            }
            Some(_) => reject(HandshakeError::RequestTooLarge { limit }),
            None if connection.inbox().len() > limit => {
                reject(HandshakeError::RequestTooLarge { limit })
            }
            None => return,
        };

        match negotiation {
            Negotiation::Accepted {
                accept_key,
                response,
            } => {
                debug!("client({id}) upgrade accepted (Sec-WebSocket-Accept: {accept_key})");
                self.open(id, &response)
            }
            Negotiation::Rejected { reason, response } => self.refuse(id, &reason, &response),
        }
    }

    fn open(&mut self, id: ConnectionId, response: &[u8]) {
        let Some(mut connection) = self.handshaking.remove(&id) else {
            return;
        };
        if let Err(e) = connection.stream_mut().write_all(response) {
            warn!("client({id}) handshake response failed: {e}");
            advance(&mut connection, ConnectionState::Closed);
            self.release(connection);
            return;
        }
        advance(&mut connection, ConnectionState::Open);
        let has_frames = !connection.inbox().is_empty();
        let peer = connection.peer_addr();
        self.registry.register(connection);
        match peer {
            Some(peer) => info!(
                "client({id}) joined from {peer} ({} online)",
                self.registry.len()
            ),
            None => info!("client({id}) joined ({} online)", self.registry.len()),
        }

        let fanout = self.registry.notify_joined(id);
        self.settle(fanout);

        // Frames pipelined behind the upgrade request.
        if has_frames {
            self.process_frames(id);
        }
    }

    fn refuse(&mut self, id: ConnectionId, reason: &HandshakeError, response: &[u8]) {
        let Some(mut connection) = self.handshaking.remove(&id) else {
            return;
        };
        info!("client({id}) handshake rejected: {reason}");
        if let Err(e) = connection.stream_mut().write_all(response) {
            debug!("client({id}) rejection not delivered: {e}");
        }
        advance(&mut connection, ConnectionState::Closed);
        // Closing with unread input would reset the connection and discard
        // the response before the client reads it.
        let budget = self.config.receive_timeout;
        if let Err(e) = linger_close(connection.stream_mut(), &mut self.scratch, budget) {
            debug!("client({id}) rejection linger ended early: {e}");
        }
        self.release(connection);
    }

    fn abandon(&mut self, id: ConnectionId) {
        if let Some(mut connection) = self.handshaking.remove(&id) {
            advance(&mut connection, ConnectionState::Closed);
            self.release(connection);
        }
    }

    // ── Frames ────────────────────────────────────────────────────────────────

    fn read_frames(&mut self, id: ConnectionId) {
        let now = Instant::now();
        let Some(connection) = self.registry.get_mut(id) else {
            return;
        };
        match read_into(connection, &mut self.scratch, now) {
            ReadOutcome::Data => self.process_frames(id),
            ReadOutcome::Eof => {
                debug!("client({id}) closed the connection");
                self.drop_peer(id);
            }
            ReadOutcome::Failed(e) => {
                warn!("client({id}) read failed: {e}");
                self.drop_peer(id);
            }
        }
    }

    /// Handles every complete frame buffered for `id`.
    fn process_frames(&mut self, id: ConnectionId) {
        loop {
            let now = Instant::now();
            let max_payload = self.config.max_payload;
            let Some(connection) = self.registry.get_mut(id) else {
                return;
            };

            let header = match peek_header(connection.inbox()) {
                Ok(Some(header)) => header,
                Ok(None) => return,
                Err(e) => return self.protocol_error(id, &e),
            };
            if header.payload_len > max_payload as u64 {
                let e = FrameError::PayloadTooLarge {
                    declared: header.payload_len,
                    limit: max_payload,
                };
                return self.protocol_error(id, &e);
            }
            match header.frame_len() {
                Some(len) if len <= connection.inbox().len() => {}
                _ => return,
            }

            let (frame, used) = match decode_frame(connection.inbox()) {
                Ok(decoded) => decoded,
                Err(e) => return self.protocol_error(id, &e),
            };
            connection.consume_inbound(used, now);

            if !self.dispatch(id, frame) {
                return;
            }
        }
    }

    /// Acts on one frame.  Returns `false` once the connection is gone.
    fn dispatch(&mut self, id: ConnectionId, frame: Frame) -> bool {
        if !frame.fin || frame.opcode == Opcode::Continuation {
            warn!("client({id}) sent a fragmented message; dropping");
            self.drop_peer(id);
            return false;
        }

        if frame.opcode.is_control() && frame.payload.len() > MAX_INLINE_LEN {
            warn!(
                "client({id}) sent a {:?} frame with a {}-byte payload; dropping",
                frame.opcode,
                frame.payload.len()
            );
            self.drop_peer(id);
            return false;
        }

        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                debug!(
                    "client({id}) sent {} bytes ({:?})",
                    frame.payload.len(),
                    frame.opcode
                );
                let fanout = self.registry.relay(id, &frame);
                self.settle(fanout);
                true
            }
            Opcode::Ping => self.reply(id, &encode_frame(&frame.payload, Opcode::Pong)),
            Opcode::Pong => {
                debug!("client({id}) sent an unsolicited pong");
                true
            }
            Opcode::Close => {
                self.close_exchange(id, &frame.payload);
                false
            }
            Opcode::Continuation => false,
        }
    }

    fn reply(&mut self, id: ConnectionId, bytes: &[u8]) -> bool {
        let Some(connection) = self.registry.get_mut(id) else {
            return false;
        };
        match connection.stream_mut().write_all(bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("write to client({id}) failed: {e}");
                self.drop_peer(id);
                false
            }
        }
    }

    /// Echoes a Close frame and drops the connection.
    fn close_exchange(&mut self, id: ConnectionId, payload: &[u8]) {
        let Some(mut connection) = self.registry.remove(id) else {
            return;
        };
        advance(&mut connection, ConnectionState::Closing);
        if let Err(e) = connection
            .stream_mut()
            .write_all(&encode_frame(payload, Opcode::Close))
        {
            debug!("client({id}) close echo not delivered: {e}");
        }
        advance(&mut connection, ConnectionState::Closed);
        self.settle(Fanout {
            delivered: 0,
            evicted: vec![connection],
        });
    }

    fn protocol_error(&mut self, id: ConnectionId, error: &FrameError) {
        warn!("client({id}) protocol error: {error}");
        self.drop_peer(id);
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Removes an OPEN connection and announces its departure.
    fn drop_peer(&mut self, id: ConnectionId) {
        if let Some(mut connection) = self.registry.remove(id) {
            advance(&mut connection, ConnectionState::Closed);
            self.settle(Fanout {
                delivered: 0,
                evicted: vec![connection],
            });
        }
    }

    /// Closes every departed peer and announces each one; announcements that
    /// fail add more departures until none are left.
    fn settle(&mut self, fanout: Fanout<TcpStream>) {
        let mut departed: VecDeque<Peer> = fanout.evicted.into();
        while let Some(connection) = departed.pop_front() {
            let id = connection.id();
            let online_for = connection.joined_at().elapsed();
            let peer = connection.peer_addr();
            self.release(connection);
            match peer {
                Some(peer) => info!("client({id}) at {peer} left after {online_for:.1?}"),
                None => info!("client({id}) left after {online_for:.1?}"),
            }
            departed.extend(self.registry.notify_left(id).evicted);
        }
    }

    /// Stops watching the socket and closes it.
    fn release(&self, connection: Peer) {
        if let Err(e) = self.poller.delete(connection.stream()) {
            debug!("client({}) deregistration failed: {e}", connection.id());
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.config.receive_timeout;
        self.handshaking
            .values()
            .chain(self.registry.iter())
            .filter_map(|connection| connection.receive_deadline(timeout))
            .min()
    }

    fn expire_partials(&mut self, now: Instant) {
        let timeout = self.config.receive_timeout;
        let expired = |connection: &Peer| {
            connection
                .receive_deadline(timeout)
                .is_some_and(|deadline| deadline <= now)
        };

        let stale_handshakes: Vec<ConnectionId> = self
            .handshaking
            .values()
            .filter(|c| expired(*c))
            .map(Connection::id)
            .collect();
        for id in stale_handshakes {
            let reason = HandshakeError::TimedOut(timeout);
            self.refuse(id, &reason, &bad_request_response());
        }

        let stale_frames: Vec<ConnectionId> = self
            .registry
            .iter()
            .filter(|c| expired(*c))
            .map(Connection::id)
            .collect();
        for id in stale_frames {
            warn!("client({id}) frame incomplete after {timeout:?}");
            self.drop_peer(id);
        }
    }

    fn shutdown(&mut self) {
        let handshaking = std::mem::take(&mut self.handshaking);
        let open = self.registry.drain();
        let count = handshaking.len() + open.len();
        for connection in handshaking.into_values().chain(open) {
            self.release(connection);
        }
        if let Err(e) = self.poller.delete(&self.listener) {
            debug!("listener deregistration failed: {e}");
        }
        info!("event loop stopped, closed {count} connections");
    }
}

fn key_of(id: ConnectionId) -> usize {
    id.get() as usize
}

fn advance(connection: &mut Peer, next: ConnectionState) {
    if let Err(e) = connection.advance(next) {
        warn!("client({}): {e}", connection.id());
    }
}

/// Half-closes `stream` and discards whatever the client still sends, until
/// it closes its side or `budget` runs out.
fn linger_close(stream: &mut TcpStream, scratch: &mut [u8], budget: Duration) -> io::Result<()> {
    stream.shutdown(Shutdown::Write)?;
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(scratch) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// One read from a ready socket into the connection's buffer.
fn read_into(connection: &mut Peer, scratch: &mut [u8], now: Instant) -> ReadOutcome {
    loop {
        match connection.stream_mut().read(scratch) {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => {
                connection.buffer_inbound(&scratch[..n], now);
                return ReadOutcome::Data;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
}

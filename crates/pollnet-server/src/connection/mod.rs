//! One accepted socket and everything needed to talk over it.
//!
//! # Flavours
//!
//! | Kind        | Inbound decoding                                   | Outbound            |
//! |-------------|----------------------------------------------------|---------------------|
//! | `Tcp`       | resumable [`PacketDecoder`] over the byte stream    | `Packer::pack`      |
//! | `WebSocket` | upgrade handshake, then a resumable [`FrameDecoder`] | `encode_frame`     |
//! | `Udp`       | one datagram per read, [`decode_datagram`]          | `Packer::pack`      |
//!
//! Any flavour except `Udp` may additionally be wrapped in TLS, in which case
//! the decoders read decrypted bytes out of rustls instead of the socket.
//!
//! # Threads and locking (for beginners)
//!
//! The owning reactor shard is the only thread that reads from the socket.
//! Handler threads write to it (`send`, `text`, ...).  All mutable I/O state
//! (socket, write queue, decoders, TLS) sits behind one mutex, held only for
//! the duration of a non-blocking read pass or a single write attempt.
//!
//! A read pass is bounded by [`READ_BUDGET`] decode steps.  When the budget
//! runs out first, [`ReadOutcome::more`] is set and the shard comes back to
//! the connection after serving its other ready descriptors.
//!
//! Closing takes the same mutex before releasing the descriptor, so no
//! writer can ever touch a descriptor number the kernel has already handed
//! to a newer connection.  Callbacks (`on_close`, the WebSocket handler's
//! `close`) run after the mutex is released.
//!
//! # Interest switching
//!
//! ```text
//!   Online ──write queued──► WritePending ──queue drained──► ReadPending
//!                                  ▲                              │
//!                                  └──────── write queued ────────┘
//!   any state ──close──► Offline
//! ```
//!
//! While `WritePending`, the descriptor is registered for write interest
//! only, so a peer that does not read its replies stops being read from too.

pub(crate) mod tls;
pub(crate) mod write_queue;

use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use pollnet_core::websocket::frame::MAX_CONTROL_PAYLOAD;
use pollnet_core::websocket::handshake::bad_request_response;
use pollnet_core::websocket::{encode_close_payload, HandshakeRequest};
use pollnet_core::{
    close_code, decode_datagram, encode_frame, FrameDecoder, HandshakeBuffer, Message, OpCode,
    PacketDecoder, Packer, ProtocolError, QueryParams, WsEvent,
};
use socket2::Socket;
use tracing::{debug, trace, warn};

use crate::context::ServerContext;
use crate::error::SendError;
use crate::poller::{Poller, Token};
use tls::TlsSession;
use write_queue::{ProceedOutcome, RawReader, WriteOutcome, WriteQueue};

/// Decode steps allowed per read pass.  Each step performs at most one read
/// from the socket (or from buffered TLS plaintext).
pub(crate) const READ_BUDGET: usize = 32;

// ── Public types ──────────────────────────────────────────────────────────────

/// Which protocol a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Length-prefixed packets over TCP.
    Tcp,
    /// RFC 6455 WebSocket over TCP.
    WebSocket,
    /// Length-prefixed packets, one per datagram, over a connected UDP socket.
    Udp,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Tcp => "tcp",
            ConnectionKind::WebSocket => "websocket",
            ConnectionKind::Udp => "udp",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// I/O state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Closed; the descriptor has been released.
    Offline,
    /// Registered for reads; nothing has been queued yet.
    Online,
    /// Outbound bytes are queued; registered for write readiness.
    WritePending,
    /// The write queue drained; registered for reads again.
    ReadPending,
}

// ── Internal state ────────────────────────────────────────────────────────────

enum Protocol {
    Framed(PacketDecoder),
    WebSocket {
        /// `Some` until the upgrade request has been answered.
        handshake: Option<HandshakeBuffer>,
        decoder: FrameDecoder,
    },
    Datagram {
        buf: Vec<u8>,
    },
}

struct ConnIo {
    /// `None` once closed.
    socket: Option<Socket>,
    state: ConnState,
    queue: WriteQueue,
    tls: Option<TlsSession>,
    protocol: Protocol,
}

impl ConnIo {
    fn upgraded(&self) -> bool {
        matches!(self.protocol, Protocol::WebSocket { handshake: None, .. })
    }

    /// TLS handshake finished; decrypted bytes may be read.
    fn tls_established(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| !tls.is_handshaking())
    }
}

/// One decoded unit from [`decode_one`].
enum Decoded {
    Message(Message),
    Upgrade(HandshakeRequest),
    Ping(Vec<u8>),
    Pong,
    Close(Option<u16>),
    /// A malformed datagram; only that datagram is lost.
    Discard(ProtocolError),
}

/// Why and how a connection is being torn down.
enum Shutdown {
    /// Peer EOF or socket failure; nothing left to say.
    Transport,
    /// Decode failure; WebSocket peers get a close frame with its code.
    Violation(ProtocolError),
    /// The upgrade request was unacceptable; answer `400` and close.
    Rejected(ProtocolError),
    /// The peer sent CLOSE; echo its code and close.
    PeerClose(Option<u16>),
    /// Closed by this side (application, sweep, stop).
    Local { code: u16, reason: String },
}

/// What a read pass produced, handed back to the shard once the I/O lock
/// is released.
#[derive(Debug, Default)]
pub(crate) struct ReadOutcome {
    /// At most [`READ_BUDGET`] messages, in arrival order.
    pub(crate) messages: Vec<Message>,
    /// Set when the WebSocket upgrade completed during this pass.
    pub(crate) opened: Option<QueryParams>,
    /// The budget ran out before the source reported `WouldBlock`.  Input
    /// may be buffered where the poller cannot see it (TLS plaintext, bytes
    /// read along with the upgrade request).
    pub(crate) more: bool,
}

// ── Connection ────────────────────────────────────────────────────────────────

/// A live client connection.
///
/// Handlers receive it as `Arc<Connection>`; it is safe to keep a clone and
/// write to it later from any thread.  Every write method fails with
/// [`SendError::Closed`] once the connection is gone.
pub struct Connection {
    id: u64,
    fd: RawFd,
    peer: SocketAddr,
    kind: ConnectionKind,
    tls: bool,
    poller: Arc<Poller>,
    ctx: Weak<ServerContext>,
    packer: Arc<dyn Packer>,
    closed: AtomicBool,
    /// Whether the open callback ran, so close callbacks pair with it.
    opened: AtomicBool,
    created: Instant,
    /// Milliseconds after `created` of the last inbound traffic.
    last_active_ms: AtomicU64,
    query: OnceLock<QueryParams>,
    io: Mutex<ConnIo>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("kind", &self.kind)
            .field("tls", &self.tls)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wraps an accepted (or per-peer UDP) socket.  The caller adds it to the
    /// registry and then calls [`register`](Connection::register).
    ///
    /// TLS is enabled for stream connections when the server has a TLS
    /// config.
    pub(crate) fn new(
        id: u64,
        socket: Socket,
        peer: SocketAddr,
        kind: ConnectionKind,
        poller: Arc<Poller>,
        ctx: &Arc<ServerContext>,
    ) -> Result<Arc<Self>, rustls::Error> {
        let tls = match (&ctx.tls, kind) {
            (Some(config), ConnectionKind::Tcp | ConnectionKind::WebSocket) => {
                Some(TlsSession::new(Arc::clone(config))?)
            }
            _ => None,
        };

        let protocol = match kind {
            ConnectionKind::Tcp => Protocol::Framed(PacketDecoder::new()),
            ConnectionKind::WebSocket => Protocol::WebSocket {
                handshake: Some(HandshakeBuffer::new(ctx.config.websocket_handshake_limit)),
                decoder: FrameDecoder::new()
                    .with_max_message_len(ctx.config.max_body_length().map(u64::from)),
            },
            ConnectionKind::Udp => Protocol::Datagram {
                buf: vec![0; ctx.config.udp_packet_buffer_length],
            },
        };

        Ok(Arc::new(Self {
            id,
            fd: socket.as_raw_fd(),
            peer,
            kind,
            tls: tls.is_some(),
            poller,
            ctx: Arc::downgrade(ctx),
            packer: Arc::clone(&ctx.packer),
            closed: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            query: OnceLock::new(),
            io: Mutex::new(ConnIo {
                socket: Some(socket),
                state: ConnState::Online,
                queue: WriteQueue::new(),
                tls,
                protocol,
            }),
        }))
    }

    /// Locally assigned, unique for the lifetime of the server.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnState {
        self.lock_io().state
    }

    /// Query parameters of the WebSocket upgrade request; empty before the
    /// handshake and for other kinds.
    pub fn query(&self) -> &QueryParams {
        static EMPTY: OnceLock<QueryParams> = OnceLock::new();
        self.query
            .get()
            .unwrap_or_else(|| EMPTY.get_or_init(QueryParams::default))
    }

    /// Index of the reactor shard that owns this connection.
    pub(crate) fn shard(&self) -> usize {
        self.poller.index()
    }

    pub(crate) fn token(&self) -> Token {
        Token::new(self.fd, self.id)
    }

    /// Time since the last inbound bytes (or since creation).
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        let last = self.created + Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_active_ms.store(elapsed, Ordering::Relaxed);
    }

    fn lock_io(&self) -> MutexGuard<'_, ConnIo> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes the descriptor for reads with the owning shard.  Fails on
    /// a closed connection, whose descriptor number may already be reused.
    pub(crate) fn register(&self) -> io::Result<()> {
        let io = self.lock_io();
        if io.socket.is_none() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.poller.add_read(self.fd, self.token())
    }

    /// Marks the open callback as delivered.
    pub(crate) fn mark_opened(&self) {
        self.opened.store(true, Ordering::Release);
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Sends one framed packet (`Tcp` and `Udp` connections).
    ///
    /// # Errors
    ///
    /// [`SendError::Unsupported`] on a WebSocket connection,
    /// [`SendError::Closed`] if the connection is gone, or the socket error
    /// that made this write close it.
    pub fn send(self: &Arc<Self>, id: u32, payload: &[u8]) -> Result<(), SendError> {
        if self.kind == ConnectionKind::WebSocket {
            return Err(SendError::Unsupported(self.kind.as_str()));
        }
        let frame = self.packer.pack(id, payload)?;
        self.deliver(frame, false)
    }

    /// Sends a TEXT message.
    pub fn text(self: &Arc<Self>, text: &str) -> Result<(), SendError> {
        self.websocket_frame(OpCode::Text, text.as_bytes())
    }

    /// Sends a BINARY message.
    pub fn binary(self: &Arc<Self>, payload: &[u8]) -> Result<(), SendError> {
        self.websocket_frame(OpCode::Binary, payload)
    }

    /// Sends a PING; the peer's PONG is discarded on arrival.
    pub fn ping(self: &Arc<Self>, payload: &[u8]) -> Result<(), SendError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooLarge(payload.len() as u64).into());
        }
        self.websocket_frame(OpCode::Ping, payload)
    }

    fn websocket_frame(self: &Arc<Self>, opcode: OpCode, payload: &[u8]) -> Result<(), SendError> {
        if self.kind != ConnectionKind::WebSocket {
            return Err(SendError::Unsupported(self.kind.as_str()));
        }
        self.deliver(encode_frame(true, opcode, payload), true)
    }

    fn deliver(self: &Arc<Self>, frame: Vec<u8>, needs_upgrade: bool) -> Result<(), SendError> {
        let mut closed_now = false;
        let result = {
            let mut io = self.lock_io();
            if io.socket.is_none() {
                return Err(SendError::Closed(self.id));
            }
            if needs_upgrade && !io.upgraded() {
                return Err(SendError::Unsupported("websocket before handshake"));
            }
            let result = self.write_locked(&mut io, frame);
            if let Err(e) = &result {
                debug!(conn_id = self.id, "write failed, closing: {e}");
                closed_now = self.teardown_locked(&mut io);
            }
            result
        };
        if closed_now {
            self.after_close();
        }
        result
    }

    /// Seals (under TLS) and writes; any error means the connection is
    /// unusable.
    fn write_locked(&self, io: &mut ConnIo, frame: Vec<u8>) -> Result<(), SendError> {
        let bytes = match io.tls.as_mut() {
            Some(tls) => tls.seal(&frame)?,
            None => frame,
        };
        self.write_raw_locked(io, bytes)
    }

    fn write_raw_locked(&self, io: &mut ConnIo, bytes: Vec<u8>) -> Result<(), SendError> {
        let ConnIo {
            socket,
            state,
            queue,
            ..
        } = io;
        let sock = socket.as_ref().ok_or(SendError::Closed(self.id))?;
        if queue.write(sock, bytes)? == WriteOutcome::Queued && *state != ConnState::WritePending {
            trace!(conn_id = self.id, pending = queue.pending_bytes(), "socket full, waiting for write readiness");
            *state = ConnState::WritePending;
            self.poller.mod_write(self.fd, self.token())?;
        }
        Ok(())
    }

    fn flush_tls_locked(&self, io: &mut ConnIo) -> Result<(), SendError> {
        let pending = match io.tls.as_mut() {
            Some(tls) => tls.take_ciphertext()?,
            None => return Ok(()),
        };
        self.write_raw_locked(io, pending)
    }

    // ── Closing ───────────────────────────────────────────────────────────────

    /// Closes the connection.  WebSocket peers receive a normal-closure
    /// frame first.  Closing twice is a no-op.
    pub fn close(self: &Arc<Self>) {
        self.close_with(close_code::NORMAL, "");
    }

    /// Closes the connection, sending `code` and `reason` in a CLOSE frame
    /// to WebSocket peers.
    pub fn close_with(self: &Arc<Self>, code: u16, reason: &str) {
        self.shutdown(Shutdown::Local {
            code,
            reason: reason.to_owned(),
        });
    }

    fn shutdown(self: &Arc<Self>, how: Shutdown) {
        let closed_now = {
            let mut io = self.lock_io();
            self.shutdown_locked(&mut io, how)
        };
        if closed_now {
            self.after_close();
        }
    }

    /// Sends whatever farewell `how` calls for, then releases the socket.
    /// Returns true if this call performed the close.
    fn shutdown_locked(&self, io: &mut ConnIo, how: Shutdown) -> bool {
        if io.socket.is_none() {
            return false;
        }

        let farewell = match how {
            Shutdown::Transport => None,
            Shutdown::Violation(err) => {
                warn!(conn_id = self.id, peer = %self.peer, "protocol violation: {err}");
                match err.close_code() {
                    Some(code) if io.upgraded() => Some(close_frame(code, &err.to_string())),
                    _ => None,
                }
            }
            Shutdown::Rejected(err) => {
                warn!(conn_id = self.id, peer = %self.peer, "websocket upgrade rejected: {err}");
                Some(bad_request_response())
            }
            Shutdown::PeerClose(code) => {
                debug!(conn_id = self.id, ?code, "peer sent close");
                // A CLOSE without a status code is answered with an empty one.
                Some(match code {
                    Some(code) => close_frame(code, ""),
                    None => encode_frame(true, OpCode::Close, &[]),
                })
            }
            Shutdown::Local { code, reason } => io.upgraded().then(|| close_frame(code, &reason)),
        };

        // Best effort: a backlog that the socket cannot take now is dropped.
        if let Some(bytes) = farewell {
            let _ = self.write_locked(io, bytes);
        }
        if let Some(tls) = io.tls.as_mut() {
            if let Ok(alert) = tls.close_notify() {
                let _ = self.write_raw_locked(io, alert);
            }
        }
        self.teardown_locked(io)
    }

    /// Deregisters and closes the descriptor.  Returns true on the first call.
    fn teardown_locked(&self, io: &mut ConnIo) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(socket) = io.socket.take() {
            if let Err(e) = self.poller.remove(self.fd) {
                debug!(conn_id = self.id, fd = self.fd, "poller remove failed: {e}");
            }
            drop(socket);
        }
        io.queue.clear();
        io.state = ConnState::Offline;
        true
    }

    /// Registry removal and close callbacks; runs without the I/O lock.
    fn after_close(self: &Arc<Self>) {
        debug!(conn_id = self.id, peer = %self.peer, kind = %self.kind, "connection closed");
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        ctx.registry.remove(self.fd, self.id);

        if !self.opened.load(Ordering::Acquire) {
            return;
        }
        match self.kind {
            ConnectionKind::WebSocket => {
                if let Some(handler) = &ctx.ws_handler {
                    handler.close(self);
                }
            }
            ConnectionKind::Tcp | ConnectionKind::Udp => ctx.hooks.on_close(self),
        }
    }

    // ── Readiness ─────────────────────────────────────────────────────────────

    /// Continues a pending write backlog.  Returns true when the backlog
    /// drained and read interest is back, so the caller should read.
    pub(crate) fn on_writable(self: &Arc<Self>) -> bool {
        let mut resumed = false;
        let closed_now = {
            let mut io = self.lock_io();
            let result = {
                let ConnIo { socket, queue, .. } = &mut *io;
                match socket.as_ref() {
                    Some(sock) => queue.proceed(sock),
                    None => return false,
                }
            };
            match result {
                Ok(ProceedOutcome::Pending) => false,
                Ok(ProceedOutcome::Drained) => {
                    io.state = ConnState::ReadPending;
                    match self.poller.mod_read(self.fd, self.token()) {
                        Ok(()) => {
                            resumed = true;
                            false
                        }
                        Err(e) => {
                            debug!(conn_id = self.id, "restoring read interest failed: {e}");
                            self.teardown_locked(&mut io)
                        }
                    }
                }
                Err(e) => {
                    debug!(conn_id = self.id, "write failed, closing: {e}");
                    self.teardown_locked(&mut io)
                }
            }
        };
        if closed_now {
            self.after_close();
        }
        resumed
    }

    /// Reads and decodes until the source would block or [`READ_BUDGET`]
    /// steps have run.
    ///
    /// Returns the completed messages in arrival order.  On EOF or a
    /// protocol violation the connection is closed before returning, but
    /// messages decoded earlier in the same pass are still returned.
    pub(crate) fn on_readable(self: &Arc<Self>) -> ReadOutcome {
        let mut out = ReadOutcome::default();
        let mut budget = READ_BUDGET;
        let closed_now = {
            let mut io = self.lock_io();
            if io.socket.is_none() {
                return out;
            }
            self.touch();
            let result = if io.tls.is_some() {
                self.read_tls_locked(&mut io, &mut out, &mut budget)
            } else {
                self.drain_locked(&mut io, &mut out, &mut budget)
            };
            match result {
                Ok(()) => false,
                Err(how) => self.shutdown_locked(&mut io, how),
            }
        };
        if closed_now {
            self.after_close();
        }
        out
    }

    /// Alternates between decoding buffered plaintext and feeding rustls one
    /// socket read of ciphertext, until the socket would block or the budget
    /// is spent.
    fn read_tls_locked(&self, io: &mut ConnIo, out: &mut ReadOutcome, budget: &mut usize) -> Result<(), Shutdown> {
        loop {
            // Leftover plaintext goes first: rustls refuses new ciphertext
            // while its plaintext buffer is full.
            if io.tls_established() {
                self.drain_locked(io, out, budget)?;
                if out.more {
                    return Ok(());
                }
            }
            if *budget == 0 {
                out.more = true;
                return Ok(());
            }
            *budget -= 1;

            let (read, processed) = {
                let ConnIo { socket, tls, .. } = &mut *io;
                let (Some(sock), Some(tls)) = (socket.as_ref(), tls.as_mut()) else {
                    return Err(Shutdown::Transport);
                };
                let read = tls.read_tls(sock);
                (read, tls.process())
            };

            // Handshake records and alerts go out even when processing failed.
            let flushed = self.flush_tls_locked(io);
            if let Err(e) = processed {
                warn!(conn_id = self.id, peer = %self.peer, "tls error: {e}");
                return Err(Shutdown::Transport);
            }
            flushed.map_err(|_| Shutdown::Transport)?;

            match read {
                Ok(0) => {
                    // Plaintext that arrived with the peer's last records.
                    if io.tls_established() {
                        self.drain_locked(io, out, budget)?;
                        if out.more {
                            return Ok(());
                        }
                    }
                    return Err(Shutdown::Transport);
                }
                Ok(_) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                    if io.tls_established() {
                        self.drain_locked(io, out, budget)?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    debug!(conn_id = self.id, "tls read failed: {e}");
                    return Err(Shutdown::Transport);
                }
            }
        }
    }

    /// Decodes until the source reports `WouldBlock` or the budget is spent.
    fn drain_locked(&self, io: &mut ConnIo, out: &mut ReadOutcome, budget: &mut usize) -> Result<(), Shutdown> {
        loop {
            if *budget == 0 {
                out.more = true;
                return Ok(());
            }
            *budget -= 1;

            let decoded = {
                let ConnIo {
                    socket,
                    tls,
                    protocol,
                    ..
                } = &mut *io;
                let sock = socket.as_ref().ok_or(Shutdown::Transport)?;
                match tls.as_mut() {
                    Some(tls) => decode_one(protocol, &*self.packer, &mut tls.plaintext()),
                    None => decode_one(protocol, &*self.packer, &mut RawReader(sock)),
                }
            };

            match decoded {
                Ok(None) => {}
                Ok(Some(Decoded::Message(message))) => out.messages.push(message),
                Ok(Some(Decoded::Upgrade(request))) => {
                    debug!(conn_id = self.id, path = %request.path, "websocket upgrade accepted");
                    self.write_locked(io, request.response())
                        .map_err(|_| Shutdown::Transport)?;
                    let _ = self.query.set(request.query.clone());
                    out.opened = Some(request.query);
                }
                Ok(Some(Decoded::Ping(payload))) => {
                    self.write_locked(io, encode_frame(true, OpCode::Pong, &payload))
                        .map_err(|_| Shutdown::Transport)?;
                }
                Ok(Some(Decoded::Pong)) => {}
                Ok(Some(Decoded::Close(code))) => return Err(Shutdown::PeerClose(code)),
                Ok(Some(Decoded::Discard(err))) => {
                    warn!(conn_id = self.id, peer = %self.peer, "dropping malformed datagram: {err}");
                }
                Err(e) if e.is_would_block() => return Ok(()),
                Err(e) if e.is_transport() => {
                    if let ProtocolError::Io(err) = &e {
                        debug!(conn_id = self.id, "read failed: {err}");
                    }
                    return Err(Shutdown::Transport);
                }
                Err(e) if !io.upgraded() && self.kind == ConnectionKind::WebSocket => {
                    return Err(Shutdown::Rejected(e));
                }
                Err(e) => return Err(Shutdown::Violation(e)),
            }
        }
    }
}

fn close_frame(code: u16, reason: &str) -> Vec<u8> {
    encode_frame(true, OpCode::Close, &encode_close_payload(code, reason))
}

/// Advances the protocol decoder by at most one read from `src`.
fn decode_one<R: Read + ?Sized>(
    protocol: &mut Protocol,
    packer: &dyn Packer,
    src: &mut R,
) -> Result<Option<Decoded>, ProtocolError> {
    match protocol {
        Protocol::Framed(decoder) => Ok(decoder.decode(packer, src)?.map(Decoded::Message)),
        Protocol::WebSocket { handshake, decoder } => {
            if let Some(buffer) = handshake.as_mut() {
                let Some((request, rest)) = buffer.read_from(src)? else {
                    return Ok(None);
                };
                *handshake = None;
                decoder.push_prefix(rest);
                return Ok(Some(Decoded::Upgrade(request)));
            }
            Ok(decoder.decode(src)?.map(|event| match event {
                WsEvent::Message(message) => Decoded::Message(message),
                WsEvent::Ping(payload) => Decoded::Ping(payload),
                WsEvent::Pong(_) => Decoded::Pong,
                WsEvent::Close { code, .. } => Decoded::Close(code),
            }))
        }
        Protocol::Datagram { buf } => {
            let n = src.read(buf)?;
            Ok(Some(match decode_datagram(packer, &buf[..n]) {
                Ok(message) => Decoded::Message(message),
                Err(err) => Decoded::Discard(err),
            }))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use pollnet_core::{DataPacker, FrameDecoder as ClientDecoder};

    use super::*;
    use crate::config::ServerConfig;
    use crate::context::test_support::{connection, context, context_with, CloseCounter};

    fn setup(kind: ConnectionKind) -> (Arc<ServerContext>, Arc<CloseCounter>, Arc<Connection>, UnixStream) {
        let counter = Arc::new(CloseCounter::default());
        let ctx = context(counter.clone());
        let poller = Arc::new(Poller::new(0).unwrap());
        let (conn, peer) = connection(&ctx, &poller, 1, kind);
        conn.mark_opened();
        (ctx, counter, conn, peer)
    }

    /// Client side of a WebSocket frame: masked with a fixed key.
    fn masked(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        let key = [0x11, 0x22, 0x33, 0x44];
        let mut out = vec![if fin { 0x80 } else { 0 } | opcode];
        assert!(payload.len() < 126);
        out.push(0x80 | payload.len() as u8);
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    fn upgrade(conn: &Arc<Connection>, peer: &mut UnixStream) -> ReadOutcome {
        peer.write_all(
            b"GET /chat?token=abc HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
        let out = conn.on_readable();
        let mut response = vec![0u8; 256];
        let n = peer.read(&mut response).unwrap();
        assert!(response[..n].starts_with(b"HTTP/1.1 101"));
        out
    }

    #[test]
    fn test_framed_packets_decode_in_arrival_order() {
        // Arrange
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::Tcp);
        let packer = DataPacker::new();
        let mut wire = packer.pack(1, b"first").unwrap();
        wire.extend(packer.pack(2, b"second").unwrap());

        // Act
        peer.write_all(&wire).unwrap();
        let out = conn.on_readable();

        // Assert
        let ids: Vec<u32> = out.messages.iter().map(Message::id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(out.messages[1].payload(), b"second");
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_read_pass_stops_at_budget_and_resumes_in_order() {
        // Arrange: four passes' worth of packets already in the socket
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::Tcp);
        let packer = DataPacker::new();
        let count = READ_BUDGET as u32 * 4;
        let wire: Vec<u8> = (0..count).flat_map(|id| packer.pack(id, b"burst").unwrap()).collect();
        peer.write_all(&wire).unwrap();

        // Act
        let first = conn.on_readable();
        let mut ids: Vec<u32> = first.messages.iter().map(Message::id).collect();
        let mut passes = 1;
        loop {
            let out = conn.on_readable();
            ids.extend(out.messages.iter().map(Message::id));
            passes += 1;
            if !out.more || passes > 100 {
                break;
            }
        }

        // Assert
        assert!(first.more);
        assert_eq!(first.messages.len(), READ_BUDGET);
        assert_eq!(ids, (0..count).collect::<Vec<_>>());
        assert!(passes >= 4);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_flooding_peer_does_not_hold_the_connection() {
        // Arrange: a peer that keeps writing small packets until told to stop
        let (_ctx, _counter, conn, peer) = setup(ConnectionKind::Tcp);
        let stop = Arc::new(AtomicBool::new(false));
        let flooding = Arc::clone(&stop);
        let flooder = std::thread::spawn(move || {
            let mut peer = peer;
            peer.set_nonblocking(true).unwrap();
            let frame = DataPacker::new().pack(1, b"flood").unwrap();
            let mut written = 0;
            while !flooding.load(Ordering::SeqCst) {
                match peer.write(&frame[written..]) {
                    Ok(n) => written = (written + n) % frame.len(),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                    Err(e) => panic!("flood write failed: {e}"),
                }
            }
            peer
        });
        std::thread::sleep(Duration::from_millis(50));

        // Act: one pass while the peer is still writing, then a reply
        let started = Instant::now();
        let out = conn.on_readable();
        let elapsed = started.elapsed();
        let replied = conn.send(2, b"reply");
        stop.store(true, Ordering::SeqCst);
        let _peer = flooder.join().unwrap();

        // Assert
        assert!(out.more);
        assert!(out.messages.len() <= READ_BUDGET);
        assert!(elapsed < Duration::from_secs(1), "read pass took {elapsed:?}");
        assert!(replied.is_ok());
    }

    #[test]
    fn test_partial_packet_waits_for_rest() {
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::Tcp);
        let frame = DataPacker::new().pack(9, b"split payload").unwrap();

        peer.write_all(&frame[..5]).unwrap();
        let first = conn.on_readable();
        peer.write_all(&frame[5..]).unwrap();
        let second = conn.on_readable();

        assert!(first.messages.is_empty());
        assert_eq!(second.messages.len(), 1);
        assert_eq!(second.messages[0].payload(), b"split payload");
    }

    #[test]
    fn test_send_writes_packed_frame() {
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::Tcp);

        conn.send(4, b"pong").unwrap();

        let mut buf = [0u8; 12];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..4], &4u32.to_le_bytes());
        assert_eq!(&buf[4..8], &4u32.to_le_bytes());
        assert_eq!(&buf[8..], b"pong");
    }

    #[test]
    fn test_peer_eof_closes_and_fires_on_close_once() {
        // Arrange
        let (ctx, counter, conn, peer) = setup(ConnectionKind::Tcp);

        // Act
        drop(peer);
        conn.on_readable();
        conn.close();

        // Assert
        assert!(conn.is_closed());
        assert_eq!(conn.state(), ConnState::Offline);
        assert_eq!(counter.count(), 1);
        assert_eq!(ctx.registry.len(), 0);
        assert!(matches!(conn.send(1, b"x"), Err(SendError::Closed(1))));
    }

    #[test]
    fn test_oversized_header_closes_connection() {
        // Arrange: limit 16, header declares 1 MiB
        let counter = Arc::new(CloseCounter::default());
        let config = ServerConfig {
            max_body_length: 16,
            ..ServerConfig::default()
        };
        let ctx = context_with(counter.clone(), config);
        let poller = Arc::new(Poller::new(0).unwrap());
        let (conn, mut peer) = connection(&ctx, &poller, 1, ConnectionKind::Tcp);
        conn.mark_opened();
        let mut header = Vec::new();
        header.extend_from_slice(&(1u32 << 20).to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());

        // Act
        peer.write_all(&header).unwrap();
        let out = conn.on_readable();

        // Assert
        assert!(out.messages.is_empty());
        assert!(conn.is_closed());
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_blocked_write_switches_to_write_pending_then_back() {
        // Arrange: fill the peer's receive buffer
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::Tcp);
        let chunk = vec![0xAB; 64 * 1024];
        while conn.state() != ConnState::WritePending {
            conn.send(1, &chunk).unwrap();
        }

        // Act: the peer reads everything; write readiness drains the queue
        peer.set_nonblocking(true).unwrap();
        let mut sink = vec![0u8; 256 * 1024];
        for _ in 0..10_000 {
            while peer.read(&mut sink).is_ok() {}
            conn.on_writable();
            if conn.state() == ConnState::ReadPending {
                break;
            }
        }

        // Assert
        assert_eq!(conn.state(), ConnState::ReadPending);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_websocket_upgrade_then_message_and_query() {
        // Arrange
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::WebSocket);

        // Act
        let opened = upgrade(&conn, &mut peer);
        peer.write_all(&masked(0x1, false, b"hel")).unwrap();
        peer.write_all(&masked(0x0, true, b"lo")).unwrap();
        let out = conn.on_readable();

        // Assert
        assert_eq!(opened.opened.unwrap().get("token"), Some("abc"));
        assert_eq!(conn.query().get("token"), Some("abc"));
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].text(), Some("hello"));
    }

    #[test]
    fn test_websocket_ping_is_answered_with_pong() {
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::WebSocket);
        upgrade(&conn, &mut peer);

        peer.write_all(&masked(0x9, true, b"beat")).unwrap();
        let out = conn.on_readable();

        assert!(out.messages.is_empty());
        let mut frame = [0u8; 6];
        peer.read_exact(&mut frame).unwrap();
        assert_eq!(frame, [0x8A, 4, b'b', b'e', b'a', b't']);
    }

    #[test]
    fn test_websocket_close_is_echoed_then_closed() {
        // Arrange
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::WebSocket);
        upgrade(&conn, &mut peer);

        // Act
        peer.write_all(&masked(0x8, true, &1000u16.to_be_bytes())).unwrap();
        conn.on_readable();

        // Assert
        assert!(conn.is_closed());
        let mut echoed = Vec::new();
        peer.read_to_end(&mut echoed).unwrap();
        let mut client = ClientDecoder::new().with_require_mask(false);
        let event = client.decode(&mut echoed.as_slice()).unwrap();
        assert_eq!(
            event,
            Some(WsEvent::Close {
                code: Some(1000),
                reason: String::new()
            })
        );
    }

    #[test]
    fn test_websocket_close_without_code_is_answered_empty() {
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::WebSocket);
        upgrade(&conn, &mut peer);

        peer.write_all(&masked(0x8, true, &[])).unwrap();
        conn.on_readable();

        assert!(conn.is_closed());
        let mut echoed = Vec::new();
        peer.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, vec![0x88, 0]);
    }

    #[test]
    fn test_websocket_invalid_utf8_closes_with_1007() {
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::WebSocket);
        upgrade(&conn, &mut peer);

        peer.write_all(&masked(0x1, true, &[0xC3, 0x28])).unwrap();
        conn.on_readable();

        assert!(conn.is_closed());
        let mut sent = Vec::new();
        peer.read_to_end(&mut sent).unwrap();
        let mut client = ClientDecoder::new().with_require_mask(false);
        match client.decode(&mut sent.as_slice()).unwrap() {
            Some(WsEvent::Close { code, .. }) => assert_eq!(code, Some(1007)),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_upgrade_request_gets_400() {
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::WebSocket);

        peer.write_all(b"POST / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        conn.on_readable();

        assert!(conn.is_closed());
        let mut response = Vec::new();
        peer.read_to_end(&mut response).unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"));
    }

    #[test]
    fn test_text_before_handshake_is_unsupported() {
        let (_ctx, _counter, conn, _peer) = setup(ConnectionKind::WebSocket);

        let err = conn.text("early").unwrap_err();

        assert!(matches!(err, SendError::Unsupported(_)));
    }

    #[test]
    fn test_send_on_websocket_and_text_on_tcp_are_unsupported() {
        let (_ctx, _c1, ws, _p1) = setup(ConnectionKind::WebSocket);
        let (_ctx2, _c2, tcp, _p2) = setup(ConnectionKind::Tcp);

        assert!(matches!(ws.send(1, b"x"), Err(SendError::Unsupported(_))));
        assert!(matches!(tcp.text("x"), Err(SendError::Unsupported(_))));
    }

    #[test]
    fn test_close_with_sends_code_and_reason() {
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::WebSocket);
        upgrade(&conn, &mut peer);

        conn.close_with(4000, "bye");

        let mut sent = Vec::new();
        peer.read_to_end(&mut sent).unwrap();
        let mut client = ClientDecoder::new().with_require_mask(false);
        assert_eq!(
            client.decode(&mut sent.as_slice()).unwrap(),
            Some(WsEvent::Close {
                code: Some(4000),
                reason: "bye".into()
            })
        );
    }

    #[test]
    fn test_idle_for_resets_on_read() {
        let (_ctx, _counter, conn, mut peer) = setup(ConnectionKind::Tcp);
        let later = Instant::now() + Duration::from_secs(30);
        assert!(conn.idle_for(later) >= Duration::from_secs(29));

        std::thread::sleep(Duration::from_millis(20));
        peer.write_all(&DataPacker::new().pack(1, b"x").unwrap()).unwrap();
        conn.on_readable();

        assert!(conn.idle_for(Instant::now()) < Duration::from_millis(20));
    }
}

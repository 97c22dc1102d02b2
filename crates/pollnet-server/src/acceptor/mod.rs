//! Listening sockets and the thread that turns them into connections.
//!
//! The acceptor owns a dedicated poller holding exactly one registration:
//! the listening descriptor.  Shutdown sets a flag and wakes that poller;
//! the listening socket is never closed underneath a pending `accept`.
//!
//! - [`tcp`] accepts stream connections (framed or WebSocket).
//! - [`udp`] demultiplexes first datagrams into per-peer connected sockets.

mod tcp;
mod udp;

use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use socket2::Socket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionKind;
use crate::context::ServerContext;
use crate::dispatcher::Dispatch;
use crate::error::ServerError;
use crate::event_loop::EventLoop;
use crate::poller::{Poller, Token};

/// A bound listening socket, not yet being served.
pub(crate) enum Listener {
    Tcp { socket: Socket, kind: ConnectionKind },
    Udp(UdpSocket),
}

impl Listener {
    /// Binds a stream listener for `kind` (framed or WebSocket).
    pub(crate) fn tcp(addr: SocketAddr, kind: ConnectionKind, backlog: i32) -> Result<Self, ServerError> {
        let socket = crate::socket::tcp_listener(addr, backlog).map_err(|source| ServerError::BindFailed { addr, source })?;
        Ok(Listener::Tcp { socket, kind })
    }

    pub(crate) fn udp(addr: SocketAddr) -> Result<Self, ServerError> {
        let socket = crate::socket::udp_listener(addr).map_err(|source| ServerError::BindFailed { addr, source })?;
        Ok(Listener::Udp(socket))
    }

    pub(crate) fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Listener::Tcp { socket, .. } => crate::socket::local_addr(socket),
            Listener::Udp(socket) => socket.local_addr(),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp { socket, .. } => socket.as_raw_fd(),
            Listener::Udp(socket) => socket.as_raw_fd(),
        }
    }
}

/// Everything an accept pass needs to create and hand off connections.
pub(crate) struct AcceptContext {
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) shards: Arc<EventLoop>,
    pub(crate) tx: mpsc::Sender<Dispatch>,
}

pub(crate) struct Acceptor {
    poller: Arc<Poller>,
    running: Arc<AtomicBool>,
    listener: Mutex<Option<Listener>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    pub(crate) fn new(listener: Listener) -> Result<Self, ServerError> {
        Ok(Self {
            poller: Arc::new(Poller::new(usize::MAX).map_err(ServerError::Poller)?),
            running: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(Some(listener)),
            thread: Mutex::new(None),
        })
    }

    /// Registers the listener and starts the accept thread.
    ///
    /// # Errors
    ///
    /// [`ServerError::Poller`] if the listener cannot be registered,
    /// [`ServerError::Spawn`] if the thread cannot be started, and
    /// [`ServerError::AlreadyStopped`] if the listener was consumed by an
    /// earlier run.
    pub(crate) fn start(&self, accept: AcceptContext) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::AlreadyStopped)?;
        let fd = listener.raw_fd();
        self.poller
            .add_read(fd, Token::new(fd, 0))
            .map_err(ServerError::Poller)?;

        self.running.store(true, Ordering::Release);
        let poller = Arc::clone(&self.poller);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name("pollnet-acceptor".into())
            .spawn(move || run(listener, &poller, &running, &accept))
            .map_err(|source| ServerError::Spawn {
                what: "acceptor",
                source,
            })?;
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stops accepting; the listening socket is closed when the thread exits.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.poller.wake() {
            warn!("failed to wake acceptor: {e}");
        }
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("acceptor thread panicked");
            }
        }
    }
}

fn run(listener: Listener, poller: &Poller, running: &AtomicBool, accept: &AcceptContext) {
    let addr = listener.local_addr().ok();
    info!(?addr, "acceptor listening");

    let mut events = Vec::new();
    let mut peers: Option<udp::PeerTable> = None;
    while running.load(Ordering::Acquire) {
        if let Err(e) = poller.wait(&mut events) {
            error!("acceptor wait failed: {e}");
            break;
        }
        if events.is_empty() {
            continue;
        }
        match &listener {
            Listener::Tcp { socket, kind } => tcp::accept_ready(socket, *kind, accept),
            Listener::Udp(socket) => peers
                .get_or_insert_with(|| udp::PeerTable::new(accept.ctx.config.udp_packet_buffer_length))
                .receive_ready(socket, accept),
        }
    }

    let _ = poller.remove(listener.raw_fd());
    debug!(?addr, "acceptor stopped");
}

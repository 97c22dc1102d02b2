//! The public server facade.
//!
//! [`ServerBuilder`] collects the configuration, the routes and the optional
//! collaborators, then binds one listener and returns a [`Server`].  Binding
//! happens eagerly so address errors surface before anything is spawned and
//! so `127.0.0.1:0` callers can read the chosen port from
//! [`Server::local_addr`] before starting.
//!
//! # Lifecycle
//!
//! ```text
//!   bind_*()          start()             stop() / drop
//!  ─────────► Stopped ───────► Started ───────────────► Stopping ──► Stopped
//!                                                                   (final)
//! ```
//!
//! `start()` on a started server is a no-op and `stop()` is idempotent.  A
//! stopped server cannot be started again: its listener is gone.
//!
//! `stop()` blocks until the acceptor and every shard thread have exited,
//! so it must not be called from a connection hook (hooks run on those
//! threads).  Handlers run on the dispatch pool and may call it: the
//! dispatch queue is closed first, so a shard blocked on a full queue is
//! released even while the calling handler holds a worker slot.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use pollnet_core::{DataPacker, Packer};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::acceptor::{AcceptContext, Acceptor, Listener};
use crate::config::ServerConfig;
use crate::connection::ConnectionKind;
use crate::context::ServerContext;
use crate::dispatcher::{spawn_dispatcher, spawn_heartbeat, Dispatch};
use crate::error::ServerError;
use crate::event_loop::EventLoop;
use crate::hooks::{ConnectionHooks, NoopHooks, WebSocketHandler};
use crate::request::Request;
use crate::router::{MiddlewareGroup, Next, RouteSet, RouteTable, Router};

// ── Builder ───────────────────────────────────────────────────────────────────

/// Assembles a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    packer: Option<Arc<dyn Packer>>,
    hooks: Arc<dyn ConnectionHooks>,
    ws_handler: Option<Arc<dyn WebSocketHandler>>,
    tls: Option<Arc<rustls::ServerConfig>>,
    routes: RouteSet,
    groups: Vec<RouteSet>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: config.validate(),
            packer: None,
            hooks: Arc::new(NoopHooks),
            ws_handler: None,
            tls: None,
            routes: RouteSet::default(),
            groups: Vec::new(),
        }
    }

    /// Replaces the default [`DataPacker`] header layout.
    pub fn packer(mut self, packer: impl Packer + 'static) -> Self {
        self.packer = Some(Arc::new(packer));
        self
    }

    pub fn hooks(mut self, hooks: impl ConnectionHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Required for [`bind_websocket`](Self::bind_websocket).
    pub fn websocket_handler(mut self, handler: impl WebSocketHandler + 'static) -> Self {
        self.ws_handler = Some(Arc::new(handler));
        self
    }

    /// Serves stream connections (framed or WebSocket) over TLS.
    pub fn tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Adds a middleware that runs for every routed message.
    pub fn use_middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(&mut Request, Next<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.routes.use_middleware(middleware);
        self
    }

    pub fn add_router<R: Router + 'static>(mut self, id: u32, router: R) -> Self {
        self.routes.add_router(id, Arc::new(router));
        self
    }

    /// Routes message id `id` to a closure.
    pub fn route<F>(mut self, id: u32, handler: F) -> Self
    where
        F: Fn(&Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.routes.add_route(id, handler);
        self
    }

    pub fn group(mut self, group: MiddlewareGroup) -> Self {
        self.groups.push(group.into_set());
        self
    }

    /// Binds a length-prefixed TCP listener.
    ///
    /// # Errors
    ///
    /// [`ServerError::BindFailed`] if the address cannot be bound and
    /// [`ServerError::Poller`] if a poller cannot be created.
    pub fn bind_tcp(self, addr: SocketAddr) -> Result<Server, ServerError> {
        let listener = Listener::tcp(addr, ConnectionKind::Tcp, self.config.listen_backlog)?;
        self.build(listener, ConnectionKind::Tcp)
    }

    /// Binds a WebSocket listener.
    ///
    /// # Errors
    ///
    /// As [`bind_tcp`](Self::bind_tcp), plus
    /// [`ServerError::MissingWebSocketHandler`] when no handler was set.
    pub fn bind_websocket(self, addr: SocketAddr) -> Result<Server, ServerError> {
        if self.ws_handler.is_none() {
            return Err(ServerError::MissingWebSocketHandler);
        }
        let listener = Listener::tcp(addr, ConnectionKind::WebSocket, self.config.listen_backlog)?;
        self.build(listener, ConnectionKind::WebSocket)
    }

    /// Binds a UDP socket; every new peer becomes its own connection.
    ///
    /// # Errors
    ///
    /// As [`bind_tcp`](Self::bind_tcp).
    pub fn bind_udp(self, addr: SocketAddr) -> Result<Server, ServerError> {
        if self.tls.is_some() {
            warn!(%addr, "tls is not applied to udp connections");
        }
        let listener = Listener::udp(addr)?;
        self.build(listener, ConnectionKind::Udp)
    }

    fn build(self, listener: Listener, kind: ConnectionKind) -> Result<Server, ServerError> {
        let local_addr = listener.local_addr().map_err(|source| ServerError::BindFailed {
            addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            source,
        })?;
        let packer = self
            .packer
            .unwrap_or_else(|| Arc::new(DataPacker::with_max_body_length(self.config.max_body_length)));
        let table = RouteTable::build(self.routes, self.groups, self.ws_handler.clone());
        let shards = EventLoop::new(self.config.event_loops)?;
        let acceptor = Acceptor::new(listener)?;
        let ctx = ServerContext::new(packer, self.hooks, self.ws_handler, self.tls, self.config);

        Ok(Server {
            inner: Arc::new(ServerInner {
                ctx: Arc::new(ctx),
                table: Arc::new(table),
                shards: Arc::new(shards),
                acceptor,
                kind,
                local_addr,
                lifecycle: Mutex::new(Lifecycle::Ready),
            }),
        })
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Started,
    Stopping,
}

/// Resources that exist only while the server runs.
struct Running {
    runtime: Runtime,
    tx: mpsc::Sender<Dispatch>,
    dispatcher: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

enum Lifecycle {
    /// Bound, never started.
    Ready,
    Started(Running),
    Stopping,
    /// Stopped after running; cannot restart.
    Finished,
}

struct ServerInner {
    ctx: Arc<ServerContext>,
    table: Arc<RouteTable>,
    shards: Arc<EventLoop>,
    acceptor: Acceptor,
    kind: ConnectionKind,
    local_addr: SocketAddr,
    lifecycle: Mutex<Lifecycle>,
}

/// A bound server.  Dropping it stops it.
pub struct Server {
    inner: Arc<ServerInner>,
}

/// A cloneable remote control for a [`Server`], e.g. for a signal handler.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Starts the dispatcher, the shard threads, the acceptor and the
    /// heartbeat.  A no-op on a started server.
    ///
    /// # Errors
    ///
    /// [`ServerError::Spawn`] if a thread or the dispatch runtime cannot be
    /// created, [`ServerError::Poller`] if the listener cannot be registered
    /// and [`ServerError::AlreadyStopped`] after [`stop`](Self::stop).
    pub fn start(&self) -> Result<(), ServerError> {
        self.inner.start()
    }

    /// Stops the server and closes every connection.  Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// The bound address (with the real port when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn kind(&self) -> ConnectionKind {
        self.inner.kind
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.ctx.registry.len()
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl ServerHandle {
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.inner.ctx.registry.len()
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("kind", &self.inner.kind)
            .field("local_addr", &self.inner.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ServerInner {
    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ServerState {
        match *self.lifecycle() {
            Lifecycle::Ready | Lifecycle::Finished => ServerState::Stopped,
            Lifecycle::Started(_) => ServerState::Started,
            Lifecycle::Stopping => ServerState::Stopping,
        }
    }

    fn start(&self) -> Result<(), ServerError> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Ready => {}
            Lifecycle::Started(_) => return Ok(()),
            Lifecycle::Stopping | Lifecycle::Finished => return Err(ServerError::AlreadyStopped),
        }

        let config = &self.ctx.config;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(config.workers + 1)
            .thread_name("pollnet-dispatch")
            .enable_all()
            .build()
            .map_err(|source| ServerError::Spawn {
                what: "dispatch runtime",
                source,
            })?;
        let (tx, dispatcher) = spawn_dispatcher(runtime.handle(), Arc::clone(&self.ctx), Arc::clone(&self.table));

        if let Err(e) = self.shards.start(&self.ctx, &tx) {
            self.shards.stop();
            runtime.shutdown_background();
            return Err(e);
        }
        let accept = AcceptContext {
            ctx: Arc::clone(&self.ctx),
            shards: Arc::clone(&self.shards),
            tx: tx.clone(),
        };
        if let Err(e) = self.acceptor.start(accept) {
            self.shards.stop();
            self.ctx.registry.clear_all();
            runtime.shutdown_background();
            *lifecycle = Lifecycle::Finished;
            return Err(e);
        }

        let heartbeat = config
            .heartbeat()
            .map(|(interval, idle)| spawn_heartbeat(runtime.handle(), Arc::clone(&self.ctx), interval, idle));

        info!(
            addr = %self.local_addr,
            kind = %self.kind,
            shards = config.event_loops,
            workers = config.workers,
            tls = self.ctx.tls.is_some(),
            heartbeat = heartbeat.is_some(),
            "server started"
        );
        *lifecycle = Lifecycle::Started(Running {
            runtime,
            tx,
            dispatcher,
            heartbeat,
        });
        Ok(())
    }

    fn stop(&self) {
        // The lock is released while tearing down so state() stays readable.
        let running = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Started(running) => running,
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };

        let Running {
            runtime,
            tx,
            dispatcher,
            heartbeat,
        } = running;
        // Queued messages are dropped; threads blocked on a full queue return.
        dispatcher.abort();

        self.acceptor.stop();
        self.shards.stop();
        let closed = self.ctx.registry.clear_all();

        drop(tx);
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        runtime.shutdown_background();

        *self.lifecycle() = Lifecycle::Finished;
        info!(addr = %self.local_addr, closed, "server stopped");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

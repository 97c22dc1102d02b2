//! # pollnet-server
//!
//! An embeddable TCP / UDP / WebSocket server engine built directly on the
//! operating system's readiness notification (epoll on Linux, kqueue on the
//! BSDs and macOS).  Sockets are non-blocking and a small, fixed set of
//! threads serves every connection.
//!
//! # Architecture overview (for beginners)
//!
//! ```text
//!            ┌──────────┐  accept / first datagram
//!  clients ─►│ acceptor │──────────────┐
//!            └──────────┘              ▼
//!                              ┌──────────────┐   registry (fd → Arc<Connection>)
//!                              │ shard 0 .. N │◄─────────────────────────────────┐
//!                              └──────┬───────┘ readiness → read / write pass    │
//!                                     │ complete messages                        │
//!                                     ▼                                          │
//!                              ┌──────────────┐  middlewares → handler           │
//!                              │  dispatcher  │──────► conn.send() / close() ────┘
//!                              └──────────────┘  (blocking pool, `workers` wide)
//! ```
//!
//! - **`poller`** – one epoll/kqueue instance per shard, plus a wake handle
//!   used for shutdown.
//! - **`connection`** – the per-connection state machine: resumable decoding
//!   (framed packets, WebSocket frames, datagrams), a write queue that
//!   survives partial writes, and optional TLS via `rustls`.
//! - **`acceptor`** – turns the listening socket into connections.
//! - **`event_loop`** – the shard threads.
//! - **`router`** / **`dispatcher`** – middleware chains per message id, run
//!   off the shard threads.
//! - **`server`** – the [`ServerBuilder`] / [`Server`] facade tying it
//!   together.
//!
//! The wire formats themselves live in `pollnet-core`; the most used types
//! are re-exported here.

mod acceptor;
pub mod config;
mod connection;
mod context;
mod dispatcher;
pub mod error;
mod event_loop;
pub mod hooks;
mod poller;
mod registry;
pub mod request;
pub mod router;
mod server;
mod socket;
mod sys;

pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnState, Connection, ConnectionKind};
pub use error::{SendError, ServerError};
pub use hooks::{ConnectionHooks, NoopHooks, WebSocketHandler};
pub use request::{Extensions, Request};
pub use router::{Middleware, MiddlewareGroup, Next, Router};
pub use server::{Server, ServerBuilder, ServerHandle, ServerState};

pub use pollnet_core::{close_code, DataPacker, Message, OpCode, Packer, PacketHeader, ProtocolError, QueryParams};

//! Application callbacks for connection lifecycle events.
//!
//! | Connection kind | Opened                        | Data                  | Closed                          |
//! |-----------------|-------------------------------|-----------------------|---------------------------------|
//! | Framed TCP      | [`ConnectionHooks::on_open`]  | routed by message id  | [`ConnectionHooks::on_close`]   |
//! | UDP peer        | [`ConnectionHooks::on_open`]  | routed by message id  | [`ConnectionHooks::on_close`]   |
//! | WebSocket       | [`WebSocketHandler::open`]    | [`WebSocketHandler::message`] | [`WebSocketHandler::close`] |
//!
//! Open and close callbacks run synchronously on the reactor thread that
//! observed the event, so they must be quick.  Message handling runs on the
//! dispatcher's worker pool.

use std::sync::Arc;

use pollnet_core::QueryParams;

use crate::connection::Connection;
use crate::request::Request;

/// Open/close notifications for framed TCP and UDP connections.
///
/// Both methods default to doing nothing.
pub trait ConnectionHooks: Send + Sync {
    /// A connection was accepted (TCP) or a first datagram arrived from a new
    /// peer (UDP).  Runs before any message from it is dispatched.
    fn on_open(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// The connection is gone: peer disconnect, protocol error, idle
    /// timeout, explicit close or server shutdown.  Fires exactly once.
    fn on_close(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }
}

/// Hooks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ConnectionHooks for NoopHooks {}

/// The application side of a WebSocket server.
pub trait WebSocketHandler: Send + Sync {
    /// The upgrade handshake succeeded.  `query` holds the decoded
    /// query-string of the request path, e.g. an auth token.
    fn open(&self, conn: &Arc<Connection>, query: &QueryParams) {
        let _ = (conn, query);
    }

    /// A complete TEXT or BINARY message arrived and passed the global
    /// middlewares.
    ///
    /// # Errors
    ///
    /// Errors are logged by the dispatcher; the connection stays open.
    fn message(&self, req: &Request) -> anyhow::Result<()>;

    /// The connection closed after a successful handshake.
    fn close(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }
}

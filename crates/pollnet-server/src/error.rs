//! Error types surfaced by the server API.

use std::io;
use std::net::SocketAddr;

use pollnet_core::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;

/// Failures while building, starting or stopping a server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `epoll_create1` / `kqueue` or the wake descriptor could not be created.
    #[error("failed to create poller: {0}")]
    Poller(#[source] io::Error),

    #[error("failed to start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// WebSocket mode requires a [`WebSocketHandler`](crate::hooks::WebSocketHandler).
    #[error("websocket server started without a websocket handler")]
    MissingWebSocketHandler,

    /// A stopped server cannot be started again; build a new one.
    #[error("server has already been stopped")]
    AlreadyStopped,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures when writing to a connection.
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is already closed; nothing was written.
    #[error("connection {0} is closed")]
    Closed(u64),

    /// The operation does not apply to this kind of connection (for example
    /// `text()` on a framed TCP connection, or before the WebSocket
    /// handshake completed).
    #[error("operation not supported on {0} connection")]
    Unsupported(&'static str),

    /// The frame could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// TLS refused the plaintext.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// The socket failed; the connection has been closed.
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

//! Stream accept loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use socket2::Socket;
use tracing::{debug, error, warn};

use super::AcceptContext;
use crate::connection::{Connection, ConnectionKind};
use crate::socket::{prepare_accepted, to_socket_addr};

/// Pause after a failed `accept`.  The listener stays readable while the
/// backlog is non-empty, so retrying at once would spin.
pub(super) const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts until the backlog is empty.
pub(super) fn accept_ready(listener: &Socket, kind: ConnectionKind, accept: &AcceptContext) {
    loop {
        match listener.accept() {
            Ok((socket, addr)) => {
                if let Err(e) = admit(socket, &addr, kind, accept) {
                    warn!("dropping accepted connection: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EMFILE and friends: leave the rest of the backlog for later.
                error!("accept failed, pausing {ACCEPT_ERROR_BACKOFF:?}: {e}");
                std::thread::sleep(ACCEPT_ERROR_BACKOFF);
                return;
            }
        }
    }
}

fn admit(socket: Socket, addr: &socket2::SockAddr, kind: ConnectionKind, accept: &AcceptContext) -> io::Result<()> {
    let AcceptContext { ctx, shards, .. } = accept;
    let peer = to_socket_addr(addr)?;
    let socket = prepare_accepted(socket, ctx.config.tcp_keepalive())?;

    let id = ctx.next_conn_id();
    let conn = Connection::new(id, socket, peer, kind, shards.poller_for(id), ctx)
        .map_err(io::Error::other)?;
    ctx.registry.add(Arc::clone(&conn));

    // WebSocket connections are announced once their handshake completes.
    if kind == ConnectionKind::Tcp {
        conn.mark_opened();
        ctx.hooks.on_open(&conn);
    }
    if let Err(e) = conn.register() {
        conn.close();
        return Err(e);
    }
    debug!(conn_id = id, %peer, %kind, tls = conn.is_tls(), "accepted connection");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Instant;

    use socket2::{Domain, Protocol, Type};
    use tokio::sync::mpsc;

    use super::*;
    use crate::context::test_support::{context, CloseCounter};
    use crate::event_loop::EventLoop;

    fn accept_context() -> AcceptContext {
        let (tx, _rx) = mpsc::channel(1);
        AcceptContext {
            ctx: context(Arc::new(CloseCounter::default())),
            shards: Arc::new(EventLoop::new(1).unwrap()),
            tx,
        }
    }

    #[test]
    fn test_accept_error_backs_off() {
        // Arrange: a bound socket that was never put into listening mode,
        // so accept fails with something other than WouldBlock
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&addr.into()).unwrap();
        socket.set_nonblocking(true).unwrap();
        let accept = accept_context();

        // Act
        let started = Instant::now();
        accept_ready(&socket, ConnectionKind::Tcp, &accept);

        // Assert
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
        assert_eq!(accept.ctx.registry.len(), 0);
    }

    #[test]
    fn test_empty_backlog_returns_at_once() {
        let socket = crate::socket::tcp_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let accept = accept_context();

        let started = Instant::now();
        accept_ready(&socket, ConnectionKind::Tcp, &accept);

        assert!(started.elapsed() < ACCEPT_ERROR_BACKOFF);
    }
}

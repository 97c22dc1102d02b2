//! UDP peer demultiplexing.
//!
//! UDP has no accept.  The listening socket instead receives the first
//! datagram of every new peer; for each new source address the acceptor
//! creates a socket bound to the same local port (port reuse) and connected
//! to that peer.  From then on the kernel delivers that peer's datagrams to
//! the connected socket, which a reactor shard reads like any other
//! connection.  The first datagram itself is dispatched as the connection's
//! first message.
//!
//! A datagram that still reaches the listener for a known peer (sent before
//! the connected socket existed) is dispatched to that peer's connection.
//!
//! New connections are registered with their shard only once the listener
//! is drained.  Until then nothing reads the connected socket, so every
//! datagram the listener holds for a peer is queued ahead of anything the
//! shard reads later.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use pollnet_core::decode_datagram;
use tracing::{debug, error, warn};

use super::AcceptContext;
use crate::connection::{Connection, ConnectionKind};
use crate::dispatcher::Dispatch;
use crate::socket::udp_peer;

pub(super) struct PeerTable {
    peers: HashMap<SocketAddr, Arc<Connection>>,
    /// Opened during the current drain, not yet handed to their shards.
    unregistered: Vec<Arc<Connection>>,
    buf: Vec<u8>,
}

impl PeerTable {
    pub(super) fn new(buffer_len: usize) -> Self {
        Self {
            peers: HashMap::new(),
            unregistered: Vec::new(),
            buf: vec![0; buffer_len],
        }
    }

    /// Drains the listener, then registers the peers it opened.
    pub(super) fn receive_ready(&mut self, listener: &UdpSocket, accept: &AcceptContext) {
        loop {
            match listener.recv_from(&mut self.buf) {
                Ok((n, peer)) => {
                    let datagram = self.buf[..n].to_vec();
                    self.receive(listener, &datagram, peer, accept);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("udp receive failed: {e}");
                    break;
                }
            }
        }
        self.register_opened();
    }

    fn register_opened(&mut self) {
        for conn in self.unregistered.drain(..) {
            if conn.is_closed() {
                continue;
            }
            if let Err(e) = conn.register() {
                error!(conn_id = conn.id(), peer = %conn.peer_addr(), "failed to register udp peer: {e}");
                conn.close();
            }
        }
    }

    fn receive(&mut self, listener: &UdpSocket, datagram: &[u8], peer: SocketAddr, accept: &AcceptContext) {
        let message = match decode_datagram(&*accept.ctx.packer, datagram) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, "dropping malformed datagram: {e}");
                return;
            }
        };

        let conn = match self.peers.get(&peer) {
            Some(conn) if !conn.is_closed() => Arc::clone(conn),
            _ => match self.open(listener, peer, accept) {
                Ok(conn) => conn,
                Err(e) => {
                    error!(%peer, "failed to open udp peer socket: {e}");
                    return;
                }
            },
        };

        if accept.tx.blocking_send(Dispatch { conn, message }).is_err() {
            debug!(%peer, "dispatcher closed; dropping datagram");
        }
    }

    fn open(&mut self, listener: &UdpSocket, peer: SocketAddr, accept: &AcceptContext) -> io::Result<Arc<Connection>> {
        let AcceptContext { ctx, shards, .. } = accept;
        self.peers.retain(|_, conn| !conn.is_closed());

        let socket = udp_peer(listener.local_addr()?, peer)?;
        let id = ctx.next_conn_id();
        let conn = Connection::new(id, socket, peer, ConnectionKind::Udp, shards.poller_for(id), ctx)
            .map_err(io::Error::other)?;
        ctx.registry.add(Arc::clone(&conn));
        conn.mark_opened();
        ctx.hooks.on_open(&conn);

        debug!(conn_id = id, %peer, "opened udp peer");
        self.unregistered.push(Arc::clone(&conn));
        self.peers.insert(peer, Arc::clone(&conn));
        Ok(conn)
    }
}

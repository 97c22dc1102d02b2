//! Reactor shards: N pollers, each waited on by its own thread.
//!
//! A connection is pinned to shard `id % N` for its whole life.  The shard
//! thread is the only one that reads from that connection's socket; when a
//! read pass completes messages it forwards them to the dispatcher queue in
//! arrival order.
//!
//! Read passes are bounded.  A connection whose pass ran out of budget is
//! put on the shard's backlog and read again on the next round, after every
//! other ready descriptor had its turn.  While the backlog is not empty the
//! shard wakes its own poller so the next `wait` does not block.
//!
//! # Failure semantics
//!
//! | Situation                               | Reaction                                  |
//! |-----------------------------------------|-------------------------------------------|
//! | `wait` interrupted (`EINTR`)            | retried                                   |
//! | `wait` fails otherwise                  | every connection of the shard is closed, the thread exits |
//! | event for a descriptor not in registry  | ignored (closed meanwhile)                |
//! | event whose token id does not match     | ignored (descriptor recycled)             |
//! | decode or write error on one connection | that connection is closed, shard goes on  |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ConnState, Connection, ReadOutcome};
use crate::context::ServerContext;
use crate::dispatcher::Dispatch;
use crate::error::ServerError;
use crate::poller::{Event, Poller};

pub(crate) struct EventLoop {
    pollers: Vec<Arc<Poller>>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl EventLoop {
    pub(crate) fn new(shards: usize) -> Result<Self, ServerError> {
        let pollers = (0..shards.max(1))
            .map(|index| Poller::new(index).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ServerError::Poller)?;
        Ok(Self {
            pollers,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// The shard that owns connection `conn_id`.
    pub(crate) fn poller_for(&self, conn_id: u64) -> Arc<Poller> {
        let index = (conn_id % self.pollers.len() as u64) as usize;
        Arc::clone(&self.pollers[index])
    }

    pub(crate) fn start(&self, ctx: &Arc<ServerContext>, tx: &mpsc::Sender<Dispatch>) -> Result<(), ServerError> {
        self.running.store(true, Ordering::Release);
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        for poller in &self.pollers {
            let poller = Arc::clone(poller);
            let ctx = Arc::clone(ctx);
            let tx = tx.clone();
            let running = Arc::clone(&self.running);
            let handle = std::thread::Builder::new()
                .name(format!("pollnet-shard-{}", poller.index()))
                .spawn(move || run_shard(&poller, &ctx, &tx, &running))
                .map_err(|source| ServerError::Spawn {
                    what: "reactor shard",
                    source,
                })?;
            threads.push(handle);
        }
        info!(shards = self.pollers.len(), "event loop started");
        Ok(())
    }

    /// Signals every shard, wakes it and waits for its thread to exit.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for poller in &self.pollers {
            if let Err(e) = poller.wake() {
                warn!(shard = poller.index(), "failed to wake shard: {e}");
            }
        }
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in threads {
            if handle.join().is_err() {
                error!("reactor shard panicked");
            }
        }
        debug!("event loop stopped");
    }
}

fn run_shard(poller: &Poller, ctx: &Arc<ServerContext>, tx: &mpsc::Sender<Dispatch>, running: &AtomicBool) {
    let shard = poller.index();
    let mut events = Vec::new();
    let mut backlog: Vec<Arc<Connection>> = Vec::new();

    while running.load(Ordering::Acquire) {
        if !backlog.is_empty() {
            if let Err(e) = poller.wake() {
                warn!(shard, "failed to wake own poller: {e}");
            }
        }
        if let Err(e) = poller.wait(&mut events) {
            error!(shard, "poller wait failed, closing shard: {e}");
            ctx.registry.clear_by_poller(shard);
            return;
        }

        let revisit = std::mem::take(&mut backlog);
        for event in &events {
            if let Some(conn) = handle_event(ctx, tx, event) {
                backlog.push(conn);
            }
        }
        for conn in revisit {
            // Already served by an event this round, or waiting on a write
            // backlog; `on_writable` resumes reading once it drains.
            if events.iter().any(|event| event.token == conn.token()) || conn.state() == ConnState::WritePending {
                continue;
            }
            if read_pass(ctx, tx, &conn) {
                backlog.push(conn);
            }
        }
    }
}

/// Serves one readiness event.  Returns the connection if its read pass ran
/// out of budget.
fn handle_event(ctx: &Arc<ServerContext>, tx: &mpsc::Sender<Dispatch>, event: &Event) -> Option<Arc<Connection>> {
    let fd = event.token.fd();
    let Some(conn) = ctx.registry.get(fd) else {
        trace!(fd, "event for unknown descriptor");
        return None;
    };
    if !event.token.matches(conn.id()) {
        trace!(fd, conn_id = conn.id(), "stale event for recycled descriptor");
        return None;
    }

    let mut readable = event.readable;
    if event.writable {
        // Input may have been left buffered when the backlog started.
        readable |= conn.on_writable();
    }
    (readable && read_pass(ctx, tx, &conn)).then_some(conn)
}

/// One bounded read pass; true if the connection has more to read.
fn read_pass(ctx: &ServerContext, tx: &mpsc::Sender<Dispatch>, conn: &Arc<Connection>) -> bool {
    let outcome = conn.on_readable();
    let more = outcome.more;
    forward(ctx, tx, conn, outcome);
    more && !conn.is_closed()
}

/// Runs the WebSocket open callback, then queues the messages in order.
fn forward(ctx: &ServerContext, tx: &mpsc::Sender<Dispatch>, conn: &Arc<Connection>, outcome: ReadOutcome) {
    if let (Some(query), Some(handler)) = (outcome.opened, &ctx.ws_handler) {
        if !conn.is_closed() {
            conn.mark_opened();
            handler.open(conn, &query);
        }
    }

    for message in outcome.messages {
        let dispatch = Dispatch {
            conn: Arc::clone(conn),
            message,
        };
        // Blocks while the queue is full; fails only once the dispatcher is gone.
        if tx.blocking_send(dispatch).is_err() {
            debug!(conn_id = conn.id(), "dispatcher closed; dropping messages");
            return;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use pollnet_core::{DataPacker, Packer};

    use super::*;
    use crate::connection::ConnectionKind;
    use crate::context::test_support::{connection, context, CloseCounter};

    #[test]
    fn test_connections_are_spread_by_id() {
        let event_loop = EventLoop::new(3).unwrap();

        assert_eq!(event_loop.poller_for(0).index(), 0);
        assert_eq!(event_loop.poller_for(4).index(), 1);
        assert_eq!(event_loop.poller_for(5).index(), 2);
    }

    #[test]
    fn test_zero_shards_means_one() {
        let event_loop = EventLoop::new(0).unwrap();
        assert_eq!(event_loop.poller_for(17).index(), 0);
    }

    #[test]
    fn test_shard_reads_and_forwards_messages() {
        // Arrange
        let ctx = context(Arc::new(CloseCounter::default()));
        let event_loop = EventLoop::new(1).unwrap();
        let (conn, mut peer) = connection(&ctx, &event_loop.poller_for(1), 1, ConnectionKind::Tcp);
        let (tx, mut rx) = mpsc::channel(8);
        event_loop.start(&ctx, &tx).unwrap();

        // Act
        peer.write_all(&DataPacker::new().pack(3, b"via shard").unwrap()).unwrap();
        let mut received = None;
        for _ in 0..200 {
            if let Ok(dispatch) = rx.try_recv() {
                received = Some(dispatch);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        event_loop.stop();

        // Assert
        let dispatch = received.expect("message forwarded");
        assert_eq!(dispatch.conn.id(), conn.id());
        assert_eq!(dispatch.message.id(), 3);
        assert_eq!(dispatch.message.payload(), b"via shard");
    }

    #[test]
    fn test_input_buffered_past_budget_is_still_delivered() {
        // Arrange: the upgrade request and many small frames arrive in one
        // read, so most frames sit in the decoder rather than the socket
        let ctx = context(Arc::new(CloseCounter::default()));
        let event_loop = EventLoop::new(1).unwrap();
        let (_conn, mut peer) = connection(&ctx, &event_loop.poller_for(1), 1, ConnectionKind::WebSocket);
        let count = crate::connection::READ_BUDGET * 3;
        let mut wire = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
            .to_vec();
        let mask = [1u8, 2, 3, 4];
        for i in 0..count {
            wire.extend_from_slice(&[0x82, 0x81]);
            wire.extend_from_slice(&mask);
            wire.push(i as u8 ^ mask[0]);
        }
        let (tx, mut rx) = mpsc::channel(4);
        event_loop.start(&ctx, &tx).unwrap();

        // Act
        peer.write_all(&wire).unwrap();
        let mut payloads = Vec::new();
        for _ in 0..500 {
            while let Ok(dispatch) = rx.try_recv() {
                payloads.push(dispatch.message.payload()[0]);
            }
            if payloads.len() == count {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        event_loop.stop();

        // Assert
        let expected: Vec<u8> = (0..count).map(|i| i as u8).collect();
        assert_eq!(payloads, expected);
    }

    #[test]
    fn test_stale_token_is_ignored() {
        // Arrange: an event tagged with a different connection id
        let ctx = context(Arc::new(CloseCounter::default()));
        let poller = Arc::new(Poller::new(0).unwrap());
        let (conn, mut peer) = connection(&ctx, &poller, 1, ConnectionKind::Tcp);
        peer.write_all(&DataPacker::new().pack(1, b"x").unwrap()).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let stale = Event {
            token: crate::poller::Token::new(conn.fd(), 2),
            readable: true,
            writable: false,
        };

        // Act
        handle_event(&ctx, &tx, &stale);

        // Assert: nothing read, nothing forwarded
        assert!(rx.try_recv().is_err());
        let fresh = Event {
            token: conn.token(),
            readable: true,
            writable: false,
        };
        handle_event(&ctx, &tx, &fresh);
        assert_eq!(rx.try_recv().unwrap().message.payload(), b"x");
    }

    #[test]
    fn test_stop_joins_idle_shards() {
        let ctx = context(Arc::new(CloseCounter::default()));
        let event_loop = EventLoop::new(2).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        event_loop.start(&ctx, &tx).unwrap();

        event_loop.stop();

        assert!(event_loop.threads.lock().unwrap().is_empty());
    }
}

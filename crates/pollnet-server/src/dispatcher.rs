//! Hand-off from reactor shards to application code.
//!
//! Shards push completed messages into a bounded `tokio::sync::mpsc`
//! channel.  One async task drains it, resolves the precomputed chain for
//! each message and runs it on the blocking pool, with at most `workers`
//! chains in flight (a semaphore).  When the queue is full a shard blocks in
//! `blocking_send`, which stops it reading from its sockets until handlers
//! catch up.
//!
//! The idle sweep also lives here: a `tokio::time::interval` task that asks
//! the registry to close connections without recent inbound traffic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pollnet_core::Message;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::request::Request;
use crate::router::RouteTable;

/// One message on its way to a handler.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub(crate) conn: Arc<Connection>,
    pub(crate) message: Message,
}

/// Starts the dispatch task; returns the sending side of its queue and the
/// task.  Aborting the task drops the receiver, which fails every pending
/// and future `blocking_send`.
pub(crate) fn spawn_dispatcher(
    runtime: &Handle,
    ctx: Arc<ServerContext>,
    table: Arc<RouteTable>,
) -> (mpsc::Sender<Dispatch>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(ctx.config.dispatch_queue_capacity);
    let permits = Arc::new(Semaphore::new(ctx.config.workers));
    let task = runtime.spawn(run(rx, ctx, table, permits));
    (tx, task)
}

async fn run(
    mut rx: mpsc::Receiver<Dispatch>,
    ctx: Arc<ServerContext>,
    table: Arc<RouteTable>,
    permits: Arc<Semaphore>,
) {
    while let Some(Dispatch { conn, message }) = rx.recv().await {
        let Some(chain) = table.chain_for(&message).cloned() else {
            warn!(conn_id = conn.id(), msg_id = message.id(), "no route for message; dropped");
            continue;
        };
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };

        let ctx = Arc::clone(&ctx);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let (conn_id, msg_id) = (conn.id(), message.id());
            let mut req = Request::new(conn, message, ctx);
            if let Err(e) = chain(&mut req) {
                warn!(conn_id, msg_id, "handler failed: {e:#}");
            }
        });
    }
    debug!("dispatcher stopped");
}

/// Starts the idle sweep.
pub(crate) fn spawn_heartbeat(
    runtime: &Handle,
    ctx: Arc<ServerContext>,
    interval: Duration,
    idle: Duration,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let ctx = Arc::clone(&ctx);
            let swept = tokio::task::spawn_blocking(move || ctx.registry.sweep_idle(Instant::now(), idle)).await;
            match swept {
                Ok(0) => {}
                Ok(closed) => debug!(closed, "heartbeat closed idle connections"),
                Err(e) => warn!("heartbeat sweep failed: {e}"),
            }
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

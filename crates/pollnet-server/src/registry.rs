//! The set of live connections, keyed by descriptor.
//!
//! The registry is the only long-lived owner of a [`Connection`]: pollers
//! hold none, and the dispatcher holds one only while a handler runs.  A
//! connection absent from the registry is treated as closed.
//!
//! Bulk operations (`clear_by_poller`, `clear_all`, `sweep_idle`) collect
//! their victims under the read lock and close them after releasing it,
//! because closing calls back into [`Registry::remove`].

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use pollnet_core::close_code;
use tracing::debug;

use crate::connection::Connection;

#[derive(Default)]
pub(crate) struct Registry {
    conns: RwLock<HashMap<RawFd, Arc<Connection>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RawFd, Arc<Connection>>> {
        self.conns.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RawFd, Arc<Connection>>> {
        self.conns.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, conn: Arc<Connection>) {
        self.write().insert(conn.fd(), conn);
    }

    /// Removes the entry for `fd` if it still belongs to connection `id`.
    ///
    /// The id check matters once a descriptor number has been reused: the
    /// late close of the old connection must not evict the new one.
    pub(crate) fn remove(&self, fd: RawFd, id: u64) -> Option<Arc<Connection>> {
        let mut conns = self.write();
        match conns.get(&fd) {
            Some(conn) if conn.id() == id => conns.remove(&fd),
            _ => None,
        }
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.read().get(&fd).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }

    /// A snapshot of every live connection.
    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.read().values().cloned().collect()
    }

    /// Force-closes every connection registered with shard `index`.
    ///
    /// Used when that shard's wait loop died: its descriptors will never be
    /// reported ready again.
    pub(crate) fn clear_by_poller(&self, index: usize) -> usize {
        let victims: Vec<_> = self
            .read()
            .values()
            .filter(|conn| conn.shard() == index)
            .cloned()
            .collect();
        for conn in &victims {
            conn.close();
            self.remove(conn.fd(), conn.id());
        }
        debug!(shard = index, closed = victims.len(), "cleared connections of failed shard");
        victims.len()
    }

    /// Closes everything; called on server stop.
    pub(crate) fn clear_all(&self) -> usize {
        let victims = self.connections();
        for conn in &victims {
            conn.close_with(close_code::GOING_AWAY, "server stopping");
            self.remove(conn.fd(), conn.id());
        }
        victims.len()
    }

    /// Closes connections with no inbound traffic for longer than `idle`.
    pub(crate) fn sweep_idle(&self, now: Instant, idle: Duration) -> usize {
        let victims: Vec<_> = self
            .read()
            .values()
            .filter(|conn| conn.idle_for(now) > idle)
            .cloned()
            .collect();
        for conn in &victims {
            debug!(conn_id = conn.id(), peer = %conn.peer_addr(), "closing idle connection");
            conn.close();
            self.remove(conn.fd(), conn.id());
        }
        victims.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! State shared by every part of one server instance.
//!
//! There are no process-wide singletons: the builder assembles one
//! `ServerContext`, and acceptors, shards, connections and the dispatcher all
//! reach the registry and the collaborators through it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pollnet_core::Packer;

use crate::config::ServerConfig;
use crate::hooks::{ConnectionHooks, WebSocketHandler};
use crate::registry::Registry;

pub(crate) struct ServerContext {
    pub(crate) registry: Registry,
    pub(crate) packer: Arc<dyn Packer>,
    pub(crate) hooks: Arc<dyn ConnectionHooks>,
    pub(crate) ws_handler: Option<Arc<dyn WebSocketHandler>>,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) config: ServerConfig,
    next_conn_id: AtomicU64,
}

impl ServerContext {
    pub(crate) fn new(
        packer: Arc<dyn Packer>,
        hooks: Arc<dyn ConnectionHooks>,
        ws_handler: Option<Arc<dyn WebSocketHandler>>,
        tls: Option<Arc<rustls::ServerConfig>>,
        config: ServerConfig,
    ) -> Self {
        Self {
            registry: Registry::new(),
            packer,
            hooks,
            ws_handler,
            tls,
            config,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Connection ids start at 1 and are never reused.
    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

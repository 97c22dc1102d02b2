//! What a middleware or handler sees for one inbound message.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use pollnet_core::Message;

use crate::connection::Connection;
use crate::context::ServerContext;

/// Typed per-request storage.
///
/// Middlewares put values here (an authenticated user, a decoded session)
/// and later middlewares or the handler read them back by type.  One value
/// per type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast().ok().map(|boxed: Box<T>| *boxed))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast().ok().map(|boxed: Box<T>| *boxed))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}

/// One decoded message together with the connection it came from.
pub struct Request {
    conn: Arc<Connection>,
    message: Message,
    ctx: Arc<ServerContext>,
    extensions: Extensions,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("conn", &self.conn)
            .field("message_id", &self.message.id())
            .field("len", &self.message.len())
            .finish()
    }
}

impl Request {
    pub(crate) fn new(conn: Arc<Connection>, message: Message, ctx: Arc<ServerContext>) -> Self {
        Self {
            conn,
            message,
            ctx,
            extensions: Extensions::default(),
        }
    }

    /// The connection to reply on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// A snapshot of every live connection, for broadcasting.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.ctx.registry.connections()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

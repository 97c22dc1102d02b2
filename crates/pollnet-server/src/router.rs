//! Message routing and middleware composition.
//!
//! # Execution order
//!
//! ```text
//!   global middlewares ──► group middlewares ──► handler
//!   (in registration order)  (only for routes added to that group)
//! ```
//!
//! A middleware receives the request and a `next` callback.  Calling
//! `next(req)` runs the rest of the chain; returning without calling it
//! short-circuits, which is how authentication checks reject a message.
//!
//! Chains are composed once, when the server is bound, by folding the
//! middleware list from the right around the handler.  Dispatching a message
//! is then a single map lookup followed by one call.
//!
//! ```rust,no_run
//! use pollnet_server::{MiddlewareGroup, ServerBuilder, ServerConfig};
//!
//! let server = ServerBuilder::new(ServerConfig::default())
//!     .use_middleware(|req, next| {
//!         tracing::debug!(id = req.message().id(), "inbound");
//!         next(req)
//!     })
//!     .route(1, |req| Ok(req.connection().send(1, req.message().payload())?))
//!     .group(
//!         MiddlewareGroup::new()
//!             .use_middleware(|req, next| {
//!                 if req.connection().query().get("token").is_none() {
//!                     return Ok(());
//!                 }
//!                 next(req)
//!             })
//!             .route(2, |req| Ok(req.connection().send(2, b"secret")?)),
//!     )
//!     .bind_tcp("127.0.0.1:9000".parse().unwrap())
//!     .unwrap();
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use pollnet_core::Message;
use tracing::warn;

use crate::hooks::WebSocketHandler;
use crate::request::Request;

/// The rest of the chain, as seen by a middleware.
pub type Next<'a> = &'a (dyn Fn(&mut Request) -> anyhow::Result<()> + Send + Sync);

/// A middleware function: inspect or annotate the request, then call (or
/// skip) `next`.
pub type Middleware = Arc<dyn Fn(&mut Request, Next<'_>) -> anyhow::Result<()> + Send + Sync>;

/// A fully composed chain for one message id.
pub(crate) type Chain = Arc<dyn Fn(&mut Request) -> anyhow::Result<()> + Send + Sync>;

/// Business logic for one message id.
pub trait Router: Send + Sync {
    /// # Errors
    ///
    /// Errors are logged by the dispatcher; the connection stays open.
    fn handle(&self, req: &Request) -> anyhow::Result<()>;
}

/// Adapts a closure to [`Router`].
struct FnRouter<F>(F);

impl<F> Router for FnRouter<F>
where
    F: Fn(&Request) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, req: &Request) -> anyhow::Result<()> {
        (self.0)(req)
    }
}

// ── Route sets ────────────────────────────────────────────────────────────────

/// Middlewares plus the routes they apply to.
#[derive(Default, Clone)]
pub(crate) struct RouteSet {
    middlewares: Vec<Middleware>,
    routes: Vec<(u32, Arc<dyn Router>)>,
}

impl RouteSet {
    pub(crate) fn use_middleware<F>(&mut self, middleware: F)
    where
        F: Fn(&mut Request, Next<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
    }

    pub(crate) fn add_router(&mut self, id: u32, router: Arc<dyn Router>) {
        self.routes.push((id, router));
    }

    pub(crate) fn add_route<F>(&mut self, id: u32, handler: F)
    where
        F: Fn(&Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_router(id, Arc::new(FnRouter(handler)));
    }
}

/// Routes that share a set of middlewares.
///
/// Group middlewares run after the global ones and only for the group's
/// own routes.
#[derive(Default, Clone)]
pub struct MiddlewareGroup {
    set: RouteSet,
}

impl MiddlewareGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(&mut Request, Next<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.set.use_middleware(middleware);
        self
    }

    pub fn add_router<R: Router + 'static>(mut self, id: u32, router: R) -> Self {
        self.set.add_router(id, Arc::new(router));
        self
    }

    pub fn route<F>(mut self, id: u32, handler: F) -> Self
    where
        F: Fn(&Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.set.add_route(id, handler);
        self
    }

    pub(crate) fn into_set(self) -> RouteSet {
        self.set
    }
}

// ── Composition ───────────────────────────────────────────────────────────────

/// Wraps `endpoint` in `middlewares`, the first middleware outermost.
pub(crate) fn compose(middlewares: &[Middleware], endpoint: Chain) -> Chain {
    middlewares.iter().rev().fold(endpoint, |next, middleware| {
        let middleware = Arc::clone(middleware);
        let chain: Chain = Arc::new(move |req: &mut Request| middleware(req, &*next));
        chain
    })
}

/// Precomputed chains, one per message id, plus the WebSocket chain.
#[derive(Default)]
pub(crate) struct RouteTable {
    chains: HashMap<u32, Chain>,
    websocket: Option<Chain>,
}

impl RouteTable {
    pub(crate) fn build(
        global: RouteSet,
        groups: Vec<RouteSet>,
        ws_handler: Option<Arc<dyn WebSocketHandler>>,
    ) -> Self {
        let mut chains = HashMap::new();
        let mut insert = |id: u32, middlewares: &[Middleware], router: Arc<dyn Router>| {
            let endpoint: Chain = Arc::new(move |req: &mut Request| router.handle(req));
            if chains.insert(id, compose(middlewares, endpoint)).is_some() {
                warn!(msg_id = id, "route registered twice; the later handler wins");
            }
        };

        for (id, router) in global.routes.iter().cloned() {
            insert(id, &global.middlewares, router);
        }
        for group in groups {
            let middlewares: Vec<Middleware> = global
                .middlewares
                .iter()
                .chain(group.middlewares.iter())
                .cloned()
                .collect();
            for (id, router) in group.routes {
                insert(id, &middlewares, router);
            }
        }

        let websocket = ws_handler.map(|handler| {
            let endpoint: Chain = Arc::new(move |req: &mut Request| handler.message(req));
            compose(&global.middlewares, endpoint)
        });

        Self { chains, websocket }
    }

    /// The chain for `message`: the WebSocket chain for WebSocket messages,
    /// otherwise the route for its id.
    pub(crate) fn chain_for(&self, message: &Message) -> Option<&Chain> {
        if message.is_websocket() {
            self.websocket.as_ref()
        } else {
            self.chains.get(&message.id())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

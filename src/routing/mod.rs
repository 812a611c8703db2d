//! Request dispatch.
//!
//! # Responsibilities
//! - Hold the ordered routing table (method + path regex + predicates)
//! - Pick the first matching entry for a request
//! - Gate WebSocket upgrades: only routes declared `websocket` accept them
//!
//! # Design Decisions
//! - First match wins; the table is ordered from most to least specific
//! - The catch-all fallback proxy is just the last entry
//! - Handlers are boxed closures so middleware-style wrappers compose the
//!   same way plain handlers do

pub mod router;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};

pub use router::{route, ws_route, RouteEntry, RouteTable};

/// The future every handler returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<Body>> + Send>>;

/// A dispatchable request handler.
pub type Handler = Arc<dyn Fn(Request<Body>) -> HandlerFuture + Send + Sync>;

/// A route predicate evaluated against the request after method and path
/// have matched.
pub type Matcher = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// Wrap a plain async fn into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

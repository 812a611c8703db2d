//! stevedore: a smart reverse proxy for a slow, request-per-worker
//! application backend.
//!
//! The proxy absorbs every request class that would otherwise monopolize
//! a backend worker — large streaming uploads, git wire-protocol
//! sessions, presigned object-storage transfers, terminal WebSockets,
//! and long polling — after authorizing each one against the backend via
//! a JSON capability exchange.
//!
//! ```text
//! client → router → [etag | pre-auth | queue | rewrite] → handler
//!                                 │
//!                                 ├── backend (capability + bookkeeping)
//!                                 ├── object store (presigned PUTs)
//!                                 ├── git subprocesses
//!                                 └── websocket upstream
//! ```

// Request plumbing
pub mod api;
pub mod badgateway;
pub mod helper;
pub mod proxy;
pub mod routing;
pub mod server;

// Heavy-lifting subsystems
pub mod artifacts;
pub mod builds;
pub mod channel;
pub mod filestore;
pub mod git;
pub mod lfs;
pub mod objectstore;
pub mod senddata;
pub mod upload;

// Shared state
pub mod etagcache;
pub mod keywatch;
pub mod kvstore;
pub mod queueing;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;

pub use config::ProxyConfig;
pub use server::HttpServer;

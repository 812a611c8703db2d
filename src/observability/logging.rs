//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Log request failures with scrubbed URLs
//!
//! # Design Decisions
//! - Log level configurable via RUST_LOG, defaults to info for this crate
//! - Any URL that reaches a log line goes through helper::scrub_url_params

use axum::body::Body;
use axum::http::Request;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::helper;

/// Initialize the tracing subscriber. Call once, before serving.
pub fn init() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stevedore=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Log a handler error with request context. The URI is scrubbed of
/// sensitive query parameters before it is emitted.
pub fn log_error(req: &Request<Body>, err: &dyn std::fmt::Display) {
    tracing::error!(
        method = %req.method(),
        uri = %helper::scrub_url_params(&req.uri().to_string()),
        "error: {}",
        err
    );
}

//! The fallback reverse proxy.
//!
//! Everything no specialized handler claims streams straight through to
//! the backend. Transport failures surface as the round-tripper's
//! rendered 502; response bodies are never buffered here.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};

use crate::api::VERSION_HEADER;
use crate::badgateway::RoundTripper;
use crate::helper;
use crate::routing::Handler;

/// Millisecond-precision wall clock when the proxy saw the request, for
/// backend-side queueing measurements.
pub const PROXY_START_HEADER: &str = "stevedore-proxy-start";

pub struct Proxy {
    round_tripper: RoundTripper,
    version: String,
}

impl Proxy {
    pub fn new(round_tripper: RoundTripper, version: &str) -> Self {
        Self {
            round_tripper,
            version: version.to_string(),
        }
    }

    pub fn handler(self: Arc<Self>) -> Handler {
        Arc::new(move |req: Request<Body>| {
            let proxy = self.clone();
            Box::pin(async move { proxy.serve(req).await })
        })
    }

    async fn serve(&self, mut req: Request<Body>) -> Response<Body> {
        let forwarded = {
            let mut headers = req.headers().clone();
            helper::set_forwarded_for(&mut headers, &req);
            headers
        };
        *req.headers_mut() = forwarded;

        if let Ok(value) = HeaderValue::from_str(&self.version) {
            req.headers_mut().insert(VERSION_HEADER, value);
        }
        let start_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        if let Ok(value) = HeaderValue::from_str(&start_nanos.to_string()) {
            req.headers_mut().insert(PROXY_START_HEADER, value);
        }

        let mut response = self.round_tripper.round_trip(req).await;

        // Re-allow edge buffering on the default path; only the streaming
        // handlers (git, long poll, senddata) opt out of it.
        response
            .headers_mut()
            .remove(helper::RESPONSE_BUFFERING_HEADER);

        response
    }
}

//! Etag 304 short-circuit.
//!
//! When a polling client presents `If-None-Match` and the shared store
//! still holds the same Etag for the request path, answer 304 without
//! waking the backend at all. Any miss (no header, store error, empty or
//! different value) falls through to normal dispatch.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use axum::middleware::Next;

use crate::kvstore::KvStore;
use crate::observability::metrics;

const SHARED_STATE_NAMESPACE: &str = "etag:";

/// Marker header telling the client (and tests) the response came from
/// the short-circuit, not the backend.
pub const FROM_CACHE_HEADER: &str = "x-stevedore-from-cache";

#[derive(Clone)]
pub struct EtagCache {
    kv: KvStore,
}

impl EtagCache {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }
}

fn store_key(path: &str) -> String {
    format!("{}{}", SHARED_STATE_NAMESPACE, path)
}

/// Clients send the quoted weak form; the store holds the bare value.
fn etag_equal(if_none_match: &str, etag: &str) -> bool {
    if_none_match == format!("W/\"{}\"", etag)
}

/// Axum middleware: short-circuit to 304 on an Etag hit.
pub async fn cache(
    State(cache): State<Option<EtagCache>>,
    req: Request<Body>,
    next: Next,
) -> Response<Body> {
    let Some(cache) = cache else {
        return next.run(req).await;
    };

    let Some(if_none_match) = req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        metrics::record_etag_cache("missing-if-none-match");
        return next.run(req).await;
    };

    let stored = match cache.kv.get_string(&store_key(req.uri().path())).await {
        Ok(v) => v.unwrap_or_default(),
        Err(_) => {
            metrics::record_etag_cache("store-error");
            return next.run(req).await;
        }
    };

    if stored.is_empty() {
        metrics::record_etag_cache("missing-etag");
        return next.run(req).await;
    }

    if !etag_equal(&if_none_match, &stored) {
        metrics::record_etag_cache("miss");
        return next.run(req).await;
    }

    metrics::record_etag_cache("hit");
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    if let Ok(value) = HeaderValue::from_str(&if_none_match) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
        .headers_mut()
        .insert(FROM_CACHE_HEADER, HeaderValue::from_static("true"));
    response
}

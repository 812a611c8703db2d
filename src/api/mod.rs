//! Backend pre-authorization.
//!
//! Every protected route first exchanges a capability descriptor with the
//! backend: the proxy re-issues the request body-less against the same path
//! (plus an optional suffix such as `/authorize`), and the backend answers
//! either with a capability (`application/vnd.stevedore+json`) or with a
//! response the client should see unmodified.

pub mod capability;
pub mod client;

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;

pub use capability::{Capability, MultipartUploadParams, RemoteObject, TerminalSettings};
pub use client::{ApiClient, ApiError, PreAuthOutcome, API_REQUEST_HEADER, VERSION_HEADER};

use crate::helper;
use crate::routing::{Handler, HandlerFuture};

/// Wrap a capability-consuming handler with the pre-authorization exchange.
///
/// On a capability answer the backend response body is already closed
/// (worker freed) before the wrapped handler runs. On anything else the
/// backend response is passed through to the client unmodified.
pub fn pre_auth_handler<F>(api: Arc<ApiClient>, suffix: &'static str, f: F) -> Handler
where
    F: Fn(Request<Body>, Box<Capability>) -> HandlerFuture + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |req: Request<Body>| {
        let api = api.clone();
        let f = f.clone();
        let auth_req = api.new_request(&req, suffix);
        Box::pin(async move {
            let outcome = match auth_req {
                Ok(auth_req) => api.pre_authorize(auth_req).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(PreAuthOutcome::PassThrough(response)) => response,
                Ok(PreAuthOutcome::Authorized {
                    capability,
                    auth_headers,
                }) => {
                    let mut response = f(req, capability).await;
                    for value in auth_headers.get_all(axum::http::header::WWW_AUTHENTICATE) {
                        response
                            .headers_mut()
                            .append(axum::http::header::WWW_AUTHENTICATE, value.clone());
                    }
                    response
                }
                Err(e) => helper::fail_500(&req, &e),
            }
        })
    })
}

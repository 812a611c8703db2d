//! The `send-url` injector: proxy an arbitrary GET on the backend's
//! behalf, forwarding the client's conditional and range headers.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use serde::Deserialize;

use super::{unpack, InjectContext, Injector};
use crate::helper;
use crate::observability::metrics;
use crate::routing::HandlerFuture;

/// Conditional/range request headers forwarded to the target.
const FORWARDED_HEADERS: &[&str] = &[
    "if-match",
    "if-unmodified-since",
    "if-none-match",
    "if-modified-since",
    "if-range",
    "range",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendUrlParams {
    #[serde(rename = "URL", default)]
    url: String,
    #[serde(default)]
    allow_redirects: bool,
}

pub struct SendUrl {
    /// Follows redirects when the params allow it.
    redirecting: reqwest::Client,
    /// Refuses redirects otherwise: the Location answer goes to the client.
    direct: reqwest::Client,
}

impl SendUrl {
    pub fn new() -> Self {
        Self {
            redirecting: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(10))
                .build()
                .expect("build send-url client"),
            direct: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("build send-url client"),
        }
    }
}

impl Default for SendUrl {
    fn default() -> Self {
        Self::new()
    }
}

impl Injector for SendUrl {
    fn prefix(&self) -> &'static str {
        "send-url"
    }

    fn inject(&self, ctx: InjectContext, data: String) -> HandlerFuture {
        let redirecting = self.redirecting.clone();
        let direct = self.direct.clone();
        Box::pin(async move {
            let params: SendUrlParams = match unpack(&data) {
                Ok(params) => params,
                Err(e) => {
                    metrics::record_send_url("invalid-data");
                    tracing::error!("SendURL: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            if params.url.is_empty() {
                metrics::record_send_url("invalid-data");
                return helper::plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                );
            }

            tracing::info!(
                url = %helper::scrub_url_params(&params.url),
                path = %ctx.uri.path(),
                "SendURL: sending"
            );

            let client = if params.allow_redirects {
                &redirecting
            } else {
                &direct
            };

            let mut request = client.get(&params.url);
            for name in FORWARDED_HEADERS {
                for value in ctx.headers.get_all(*name) {
                    request = request.header(*name, value.clone());
                }
            }

            let upstream = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    metrics::record_send_url("request-failed");
                    tracing::error!(
                        url = %helper::scrub_url_params(&params.url),
                        "SendURL: request failed: {}",
                        e
                    );
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            metrics::record_send_url("succeeded");

            let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
            let upstream_headers = upstream.headers().clone();

            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            for (name, value) in upstream_headers.iter() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_str().as_bytes()),
                    HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    response.headers_mut().append(name, value);
                }
            }
            response
        })
    }
}

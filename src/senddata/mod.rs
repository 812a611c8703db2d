//! Senddata: backend-delegated response bodies.
//!
//! The backend signals "don't send my body; produce the response yourself"
//! by setting a sentinel response header to `<prefix>:<base64-json>`. The
//! dispatcher strips the sentinel, decodes the parameters and hands off to
//! the injector registered for the prefix. Everything else passes through
//! untouched.
//!
//! The header name and the injector registry are assembled at startup,
//! not hard-coded.

pub mod sendurl;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, Response, StatusCode, Uri};
use base64::Engine;
use serde::de::DeserializeOwned;

use crate::api::capability::RESPONSE_CONTENT_TYPE;
use crate::helper;
use crate::routing::{Handler, HandlerFuture};

#[derive(Debug, thiserror::Error)]
pub enum SendDataError {
    #[error("decode senddata params: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unpack senddata params: {0}")]
    Json(#[from] serde_json::Error),
}

/// The request bits injectors are allowed to look at. The inbound body is
/// long gone by the time an injector runs.
pub struct InjectContext {
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// A pluggable response-body generator, selected by sentinel prefix.
pub trait Injector: Send + Sync {
    /// Prefix before the `:` in the sentinel value, e.g. `git-archive`.
    fn prefix(&self) -> &'static str;

    /// Produce the full response. `data` is the still-encoded parameter
    /// blob after the prefix; use [`unpack`] to decode it.
    fn inject(&self, ctx: InjectContext, data: String) -> HandlerFuture;
}

/// Decode `<base64-json>` into the injector's typed parameters.
pub fn unpack<T: DeserializeOwned>(data: &str) -> Result<T, SendDataError> {
    let engine = base64::engine::general_purpose::URL_SAFE;
    let bytes = match engine.decode(data) {
        Ok(bytes) => bytes,
        Err(_) => base64::engine::general_purpose::STANDARD.decode(data)?,
    };
    Ok(serde_json::from_slice(&bytes)?)
}

/// Wrap `inner` with senddata dispatch.
pub fn send_data(
    header_name: &str,
    injectors: Vec<Arc<dyn Injector>>,
    inner: Handler,
) -> Handler {
    let header_name: header::HeaderName = header_name
        .to_lowercase()
        .parse()
        .expect("invalid senddata header name");
    let injectors = Arc::new(injectors);

    Arc::new(move |req: Request<Body>| {
        let header_name = header_name.clone();
        let injectors = injectors.clone();
        let inner = inner.clone();
        Box::pin(async move {
            let ctx = InjectContext {
                uri: req.uri().clone(),
                headers: req.headers().clone(),
            };

            let mut response = inner(req).await;

            // A capability content type leaking through here means a
            // routing mistake; never forward it to a client.
            if is_capability_response(&response) {
                tracing::error!(uri = %helper::scrub_url_params(&ctx.uri.to_string()),
                    "refusing to forward an authorization response");
                return helper::plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                );
            }

            let Some(sentinel) = response
                .headers()
                .get(&header_name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
            else {
                return response;
            };

            let Some((prefix, data)) = sentinel.split_once(':') else {
                return response;
            };

            let Some(injector) = injectors.iter().find(|i| i.prefix() == prefix) else {
                return response;
            };

            // The backend body is dropped; the injector owns the response.
            response.headers_mut().remove(&header_name);
            injector.inject(ctx, data.to_string()).await
        })
    })
}

fn is_capability_response(response: &Response<Body>) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| helper::is_content_type(RESPONSE_CONTENT_TYPE, ct))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::handler;
    use axum::http::HeaderValue;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct FakeParams {
        #[serde(rename = "URL")]
        url: String,
    }

    struct FakeInjector;

    impl Injector for FakeInjector {
        fn prefix(&self) -> &'static str {
            "fake"
        }

        fn inject(&self, _ctx: InjectContext, data: String) -> HandlerFuture {
            Box::pin(async move {
                let params: FakeParams = unpack(&data).unwrap();
                Response::new(Body::from(format!("injected:{}", params.url)))
            })
        }
    }

    fn backend_with(header: Option<&'static str>) -> Handler {
        handler(move |_req| async move {
            let mut response = Response::new(Body::from("backend body"));
            if let Some(value) = header {
                response
                    .headers_mut()
                    .insert("test-send-data", HeaderValue::from_static(value));
            }
            response
        })
    }

    fn encode(json: &str) -> String {
        base64::engine::general_purpose::URL_SAFE.encode(json)
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn dispatches_to_matching_injector() {
        let sentinel: &'static str = Box::leak(
            format!("fake:{}", encode(r#"{"URL":"http://x"}"#)).into_boxed_str(),
        );
        let wrapped = send_data(
            "Test-Send-Data",
            vec![Arc::new(FakeInjector)],
            backend_with(Some(sentinel)),
        );

        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = wrapped(req).await;
        assert!(response.headers().get("test-send-data").is_none());
        assert_eq!(body_text(response).await, "injected:http://x");
    }

    #[tokio::test]
    async fn unknown_prefix_passes_through() {
        let wrapped = send_data(
            "Test-Send-Data",
            vec![Arc::new(FakeInjector)],
            backend_with(Some("other:abc")),
        );

        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = wrapped(req).await;
        assert_eq!(body_text(response).await, "backend body");
    }

    #[tokio::test]
    async fn plain_responses_are_untouched() {
        let wrapped = send_data("Test-Send-Data", vec![Arc::new(FakeInjector)], backend_with(None));

        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = wrapped(req).await;
        assert_eq!(body_text(response).await, "backend body");
    }

    #[test]
    fn unpack_accepts_both_alphabets() {
        let standard = base64::engine::general_purpose::STANDARD.encode(r#"{"URL":"a"}"#);
        let params: FakeParams = unpack(&standard).unwrap();
        assert_eq!(params.url, "a");
    }
}

//! Pre-authorization round trips against the application backend.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::uri::PathAndQuery;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use serde::Serialize;

use super::capability::{Capability, RESPONSE_CONTENT_TYPE};
use crate::badgateway::RoundTripper;
use crate::helper;
use crate::observability::metrics;

/// This header carries the signed JWT proving the request came from us.
pub const API_REQUEST_HEADER: &str = "stevedore-api-request";

/// Version header set on every request to the backend.
pub const VERSION_HEADER: &str = "stevedore";

/// Pass-through (rejection) response bodies are buffered up to this size so
/// the backend worker is freed promptly; beyond it we give up with a 500.
const FAILURE_RESPONSE_LIMIT: usize = 32 * 1024;

/// Capability bodies have no business being large either.
const CAPABILITY_RESPONSE_LIMIT: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("sign JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("build pre-auth request: {0}")]
    Request(#[from] axum::http::Error),
    #[error("response body exceeded maximum buffer size ({FAILURE_RESPONSE_LIMIT} bytes)")]
    ResponseTooLarge,
    #[error("read backend response: {0}")]
    Read(String),
    #[error("decode capability response: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// What pre-authorization produced.
pub enum PreAuthOutcome {
    /// The backend authorized the request and returned a capability. The
    /// response body has already been consumed (worker freed). Headers the
    /// client must still see (WWW-Authenticate) ride along.
    Authorized {
        capability: Box<Capability>,
        auth_headers: HeaderMap,
    },
    /// The backend answered with something other than a capability
    /// (redirect, 401 challenge, rate limit, injected 502). Forward it.
    PassThrough(Response<Body>),
}

#[derive(Serialize)]
struct Claims {
    iss: &'static str,
    iat: u64,
    exp: u64,
}

/// JSON-over-HTTP client for the backend's authorization endpoints.
pub struct ApiClient {
    round_tripper: RoundTripper,
    version: String,
    encoding_key: jsonwebtoken::EncodingKey,
}

impl ApiClient {
    pub fn new(round_tripper: RoundTripper, version: &str, secret: &[u8]) -> Self {
        Self {
            round_tripper,
            version: version.to_string(),
            encoding_key: jsonwebtoken::EncodingKey::from_secret(secret),
        }
    }

    fn jwt_token(&self) -> Result<String, jsonwebtoken::errors::Error> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = Claims {
            iss: "stevedore",
            iat: now,
            exp: now + 60,
        };
        jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &self.encoding_key)
    }

    /// Construct the equivalent body-less request for the auth endpoint.
    pub(crate) fn new_request(
        &self,
        req: &Request<Body>,
        suffix: &str,
    ) -> Result<Request<Body>, ApiError> {
        let path = join_suffix(req.uri().path(), suffix);
        let path_and_query = match req.uri().query() {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };

        let uri = Uri::builder()
            .path_and_query(
                path_and_query
                    .parse::<PathAndQuery>()
                    .map_err(axum::http::Error::from)?,
            )
            .build()?;

        let mut auth_req = Request::builder()
            .method(req.method().clone())
            .uri(uri)
            .body(Body::empty())?;

        let mut headers = req.headers().clone();
        helper::strip_bodyless_headers(&mut headers);
        helper::set_forwarded_for(&mut headers, req);
        headers.insert(
            VERSION_HEADER,
            HeaderValue::from_str(&self.version).map_err(axum::http::Error::from)?,
        );
        let token = self.jwt_token()?;
        headers.insert(
            API_REQUEST_HEADER,
            HeaderValue::from_str(&token).map_err(axum::http::Error::from)?,
        );
        *auth_req.headers_mut() = headers;

        Ok(auth_req)
    }

    /// Perform a pre-authorization check against the backend for the given
    /// request. The caller decides what to do with a pass-through response.
    ///
    /// Takes an already-built body-less request (see [`Self::new_request`])
    /// rather than the original client request, so the future returned here
    /// never needs to hold a borrow of the (non-`Sync`) client request
    /// across an await point.
    pub(crate) async fn pre_authorize(
        &self,
        auth_req: Request<Body>,
    ) -> Result<PreAuthOutcome, ApiError> {
        let method = auth_req.method().as_str().to_string();

        let response = self.round_tripper.round_trip(auth_req).await;
        metrics::record_api_request(response.status().as_u16(), &method);

        // May be a legitimate non-capability answer (redirect, 401, ...)
        // rather than a failure: pass it back.
        if response.status() != StatusCode::OK || !valid_response_content_type(&response) {
            return Ok(PreAuthOutcome::PassThrough(
                buffer_pass_through(response).await?,
            ));
        }

        let (parts, body) = response.into_parts();
        let collected = http_body_util::Limited::new(body, CAPABILITY_RESPONSE_LIMIT)
            .collect()
            .await
            .map_err(|e| ApiError::Read(e.to_string()))?;

        let capability: Capability = serde_json::from_slice(&collected.to_bytes())?;

        // Negotiate authentication (Kerberos) may need to return a
        // WWW-Authenticate header to the client even on success.
        let mut auth_headers = HeaderMap::new();
        for value in parts.headers.get_all(header::WWW_AUTHENTICATE) {
            auth_headers.append(header::WWW_AUTHENTICATE, value.clone());
        }

        Ok(PreAuthOutcome::Authorized {
            capability: Box::new(capability),
            auth_headers,
        })
    }
}

/// Buffer a pass-through response body to its hard cap, so the backend
/// worker that produced it is freed as fast as possible.
async fn buffer_pass_through(response: Response<Body>) -> Result<Response<Body>, ApiError> {
    let (parts, body) = response.into_parts();
    let collected = http_body_util::Limited::new(body, FAILURE_RESPONSE_LIMIT)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                ApiError::ResponseTooLarge
            } else {
                ApiError::Read(e.to_string())
            }
        })?;

    let bytes = collected.to_bytes();
    metrics::record_api_failure_bytes(bytes.len() as u64);
    Ok(Response::from_parts(parts, Body::from(bytes)))
}

fn valid_response_content_type(response: &Response<Body>) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| helper::is_content_type(RESPONSE_CONTENT_TYPE, ct))
        .unwrap_or(false)
}

fn join_suffix(path: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return path.to_string();
    }
    match (path.ends_with('/'), suffix.starts_with('/')) {
        (true, true) => format!("{}{}", path, &suffix[1..]),
        (false, false) => format!("{}/{}", path, suffix),
        _ => format!("{}{}", path, suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_joining() {
        assert_eq!(join_suffix("/a/uploads", "/authorize"), "/a/uploads/authorize");
        assert_eq!(join_suffix("/a/uploads/", "/authorize"), "/a/uploads/authorize");
        assert_eq!(join_suffix("/a/uploads", ""), "/a/uploads");
        assert_eq!(join_suffix("/a/uploads", "authorize"), "/a/uploads/authorize");
    }

    #[test]
    fn capability_content_type_check() {
        let resp = Response::builder()
            .header("content-type", "application/vnd.stevedore+json; charset=utf-8")
            .body(Body::empty())
            .unwrap();
        assert!(valid_response_content_type(&resp));

        let resp = Response::builder()
            .header("content-type", "application/json")
            .body(Body::empty())
            .unwrap();
        assert!(!valid_response_content_type(&resp));
    }
}

//! Small HTTP helpers shared across handlers.
//!
//! # Responsibilities
//! - Header hygiene when re-issuing requests to the backend
//! - X-Forwarded-For accumulation
//! - Content-type comparison per RFC 7231 media-type rules
//! - Scrubbing secrets out of URLs before they reach a log line

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::Request;
use regex::Regex;

/// Header used by the edge cache (nginx) to decide whether to buffer our
/// response. Handlers that stream disable it; the fallback proxy re-enables.
pub const RESPONSE_BUFFERING_HEADER: &str = "x-accel-buffering";

/// Hop-by-hop headers, plus body-describing headers that no longer apply
/// once the body has been stripped from the pre-auth request.
const STRIPPED_ON_BODYLESS: &[&str] = &[
    "content-type",
    "content-encoding",
    "content-length",
    "content-disposition",
    "accept-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

/// Remove headers that must not accompany a body-less re-issued request.
pub fn strip_bodyless_headers(headers: &mut HeaderMap) {
    for name in STRIPPED_ON_BODYLESS {
        headers.remove(*name);
    }
}

/// Client IP as recorded by the axum connect-info extension.
pub fn client_ip(req: &Request<Body>) -> Option<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Append the client IP to any inbound X-Forwarded-For list, folding
/// multiple inbound headers into one comma+space separated value.
pub fn set_forwarded_for(headers: &mut HeaderMap, req: &Request<Body>) {
    let Some(client_ip) = client_ip(req) else {
        return;
    };

    let prior: Vec<String> = req
        .headers()
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_owned))
        .collect();

    let value = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Compare an actual `Content-Type` header against an expected media type,
/// ignoring parameters such as charset or boundary.
pub fn is_content_type(expected: &str, actual: &str) -> bool {
    match actual.parse::<mime::Mime>() {
        Ok(parsed) => parsed.essence_str() == expected,
        Err(_) => false,
    }
}

/// True when the request carries the given media type.
pub fn request_has_content_type(req: &Request<Body>, expected: &str) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| is_content_type(expected, ct))
        .unwrap_or(false)
}

/// True for a WebSocket upgrade request (RFC 6455 handshake headers).
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_token = |name: &str, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    has_token("connection", "upgrade") && has_token("upgrade", "websocket")
}

pub fn set_no_cache_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, max-age=0, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Fri, 01 Jan 1990 00:00:00 GMT"),
    );
}

/// A plain-text response with the given status.
pub fn plain_response(status: axum::http::StatusCode, message: &'static str) -> axum::http::Response<Body> {
    let mut response = axum::http::Response::new(Body::from(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Log the error with request context and answer 500.
pub fn fail_500(req: &Request<Body>, err: &dyn std::fmt::Display) -> axum::http::Response<Body> {
    crate::observability::logging::log_error(req, err);
    plain_response(axum::http::StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

pub fn not_found() -> axum::http::Response<Body> {
    plain_response(axum::http::StatusCode::NOT_FOUND, "Not Found")
}

fn scrub_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)([?&](?:(?:private|authenticity|rss)[-_]token|(?:X-AMZ-)?Signature)=)[^&]*")
            .unwrap()
    })
}

/// Replace the value of sensitive query string parameters with `[FILTERED]`.
/// Every URL that may appear in a log line goes through this first.
pub fn scrub_url_params(url: &str) -> String {
    scrub_regex().replace_all(url, "${1}[FILTERED]").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_private_token() {
        let scrubbed = scrub_url_params("http://host/path?private_token=SECRET&page=2");
        assert!(!scrubbed.contains("SECRET"));
        assert_eq!(scrubbed, "http://host/path?private_token=[FILTERED]&page=2");
    }

    #[test]
    fn scrubs_amz_signature_case_insensitive() {
        let scrubbed = scrub_url_params("https://bucket/obj?X-AMZ-Signature=deadbeef&x=1");
        assert_eq!(scrubbed, "https://bucket/obj?X-AMZ-Signature=[FILTERED]&x=1");

        let scrubbed = scrub_url_params("https://bucket/obj?signature=deadbeef");
        assert_eq!(scrubbed, "https://bucket/obj?signature=[FILTERED]");
    }

    #[test]
    fn leaves_ordinary_params_alone() {
        let url = "http://host/?ref=main&path=a%2Fb";
        assert_eq!(scrub_url_params(url), url);
    }

    #[test]
    fn content_type_ignores_parameters() {
        assert!(is_content_type(
            "multipart/form-data",
            "multipart/form-data; boundary=xyz"
        ));
        assert!(!is_content_type("application/json", "text/plain"));
        assert!(!is_content_type("application/json", "not a media type"));
    }

    #[test]
    fn websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.remove("upgrade");
        assert!(!is_websocket_upgrade(&headers));
    }
}

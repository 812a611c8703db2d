//! CI build endpoints: the long-polling job-request handler and the raw
//! trace reader.
//!
//! Long polling parks runner polls on the key watcher instead of a
//! backend worker: only a changed build queue lets the request through.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use http_body_util::BodyExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::api::{pre_auth_handler, ApiClient};
use crate::helper;
use crate::keywatch::{KeyWatcher, WatchOutcome};
use crate::routing::Handler;

/// Runner request bodies are tiny; anything bigger is broken.
const MAX_REGISTER_BODY_SIZE: usize = 32 * 1024;

/// Key prefix the backend bumps when a runner's build queue changes.
const BUILD_QUEUE_PREFIX: &str = "runner:build_queue:";

/// Surfaced to clients and tests: which watch verdict produced this
/// response.
pub const LONG_POLL_HEADER: &str = "stevedore-long-poll";

#[derive(Debug, Default, Deserialize)]
struct RunnerRequest {
    #[serde(default)]
    token: String,
    #[serde(default)]
    last_update: String,
}

/// Wrap the (queue-protected) proxy handler with the long-poll watch.
pub fn register_handler(
    inner: Handler,
    watcher: Option<Arc<KeyWatcher>>,
    poll_duration: Duration,
) -> Handler {
    let Some(watcher) = watcher else {
        return inner;
    };
    if poll_duration.is_zero() {
        return inner;
    }

    Arc::new(move |req: Request<Body>| {
        let inner = inner.clone();
        let watcher = watcher.clone();
        Box::pin(async move { handle_register(inner, watcher, poll_duration, req).await })
    })
}

async fn handle_register(
    inner: Handler,
    watcher: Arc<KeyWatcher>,
    poll_duration: Duration,
    req: Request<Body>,
) -> Response<Body> {
    let (parts, body) = req.into_parts();

    let bytes = match http_body_util::Limited::new(body, MAX_REGISTER_BODY_SIZE)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return helper::plain_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request Entity Too Large",
            );
        }
    };

    let runner = parse_runner_request(
        parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default(),
        &bytes,
    );

    // The eventual proxied request needs the body back regardless.
    let replay = Request::from_parts(parts, Body::from(bytes));

    let (Some(token), Some(last_update)) = (runner.token(), runner.last_update()) else {
        return inner(replay).await;
    };

    let key = format!("{}{}", BUILD_QUEUE_PREFIX, token);
    let outcome = match watcher.watch_key(&key, last_update, poll_duration).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!("long poll: watch key: {}", e);
            return inner(replay).await;
        }
    };

    match outcome {
        // The queue moved: the backend has something to say.
        WatchOutcome::AlreadyChanged | WatchOutcome::SeenChange => {
            let mut response = inner(replay).await;
            set_verdict(&mut response, outcome);
            response
        }
        // Nothing new; spare the backend the round trip.
        WatchOutcome::Timeout | WatchOutcome::NoChange => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NO_CONTENT;
            set_verdict(&mut response, outcome);
            response
        }
    }
}

impl RunnerRequest {
    fn token(&self) -> Option<&str> {
        (!self.token.is_empty()).then_some(self.token.as_str())
    }

    fn last_update(&self) -> Option<&str> {
        (!self.last_update.is_empty()).then_some(self.last_update.as_str())
    }
}

fn parse_runner_request(content_type: &str, body: &[u8]) -> RunnerRequest {
    if helper::is_content_type("application/json", content_type) {
        return serde_json::from_slice(body).unwrap_or_default();
    }

    // Fall back to url-encoded form fields.
    let mut request = RunnerRequest::default();
    for pair in body.split(|b| *b == b'&') {
        let mut kv = pair.splitn(2, |b| *b == b'=');
        let (Some(key), Some(value)) = (kv.next(), kv.next()) else {
            continue;
        };
        match key {
            b"token" => request.token = String::from_utf8_lossy(value).into_owned(),
            b"last_update" => request.last_update = String::from_utf8_lossy(value).into_owned(),
            _ => {}
        }
    }
    request
}

fn set_verdict(response: &mut Response<Body>, outcome: WatchOutcome) {
    let verdict = match outcome {
        WatchOutcome::Timeout => "timeout",
        WatchOutcome::AlreadyChanged => "already-changed",
        WatchOutcome::SeenChange => "seen-change",
        WatchOutcome::NoChange => "no-change",
    };
    response
        .headers_mut()
        .insert(LONG_POLL_HEADER, HeaderValue::from_static(verdict));
}

/// GET handler streaming a build's raw trace file.
pub fn raw_trace(api: Arc<ApiClient>) -> Handler {
    pre_auth_handler(api, "", |req, capability| {
        Box::pin(async move {
            if capability.trace_file.is_empty() {
                return helper::fail_500(&req, &"trace file missing from capability");
            }

            let file = match tokio::fs::File::open(&capability.trace_file).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return helper::not_found();
                }
                Err(e) => return helper::fail_500(&req, &e),
            };

            let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            response
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_runner_requests() {
        let request = parse_runner_request(
            "application/json",
            br#"{"token":"t1","last_update":"u1"}"#,
        );
        assert_eq!(request.token(), Some("t1"));
        assert_eq!(request.last_update(), Some("u1"));
    }

    #[test]
    fn parses_form_runner_requests() {
        let request = parse_runner_request(
            "application/x-www-form-urlencoded",
            b"token=t2&last_update=u2&other=x",
        );
        assert_eq!(request.token(), Some("t2"));
        assert_eq!(request.last_update(), Some("u2"));
    }

    #[test]
    fn missing_fields_disable_the_watch() {
        let request = parse_runner_request("application/json", b"{}");
        assert_eq!(request.token(), None);
        assert_eq!(request.last_update(), None);
    }
}

//! The `git-diff` injector.

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use serde::Deserialize;

use super::command::{command_output_body, git_command};
use crate::helper;
use crate::routing::HandlerFuture;
use crate::senddata::{unpack, InjectContext, Injector};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiffParams {
    #[serde(default)]
    repo_path: String,
    #[serde(default)]
    sha_from: String,
    #[serde(default)]
    sha_to: String,
}

pub struct SendDiff;

impl Injector for SendDiff {
    fn prefix(&self) -> &'static str {
        "git-diff"
    }

    fn inject(&self, ctx: InjectContext, data: String) -> HandlerFuture {
        Box::pin(async move {
            let params: DiffParams = match unpack(&data) {
                Ok(params) => params,
                Err(e) => {
                    tracing::error!("SendDiff: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            tracing::info!(
                from = %params.sha_from,
                to = %params.sha_to,
                path = %ctx.uri.path(),
                "SendDiff: sending"
            );

            let mut cmd = git_command(
                &[],
                &[
                    "--git-dir",
                    &params.repo_path,
                    "diff",
                    &params.sha_from,
                    &params.sha_to,
                ],
            );

            spawn_streaming(&mut cmd, "SendDiff")
        })
    }
}

/// Spawn and stream stdout as text/plain, shared by the diff-shaped
/// injectors.
pub(super) fn spawn_streaming(
    cmd: &mut tokio::process::Command,
    context: &'static str,
) -> Response<Body> {
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("{}: spawn git: {}", context, e);
            return helper::plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
            );
        }
    };

    match command_output_body(child, context) {
        Ok(body) => {
            let mut response = Response::new(body);
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            response
        }
        Err(e) => {
            tracing::error!("{}: {}", context, e);
            helper::plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

//! The `git-snapshot` injector: a raw tar of the repository state.

use axum::http::{header, HeaderValue, Response, StatusCode};
use serde::Deserialize;

use super::command::command_output_body;
use crate::helper;
use crate::routing::HandlerFuture;
use crate::senddata::{unpack, InjectContext, Injector};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnapshotParams {
    #[serde(default)]
    repo_path: String,
}

pub struct SendSnapshot;

impl Injector for SendSnapshot {
    fn prefix(&self) -> &'static str {
        "git-snapshot"
    }

    fn inject(&self, ctx: InjectContext, data: String) -> HandlerFuture {
        Box::pin(async move {
            let params: SnapshotParams = match unpack(&data) {
                Ok(params) => params,
                Err(e) => {
                    tracing::error!("SendSnapshot: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            tracing::info!(repo = %params.repo_path, path = %ctx.uri.path(), "SendSnapshot: sending");

            let mut cmd = tokio::process::Command::new("tar");
            cmd.arg("-c")
                .arg("-C")
                .arg(&params.repo_path)
                .arg("--ignore-failed-read")
                .args(["HEAD", "packed-refs", "refs", "objects"])
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .stdin(std::process::Stdio::null())
                .kill_on_drop(true);

            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!("SendSnapshot: spawn tar: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            let body = match command_output_body(child, "SendSnapshot") {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("SendSnapshot: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            let mut response = Response::new(body);
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_DISPOSITION,
                HeaderValue::from_static("attachment; filename=\"snapshot.tar\""),
            );
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-tar"),
            );
            headers.insert(
                "content-transfer-encoding",
                HeaderValue::from_static("binary"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
            response
        })
    }
}

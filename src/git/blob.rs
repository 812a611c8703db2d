//! The `git-blob` injector: stream one blob by object id.

use axum::http::{header, HeaderValue, Response, StatusCode};
use serde::Deserialize;

use super::command::{command_output_body, git_command, run_for_output};
use crate::helper;
use crate::routing::HandlerFuture;
use crate::senddata::{unpack, InjectContext, Injector};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobParams {
    #[serde(default)]
    repo_path: String,
    #[serde(default)]
    blob_id: String,
}

pub struct SendBlob;

impl Injector for SendBlob {
    fn prefix(&self) -> &'static str {
        "git-blob"
    }

    fn inject(&self, ctx: InjectContext, data: String) -> HandlerFuture {
        Box::pin(async move {
            let params: BlobParams = match unpack(&data) {
                Ok(params) => params,
                Err(e) => {
                    tracing::error!("SendBlob: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            tracing::info!(blob = %params.blob_id, path = %ctx.uri.path(), "SendBlob: sending");

            // The object size first, so the client gets a Content-Length.
            let size_cmd = git_command(
                &[],
                &["--git-dir", &params.repo_path, "cat-file", "-s", &params.blob_id],
            );
            let size = match run_for_output(size_cmd).await {
                Ok(output) => String::from_utf8_lossy(&output).trim().to_string(),
                Err(e) => {
                    tracing::error!("SendBlob: get blob size: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            let mut cat = git_command(
                &[],
                &[
                    "--git-dir",
                    &params.repo_path,
                    "cat-file",
                    "blob",
                    &params.blob_id,
                ],
            );

            let child = match cat.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!("SendBlob: start git cat-file: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            let body = match command_output_body(child, "SendBlob") {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("SendBlob: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            let mut response = Response::new(body);
            if let Ok(value) = HeaderValue::from_str(&size) {
                response.headers_mut().insert(header::CONTENT_LENGTH, value);
            }
            response
        })
    }
}

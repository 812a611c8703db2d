//! The `git-format-patch` injector.

use serde::Deserialize;

use super::command::git_command;
use super::diff::spawn_streaming;
use crate::helper;
use crate::routing::HandlerFuture;
use crate::senddata::{unpack, InjectContext, Injector};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PatchParams {
    #[serde(default)]
    repo_path: String,
    #[serde(default)]
    sha_from: String,
    #[serde(default)]
    sha_to: String,
}

pub struct SendPatch;

impl Injector for SendPatch {
    fn prefix(&self) -> &'static str {
        "git-format-patch"
    }

    fn inject(&self, ctx: InjectContext, data: String) -> HandlerFuture {
        Box::pin(async move {
            let params: PatchParams = match unpack(&data) {
                Ok(params) => params,
                Err(e) => {
                    tracing::error!("SendPatch: {}", e);
                    return helper::plain_response(
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            tracing::info!(
                from = %params.sha_from,
                to = %params.sha_to,
                path = %ctx.uri.path(),
                "SendPatch: sending"
            );

            let range = format!("{}..{}", params.sha_from, params.sha_to);
            let mut cmd = git_command(
                &[],
                &[
                    "--git-dir",
                    &params.repo_path,
                    "format-patch",
                    &range,
                    "--stdout",
                ],
            );

            spawn_streaming(&mut cmd, "SendPatch")
        })
    }
}

//! The `git-show-commit` injector.

use serde::Deserialize;

use super::command::git_command;
use super::diff::spawn_streaming;
use crate::helper;
use crate::routing::HandlerFuture;
use crate::senddata::{unpack, InjectContext, Injector};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ShowParams {
    #[serde(default)]
    repo_path: String,
    #[serde(default)]
    sha: String,
}

pub struct SendCommit;

impl Injector for SendCommit {
    fn prefix(&self) -> &'static str {
        "git-show-commit"
    }

    fn inject(&self, ctx: InjectContext, data: String) -> HandlerFuture {
        Box::pin(async move {
            let params: ShowParams = match unpack(&data) {
                Ok(params) => params,
                Err(e) => {
                    tracing::error!("SendCommit: {}", e);
                    return helper::plain_response(
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            tracing::info!(sha = %params.sha, path = %ctx.uri.path(), "SendCommit: sending");

            let mut cmd = git_command(
                &[],
                &[
                    "--git-dir",
                    &params.repo_path,
                    "show",
                    "-p",
                    "--format=",
                    &params.sha,
                ],
            );

            spawn_streaming(&mut cmd, "SendCommit")
        })
    }
}

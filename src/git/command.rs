//! Git subprocess plumbing.

use std::process::Stdio;

use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::process::{Child, Command};
use tokio_util::io::ReaderStream;

/// Build a git invocation with a scrubbed environment. Capability config
/// options are passed as `-c` pairs ahead of the subcommand.
pub fn git_command(config_options: &[String], args: &[&str]) -> Command {
    let mut cmd = Command::new("git");
    cmd.env_clear();
    for key in ["HOME", "PATH", "LD_LIBRARY_PATH"] {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd.env("GL_PROTOCOL", "http");

    for option in config_options {
        cmd.arg("-c").arg(option);
    }
    cmd.args(args);

    // Git errors would be lost otherwise.
    cmd.stderr(Stdio::inherit());
    cmd.stdout(Stdio::piped());
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

/// Turn a spawned child's stdout into a streaming response body. The child
/// is reaped (and its exit status logged) once the output is drained; a
/// dropped body kills the process group instead.
pub fn command_output_body(mut child: Child, context: &'static str) -> std::io::Result<Body> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout was not piped"))?;

    let tail = futures_util::stream::once(async move {
        match child.wait().await {
            Ok(status) if !status.success() => {
                tracing::error!("{}: git exited with {}", context, status);
            }
            Err(e) => tracing::error!("{}: wait for git: {}", context, e),
            _ => {}
        }
        Ok(Bytes::new())
    });

    Ok(Body::from_stream(ReaderStream::new(stdout).chain(tail)))
}

/// Run a git command to completion and capture stdout. For short outputs
/// (object sizes); streaming paths use [`command_output_body`].
pub async fn run_for_output(mut cmd: Command) -> std::io::Result<Vec<u8>> {
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "git exited with {}",
            output.status
        )));
    }
    Ok(output.stdout)
}

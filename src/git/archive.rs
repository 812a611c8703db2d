//! The `git-archive` injector with a content-addressed disk cache.
//!
//! Cache publishing relies on link(2) being atomic: the archive streams
//! into a uniquely named temp file next to the final path, and a hard
//! link publishes it. A concurrent builder losing the race just sees
//! AlreadyExists and discards its temp file.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;

use super::command::git_command;
use crate::helper;
use crate::observability::metrics;
use crate::routing::HandlerFuture;
use crate::senddata::{unpack, InjectContext, Injector};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveParams {
    #[serde(default)]
    repo_path: String,
    #[serde(default)]
    archive_path: String,
    #[serde(default)]
    archive_prefix: String,
    #[serde(default)]
    commit_id: String,
    #[serde(default)]
    disable_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Zip,
    Tar,
    TarGz,
    TarBz2,
}

impl Format {
    fn git_format(self) -> &'static str {
        match self {
            Format::Zip => "zip",
            Format::Tar | Format::TarBz2 => "tar",
            Format::TarGz => "tar.gz",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Format::Zip => "application/zip",
            _ => "application/octet-stream",
        }
    }
}

/// Derive the archive format from the request basename, as the original
/// URL layout encodes it.
fn parse_basename(basename: &str) -> Option<Format> {
    if basename == "archive" {
        return Some(Format::TarGz);
    }
    for (suffix, format) in [
        (".zip", Format::Zip),
        (".tar.gz", Format::TarGz),
        (".tgz", Format::TarGz),
        (".gz", Format::TarGz),
        (".tar.bz2", Format::TarBz2),
        (".tbz", Format::TarBz2),
        (".tbz2", Format::TarBz2),
        (".tb2", Format::TarBz2),
        (".bz2", Format::TarBz2),
        (".tar", Format::Tar),
    ] {
        if basename.ends_with(suffix) {
            return Some(format);
        }
    }
    None
}

pub struct SendArchive;

impl Injector for SendArchive {
    fn prefix(&self) -> &'static str {
        "git-archive"
    }

    fn inject(&self, ctx: InjectContext, data: String) -> HandlerFuture {
        Box::pin(async move {
            let params: ArchiveParams = match unpack(&data) {
                Ok(params) => params,
                Err(e) => {
                    tracing::error!("SendArchive: {}", e);
                    return error_500();
                }
            };

            let basename = ctx.uri.path().rsplit('/').next().unwrap_or_default();
            let Some(format) = parse_basename(basename) else {
                tracing::error!(path = %ctx.uri.path(), "SendArchive: invalid format");
                return error_500();
            };

            let filename = Path::new(&params.archive_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".to_string());

            let cache_enabled = !params.disable_cache && !params.archive_path.is_empty();

            if cache_enabled {
                if let Ok(file) = tokio::fs::File::open(&params.archive_path).await {
                    metrics::record_archive_cache("hit");
                    return serve_cached(file, format, &filename).await;
                }
                metrics::record_archive_cache("miss");
            }

            stream_archive(&params, format, &filename, cache_enabled).await
        })
    }
}

fn error_500() -> Response<Body> {
    helper::plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

fn archive_headers(response: &mut Response<Body>, format: Format, filename: &str) {
    let headers = response.headers_mut();
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    headers.insert(
        "content-transfer-encoding",
        HeaderValue::from_static("binary"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
}

async fn serve_cached(file: tokio::fs::File, format: Format, filename: &str) -> Response<Body> {
    let size = file.metadata().await.ok().map(|m| m.len());

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    archive_headers(&mut response, format, filename);
    if let Some(size) = size {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    response
}

async fn stream_archive(
    params: &ArchiveParams,
    format: Format,
    filename: &str,
    cache_enabled: bool,
) -> Response<Body> {
    let mut cmd = git_command(
        &[],
        &[
            "--git-dir",
            &params.repo_path,
            "archive",
            "--format",
            format.git_format(),
            "--prefix",
            &params.archive_prefix,
            &params.commit_id,
        ],
    );

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("SendArchive: spawn git archive: {}", e);
            return error_500();
        }
    };

    let Some(stdout) = child.stdout.take() else {
        return error_500();
    };

    // tar.bz2 goes through an external compressor; git only produces tar.
    let mut source: Box<dyn tokio::io::AsyncRead + Send + Unpin> =
        if format == Format::TarBz2 {
            match pipe_through_bzip2(stdout) {
                Ok(reader) => Box::new(reader),
                Err(e) => {
                    tracing::error!("SendArchive: spawn bzip2: {}", e);
                    return error_500();
                }
            }
        } else {
            Box::new(stdout)
        };

    let tempfile = if cache_enabled {
        match prepare_cache_tempfile(&params.archive_path, filename).await {
            Ok(tempfile) => Some(tempfile),
            Err(e) => {
                tracing::error!("SendArchive: create cache tempfile: {}", e);
                return error_500();
            }
        }
    } else {
        None
    };

    // One task drains git, tees into the cache temp file, and feeds the
    // response; the cache link happens only after a clean EOF.
    let archive_path = params.archive_path.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    tokio::spawn(async move {
        let mut cache_file = tempfile;
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if let Some((file, _)) = &mut cache_file {
                        if let Err(e) = file.write_all(&chunk).await {
                            tracing::error!("SendArchive: write cache tempfile: {}", e);
                            cache_file = None;
                        }
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Client went away; stop producing.
                        discard_tempfile(cache_file.take()).await;
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    discard_tempfile(cache_file.take()).await;
                    return;
                }
            }
        }

        match child.wait().await {
            Ok(status) if status.success() => {
                if let Some((mut file, temp_path)) = cache_file.take() {
                    if let Err(e) = file.flush().await {
                        tracing::error!("SendArchive: flush cache tempfile: {}", e);
                    } else if let Err(e) = finalize_cached_archive(&temp_path, &archive_path) {
                        tracing::error!("SendArchive: finalize cached archive: {}", e);
                    }
                    discard_tempfile(Some((file, temp_path))).await;
                }
            }
            Ok(status) => tracing::error!("SendArchive: git archive exited with {}", status),
            Err(e) => tracing::error!("SendArchive: wait for git archive: {}", e),
        }
        discard_tempfile(cache_file.take()).await;
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    archive_headers(&mut response, format, filename);
    response
}

async fn discard_tempfile(tempfile: Option<(tokio::fs::File, PathBuf)>) {
    if let Some((file, path)) = tempfile {
        drop(file);
        let _ = tokio::fs::remove_file(&path).await;
    }
}

fn pipe_through_bzip2(
    stdout: tokio::process::ChildStdout,
) -> std::io::Result<tokio::process::ChildStdout> {
    let mut bzip2 = tokio::process::Command::new("bzip2")
        .arg("-c")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = bzip2
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("bzip2 stdin not piped"))?;
    let compressed = bzip2
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("bzip2 stdout not piped"))?;

    tokio::spawn(async move {
        let mut stdout = stdout;
        if let Err(e) = tokio::io::copy(&mut stdout, &mut stdin).await {
            tracing::error!("SendArchive: feed bzip2: {}", e);
        }
        drop(stdin);
        let _ = bzip2.wait().await;
    });

    Ok(compressed)
}

async fn prepare_cache_tempfile(
    archive_path: &str,
    prefix: &str,
) -> std::io::Result<(tokio::fs::File, PathBuf)> {
    use std::os::unix::fs::DirBuilderExt;

    let dir = Path::new(archive_path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    {
        let dir = dir.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&dir)
        })
        .await
        .map_err(std::io::Error::other)??;
    }

    let temp_path = dir.join(format!("{}.{}.tmp", prefix, uuid::Uuid::new_v4().simple()));
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .await?;

    Ok((file, temp_path))
}

/// Publish the finished temp file. AlreadyExists means a concurrent
/// builder won the race, which is fine.
fn finalize_cached_archive(temp_path: &Path, archive_path: &str) -> std::io::Result<()> {
    match std::fs::hard_link(temp_path, archive_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

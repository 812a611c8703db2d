//! Git smart-HTTP: ref advertisement and the two stateless RPCs.
//!
//! The proxy owns the whole wire session; the backend is only consulted
//! for authorization. Request bodies may arrive gzip-compressed from
//! git clients and are inflated on the way to the subprocess.

use std::process::Stdio;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::io::{StreamReader, SyncIoBridge};

use super::command::{command_output_body, git_command};
use crate::api::{pre_auth_handler, ApiClient, Capability};
use crate::helper;
use crate::routing::Handler;

/// The only way to undo an already-set transfer.hideRefs is a negated
/// pattern.
const GIT_CONFIG_SHOW_ALL_REFS: &str = "transfer.hideRefs=!refs";

const UPLOAD_PACK: &str = "git-upload-pack";
const RECEIVE_PACK: &str = "git-receive-pack";

/// GET `…/info/refs?service=git-…`: the ref advertisement.
pub fn get_info_refs(api: Arc<ApiClient>) -> Handler {
    repo_pre_auth(api, |req, capability| {
        Box::pin(async move { handle_info_refs(req, &capability).await })
    })
}

/// POST `…/git-upload-pack` (fetch/clone).
pub fn upload_pack(api: Arc<ApiClient>) -> Handler {
    post_rpc(api, UPLOAD_PACK)
}

/// POST `…/git-receive-pack` (push).
pub fn receive_pack(api: Arc<ApiClient>) -> Handler {
    post_rpc(api, RECEIVE_PACK)
}

fn post_rpc(api: Arc<ApiClient>, service: &'static str) -> Handler {
    repo_pre_auth(api, move |req, capability| {
        Box::pin(async move { handle_post_rpc(req, &capability, service).await })
    })
}

/// Pre-authorize and require a repository path in the capability.
fn repo_pre_auth<F>(api: Arc<ApiClient>, f: F) -> Handler
where
    F: Fn(Request<Body>, Box<Capability>) -> crate::routing::HandlerFuture
        + Send
        + Sync
        + 'static,
{
    let f = Arc::new(f);
    pre_auth_handler(api, "", move |req, capability| {
        let f = f.clone();
        Box::pin(async move {
            if capability.repo_path.is_empty() {
                return helper::fail_500(&req, &"repository path missing from capability");
            }
            f(req, capability).await
        })
    })
}

fn config_options(capability: &Capability) -> Vec<String> {
    let mut options = capability.git_config_options.clone();
    if capability.show_all_refs {
        options.push(GIT_CONFIG_SHOW_ALL_REFS.to_string());
    }
    options
}

fn sub_command(service: &str) -> &str {
    service.strip_prefix("git-").unwrap_or(service)
}

/// One pkt-line: four hex length digits (including themselves) + payload.
fn pkt_line(payload: &str) -> String {
    format!("{:04x}{}", payload.len() + 4, payload)
}

const PKT_FLUSH: &str = "0000";

async fn handle_info_refs(req: Request<Body>, capability: &Capability) -> Response<Body> {
    let query = req.uri().query().unwrap_or_default();
    let service = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("service="))
        .unwrap_or_default()
        .to_string();

    if service != UPLOAD_PACK && service != RECEIVE_PACK {
        return helper::plain_response(StatusCode::FORBIDDEN, "Unsupported service");
    }

    let mut cmd = git_command(
        &config_options(capability),
        &[
            sub_command(&service),
            "--stateless-rpc",
            "--advertise-refs",
            &capability.repo_path,
        ],
    );

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return helper::fail_500(&req, &format!("spawn {}: {}", service, e)),
    };

    let body = match command_output_body(child, "info-refs") {
        Ok(body) => body,
        Err(e) => return helper::fail_500(&req, &e),
    };

    let banner = format!("{}{}", pkt_line(&format!("# service={}\n", service)), PKT_FLUSH);
    let stream = futures_util::stream::once(async move { Ok::<Bytes, axum::Error>(banner.into()) })
        .chain(body.into_data_stream());

    let mut response = Response::new(Body::from_stream(stream));
    helper::set_no_cache_headers(response.headers_mut());
    let content_type = format!("application/x-{}-advertisement", service);
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_post_rpc(
    req: Request<Body>,
    capability: &Capability,
    service: &'static str,
) -> Response<Body> {
    let mut cmd = git_command(
        &config_options(capability),
        &[
            sub_command(service),
            "--stateless-rpc",
            &capability.repo_path,
        ],
    );
    cmd.stdin(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return helper::fail_500(&req, &format!("spawn {}: {}", service, e)),
    };

    let stdin = match child.stdin.take() {
        Some(stdin) => stdin,
        None => return helper::fail_500(&req, &"stdin was not piped"),
    };

    let gzipped = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    let body = req.into_body();
    tokio::spawn(async move {
        if let Err(e) = feed_stdin(body, stdin, gzipped).await {
            tracing::error!("git rpc: copy request body to git: {}", e);
        }
    });

    let body = match command_output_body(child, "post-rpc") {
        Ok(body) => body,
        Err(e) => {
            let probe = Request::new(Body::empty());
            return helper::fail_500(&probe, &e);
        }
    };

    let mut response = Response::new(body);
    helper::set_no_cache_headers(response.headers_mut());
    let content_type = format!("application/x-{}-result", service);
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
        .headers_mut()
        .insert(helper::RESPONSE_BUFFERING_HEADER, HeaderValue::from_static("no"));
    response
}

/// Pump the request body into git's stdin, inflating gzip if the client
/// compressed it. Closing stdin signals EOF to the subprocess.
async fn feed_stdin(
    body: Body,
    mut stdin: tokio::process::ChildStdin,
    gzipped: bool,
) -> std::io::Result<()> {
    let stream = body.into_data_stream().map_err(std::io::Error::other);

    if gzipped {
        // Inflate on a blocking thread, streaming end to end.
        let reader = SyncIoBridge::new(StreamReader::new(stream));
        let mut writer = SyncIoBridge::new(stdin);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut decoder = flate2::read::GzDecoder::new(reader);
            std::io::copy(&mut decoder, &mut writer)?;
            writer.shutdown()
        })
        .await
        .map_err(std::io::Error::other)??;
    } else {
        let mut reader = StreamReader::new(stream);
        tokio::io::copy(&mut reader, &mut stdin).await?;
        stdin.shutdown().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkt_line_encoding() {
        assert_eq!(pkt_line("# service=git-upload-pack\n"), "001e# service=git-upload-pack\n");
        assert_eq!(pkt_line(""), "0004");
    }

    #[test]
    fn sub_command_strips_prefix() {
        assert_eq!(sub_command("git-upload-pack"), "upload-pack");
        assert_eq!(sub_command("upload-pack"), "upload-pack");
    }

    #[test]
    fn show_all_refs_appends_negated_hide_refs() {
        let capability = Capability {
            show_all_refs: true,
            git_config_options: vec!["receive.maxInputSize=1".to_string()],
            ..Capability::default()
        };
        let options = config_options(&capability);
        assert_eq!(options, vec![
            "receive.maxInputSize=1".to_string(),
            GIT_CONFIG_SHOW_ALL_REFS.to_string(),
        ]);
    }
}

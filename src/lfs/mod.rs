//! LFS object uploads.
//!
//! The client PUTs the raw object body; the proxy streams it to a temp
//! file while computing sha256, verifies size and oid against the
//! capability, then forwards a body-less request whose header points the
//! backend at the stored temp file.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response};
use futures_util::TryStreamExt;

use crate::api::{pre_auth_handler, ApiClient, Capability};
use crate::filestore::{self, LocalTarget, SaveFileOpts};
use crate::helper;
use crate::routing::Handler;

/// Header carrying the temp file basename to the backend.
pub const LFS_TMP_HEADER: &str = "x-stevedore-lfs-tmp";

/// PUT handler for `…/stevedore-lfs/objects/<oid>/<size>`.
pub fn put_store(api: Arc<ApiClient>, forward: Handler, client: reqwest::Client) -> Handler {
    pre_auth_handler(api, "/authorize", move |req, capability| {
        let forward = forward.clone();
        let client = client.clone();
        Box::pin(async move { handle_store_lfs_object(client, forward, req, &capability).await })
    })
}

async fn handle_store_lfs_object(
    client: reqwest::Client,
    forward: Handler,
    req: Request<Body>,
    capability: &Capability,
) -> Response<Body> {
    if capability.temp_path.is_empty() {
        return helper::fail_500(&req, &"temp path missing from capability");
    }
    if capability.lfs_oid.is_empty() {
        return helper::fail_500(&req, &"LFS oid missing from capability");
    }

    let local = LocalTarget {
        dir: PathBuf::from(&capability.temp_path),
        filename: format!("{}-{}", capability.lfs_oid, uuid::Uuid::new_v4().simple()),
        own_dir: false,
    };
    let opts = match SaveFileOpts::from_capability(capability, Some(local)) {
        Ok(opts) => opts,
        Err(e) => return helper::fail_500(&req, &e),
    };

    let (mut parts, body) = req.into_parts();
    let stream = body.into_data_stream().map_err(std::io::Error::other);

    let (handler, cleanup) =
        match filestore::save_file(&client, &opts, stream, Some(capability.lfs_size)).await {
            Ok(result) => result,
            Err(e) => {
                let probe = Request::from_parts(parts, Body::empty());
                return helper::fail_500(&probe, &e);
            }
        };

    if handler.size != capability.lfs_size {
        let probe = Request::from_parts(parts, Body::empty());
        let response = helper::fail_500(
            &probe,
            &format!("expected size {}, wrote {}", capability.lfs_size, handler.size),
        );
        cleanup.run().await;
        return response;
    }

    let sha256 = handler.hashes.get("sha256").map(String::as_str).unwrap_or("");
    if sha256 != capability.lfs_oid {
        let probe = Request::from_parts(parts, Body::empty());
        let response = helper::fail_500(
            &probe,
            &format!("expected sha256 {}, got {}", capability.lfs_oid, sha256),
        );
        cleanup.run().await;
        return response;
    }

    let basename = handler
        .local_path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // The backend only needs to know where the verified object landed.
    if let Ok(value) = HeaderValue::from_str(&basename) {
        parts.headers.insert(LFS_TMP_HEADER, value);
    }
    parts.headers.remove(header::CONTENT_LENGTH);
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));

    let proxied = Request::from_parts(parts, Body::empty());
    let response = forward(proxied).await;

    cleanup.run().await;
    response
}

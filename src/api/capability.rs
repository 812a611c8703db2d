//! The capability record returned by backend pre-authorization.
//!
//! Unset fields mean "feature not enabled for this request". Each handler
//! validates the fields it needs at entry and builds its own narrower view
//! (see `filestore::SaveFileOpts`, `channel::TerminalSettings`).

use std::collections::HashMap;

use serde::Deserialize;

/// Custom content type for backend capability responses, to catch routing
/// and programming mistakes.
pub const RESPONSE_CONTENT_TYPE: &str = "application/vnd.stevedore+json";

/// Presigned URLs for an S3-style multipart upload.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MultipartUploadParams {
    /// Exact size of each uploaded part. Only the last one can be smaller.
    #[serde(default)]
    pub part_size: u64,
    /// Presigned URL for each part, in part-number order.
    #[serde(default, rename = "PartURLs")]
    pub part_urls: Vec<String>,
    /// Presigned URL for CompleteMultipartUpload.
    #[serde(default, rename = "CompleteURL")]
    pub complete_url: String,
    /// Presigned URL for AbortMultipartUpload.
    #[serde(default, rename = "AbortURL")]
    pub abort_url: String,
}

/// A remote object-storage destination.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteObject {
    /// Unique identifier of the object storage upload.
    #[serde(default, rename = "ID")]
    pub id: String,
    /// GetObject URL for the stored object.
    #[serde(default, rename = "GetURL")]
    pub get_url: String,
    /// Presigned PutObject URL for a single-shot store.
    #[serde(default, rename = "StoreURL")]
    pub store_url: String,
    /// Presigned RemoveObject URL.
    #[serde(default, rename = "DeleteURL")]
    pub delete_url: String,
    /// Upload timeout in seconds. 0 means the uploader default.
    #[serde(default)]
    pub timeout: u64,
    /// Whether to use the headers in `put_headers` verbatim.
    #[serde(default)]
    pub custom_put_headers: bool,
    /// HTTP headers to send with the store URL PUT.
    #[serde(default)]
    pub put_headers: HashMap<String, String>,
    /// Presigned URLs for an S3-style multipart upload.
    #[serde(default)]
    pub multipart_upload: Option<MultipartUploadParams>,
}

/// Terminal session details for the WebSocket bridge.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TerminalSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub subprotocols: Vec<String>,
    /// Headers (typically Authorization) presented to the upstream.
    #[serde(default)]
    pub header: HashMap<String, String>,
    /// PEM bundle used to verify the upstream TLS certificate.
    #[serde(default, rename = "CAPem")]
    pub ca_pem: String,
    /// Hard session limit in seconds; 0 means unlimited.
    #[serde(default)]
    pub max_session_time: u64,
}

/// What the backend authorized the proxy to do for one request.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Capability {
    /// Directory for temporary upload files.
    #[serde(default)]
    pub temp_path: String,

    /// Remote object-storage destination for uploads.
    #[serde(default)]
    pub remote_object: RemoteObject,

    /// Full path on disk to the Git repository the request is about.
    #[serde(default)]
    pub repo_path: String,

    /// Extra `-c` options for spawned git commands.
    #[serde(default)]
    pub git_config_options: Vec<String>,

    /// LFS object id (sha256) and expected size.
    #[serde(default)]
    pub lfs_oid: String,
    #[serde(default)]
    pub lfs_size: u64,

    /// Saved artifacts archive and an entry inside it.
    #[serde(default, rename = "archive")]
    pub archive: String,
    #[serde(default, rename = "entry")]
    pub entry: String,

    /// CI build trace file on disk.
    #[serde(default)]
    pub trace_file: String,

    /// Terminal session details.
    #[serde(default)]
    pub terminal: Option<TerminalSettings>,

    /// For git-http: may the requester see all refs?
    #[serde(default)]
    pub show_all_refs: bool,
}

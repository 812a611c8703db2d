//! Dual-write upload pipeline.
//!
//! `save_file` streams one inbound file simultaneously to an optional
//! local temp file and an optional remote object store while computing the
//! full digest set in the same pass. The inbound read does not advance
//! until every sink has consumed the chunk.
//!
//! Every save returns a cleanup chain the handler must let run on all
//! exit paths: it removes local temp state and issues the remote delete
//! (or abort, for an unfinished multipart upload).

pub mod multi_hash;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::api::Capability;
use crate::objectstore::multipart::{start_multipart, MultipartTarget};
use crate::objectstore::single::{start_single_put, PutHeaders};
use crate::objectstore::{self, ObjectStoreError, DEFAULT_UPLOAD_TIMEOUT};

pub use multi_hash::MultiHash;

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("capability names no storage target")]
    NoStorageTarget,
    #[error("multipart parameters invalid: part size is zero")]
    ZeroPartSize,
    #[error("create temp file: {0}")]
    TempFile(std::io::Error),
    #[error("write local copy: {0}")]
    LocalWrite(std::io::Error),
    #[error("read upload stream: {0}")]
    Read(String),
    #[error(transparent)]
    Remote(#[from] ObjectStoreError),
}

/// Local destination for one file.
#[derive(Debug, Clone)]
pub struct LocalTarget {
    /// Directory the file lands in. Created 0700 when missing.
    pub dir: PathBuf,
    /// File name inside `dir`. Created 0600, must not pre-exist.
    pub filename: String,
    /// Whether the cleanup chain owns the whole directory or just the file.
    pub own_dir: bool,
}

/// Remote destination for one file.
#[derive(Debug, Clone)]
pub enum RemoteTarget {
    SinglePut {
        store_url: String,
        headers: PutHeaders,
    },
    Multipart(MultipartTarget),
}

/// Storage targets for one upload, built from the flat capability record
/// at handler entry. At least one side must be present.
#[derive(Debug, Clone)]
pub struct SaveFileOpts {
    pub local: Option<LocalTarget>,
    pub remote: Option<RemoteTarget>,
    pub remote_id: String,
    pub remote_url: String,
    pub delete_url: String,
    pub timeout: Duration,
}

impl SaveFileOpts {
    /// Narrow the capability to this upload's storage targets.
    ///
    /// `local` overrides where a local copy goes; pass `None` to use the
    /// capability temp path directly.
    pub fn from_capability(
        capability: &Capability,
        local: Option<LocalTarget>,
    ) -> Result<Self, FileStoreError> {
        let remote_object = &capability.remote_object;

        let local = match local {
            Some(target) => Some(target),
            None if !capability.temp_path.is_empty() => Some(LocalTarget {
                dir: PathBuf::from(&capability.temp_path),
                filename: format!("upload-{}", uuid::Uuid::new_v4()),
                own_dir: false,
            }),
            None => None,
        };

        let remote = if let Some(multi) = &remote_object.multipart_upload {
            if multi.part_size == 0 {
                return Err(FileStoreError::ZeroPartSize);
            }
            Some(RemoteTarget::Multipart(MultipartTarget {
                part_size: multi.part_size,
                part_urls: multi.part_urls.clone(),
                complete_url: multi.complete_url.clone(),
                abort_url: multi.abort_url.clone(),
            }))
        } else if !remote_object.store_url.is_empty() {
            let headers = if remote_object.custom_put_headers {
                PutHeaders::Custom(
                    remote_object
                        .put_headers
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            } else {
                PutHeaders::Default
            };
            Some(RemoteTarget::SinglePut {
                store_url: remote_object.store_url.clone(),
                headers,
            })
        } else {
            None
        };

        if local.is_none() && remote.is_none() {
            return Err(FileStoreError::NoStorageTarget);
        }

        let timeout = if remote_object.timeout > 0 {
            Duration::from_secs(remote_object.timeout)
        } else {
            DEFAULT_UPLOAD_TIMEOUT
        };

        Ok(Self {
            local,
            remote,
            remote_id: remote_object.id.clone(),
            remote_url: remote_object.get_url.clone(),
            delete_url: remote_object.delete_url.clone(),
            timeout,
        })
    }

    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }
}

/// Where one uploaded file ended up.
#[derive(Debug, Default)]
pub struct FileHandler {
    pub local_path: Option<PathBuf>,
    pub remote_id: String,
    pub remote_url: String,
    pub size: u64,
    pub hashes: HashMap<String, String>,
}

#[derive(Debug)]
enum CleanupPath {
    File(PathBuf),
    Dir(PathBuf),
}

/// Deferred cleanup for one saved file. Runs exactly once: either via
/// [`run`](Cleanup::run) or, if the handler bails without calling it,
/// from Drop on a background task.
#[derive(Debug)]
pub struct Cleanup {
    client: reqwest::Client,
    paths: Vec<CleanupPath>,
    delete_url: String,
    abort_url: String,
    remote_completed: Option<Arc<AtomicBool>>,
    armed: bool,
}

impl Cleanup {
    fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            paths: Vec::new(),
            delete_url: String::new(),
            abort_url: String::new(),
            remote_completed: None,
            armed: true,
        }
    }

    /// Remove local temp state and release the remote object.
    pub async fn run(mut self) {
        self.armed = false;
        let work = self.take_work();
        work.execute().await;
    }

    fn take_work(&mut self) -> CleanupWork {
        CleanupWork {
            client: self.client.clone(),
            paths: std::mem::take(&mut self.paths),
            delete_url: std::mem::take(&mut self.delete_url),
            abort_url: std::mem::take(&mut self.abort_url),
            remote_completed: self.remote_completed.take(),
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let work = self.take_work();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    work.execute().await;
                });
            }
            // No runtime left: remove local state synchronously and let
            // the object store expire the orphan.
            Err(_) => {
                for path in &work.paths {
                    let _ = match path {
                        CleanupPath::File(p) => std::fs::remove_file(p),
                        CleanupPath::Dir(p) => std::fs::remove_dir_all(p),
                    };
                }
            }
        }
    }
}

struct CleanupWork {
    client: reqwest::Client,
    paths: Vec<CleanupPath>,
    delete_url: String,
    abort_url: String,
    remote_completed: Option<Arc<AtomicBool>>,
}

impl CleanupWork {
    async fn execute(self) {
        for path in &self.paths {
            let result = match path {
                CleanupPath::File(p) => tokio::fs::remove_file(p).await,
                CleanupPath::Dir(p) => tokio::fs::remove_dir_all(p).await,
            };
            if let Err(e) = result {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("cleanup: remove temp path: {}", e);
                }
            }
        }

        let completed = self
            .remote_completed
            .as_ref()
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false);

        // An unfinished multipart upload is aborted; a finished object is
        // released with its delete URL once the backend is done with it.
        if !completed && !self.abort_url.is_empty() {
            objectstore::issue_delete(&self.client, &self.abort_url).await;
        }
        objectstore::issue_delete(&self.client, &self.delete_url).await;
    }
}

/// Stream `body` into every configured sink. Returns the file handle and
/// the cleanup chain; the handler must let the cleanup run on every exit.
pub async fn save_file<S, E>(
    client: &reqwest::Client,
    opts: &SaveFileOpts,
    mut body: S,
    known_size: Option<u64>,
) -> Result<(FileHandler, Cleanup), FileStoreError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut cleanup = Cleanup::new(client.clone());
    cleanup.delete_url = opts.delete_url.clone();

    let mut handler = FileHandler {
        remote_id: opts.remote_id.clone(),
        remote_url: opts.remote_url.clone(),
        ..FileHandler::default()
    };

    let mut local_file = match &opts.local {
        Some(target) => {
            let (file, path) = open_local_file(target).await?;
            if target.own_dir {
                cleanup.paths.push(CleanupPath::Dir(target.dir.clone()));
            } else {
                cleanup.paths.push(CleanupPath::File(path.clone()));
            }
            handler.local_path = Some(path);
            Some(file)
        }
        None => None,
    };

    let mut remote = match &opts.remote {
        Some(RemoteTarget::SinglePut { store_url, headers }) => {
            let uploader = start_single_put(
                client.clone(),
                store_url.clone(),
                headers.clone(),
                known_size,
                opts.timeout,
            );
            cleanup.remote_completed = Some(uploader.completed_flag());
            Some(uploader)
        }
        Some(RemoteTarget::Multipart(target)) => {
            let uploader = start_multipart(client.clone(), target.clone(), opts.timeout);
            cleanup.abort_url = target.abort_url.clone();
            cleanup.remote_completed = Some(uploader.completed_flag());
            Some(uploader)
        }
        None => None,
    };

    let mut hashes = MultiHash::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| FileStoreError::Read(e.to_string()))?;
        if chunk.is_empty() {
            continue;
        }

        hashes.update(&chunk);
        if let Some(file) = &mut local_file {
            file.write_all(&chunk)
                .await
                .map_err(FileStoreError::LocalWrite)?;
        }
        if let Some(uploader) = &mut remote {
            uploader.write(chunk.clone()).await?;
        }
        handler.size += chunk.len() as u64;
    }

    if let Some(mut file) = local_file.take() {
        file.flush().await.map_err(FileStoreError::LocalWrite)?;
    }
    if let Some(uploader) = remote.take() {
        uploader.close().await?;
    }

    handler.hashes = hashes.finish();
    Ok((handler, cleanup))
}

async fn open_local_file(
    target: &LocalTarget,
) -> Result<(tokio::fs::File, PathBuf), FileStoreError> {
    use std::os::unix::fs::DirBuilderExt;

    let dir = target.dir.clone();
    tokio::task::spawn_blocking(move || {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
    })
    .await
    .map_err(|e| FileStoreError::TempFile(std::io::Error::other(e)))?
    .map_err(FileStoreError::TempFile)?;

    let path = target.dir.join(&target.filename);
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .await
        .map_err(FileStoreError::TempFile)?;

    Ok((file, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn body(chunks: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
    }

    fn local_opts(dir: PathBuf) -> SaveFileOpts {
        SaveFileOpts {
            local: Some(LocalTarget {
                dir,
                filename: "upload".to_string(),
                own_dir: true,
            }),
            remote: None,
            remote_id: String::new(),
            remote_url: String::new(),
            delete_url: String::new(),
            timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }

    #[tokio::test]
    async fn local_only_save_writes_file_and_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("multipart-x");
        let opts = local_opts(dir.clone());
        let client = reqwest::Client::new();

        let (handler, cleanup) = save_file(&client, &opts, body(&[b"he", b"llo"]), None)
            .await
            .unwrap();

        assert_eq!(handler.size, 5);
        let path = handler.local_path.clone().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert_eq!(handler.hashes["md5"], "5d41402abc4b2a76b9719d911017c592");

        cleanup.run().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn file_permissions_are_restrictive() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("multipart-y");
        let opts = local_opts(dir.clone());
        let client = reqwest::Client::new();

        let (handler, cleanup) = save_file(&client, &opts, body(&[b"x"]), None)
            .await
            .unwrap();

        let mode = std::fs::metadata(handler.local_path.as_ref().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let dir_mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        cleanup.run().await;
    }

    #[tokio::test]
    async fn capability_without_targets_is_rejected() {
        let capability = Capability::default();
        let err = SaveFileOpts::from_capability(&capability, None).unwrap_err();
        assert!(matches!(err, FileStoreError::NoStorageTarget));
    }

    #[tokio::test]
    async fn zero_part_size_is_rejected() {
        let mut capability = Capability::default();
        capability.temp_path = "/tmp".to_string();
        capability.remote_object.multipart_upload =
            Some(crate::api::MultipartUploadParams::default());

        let err = SaveFileOpts::from_capability(&capability, None).unwrap_err();
        assert!(matches!(err, FileStoreError::ZeroPartSize));
    }
}

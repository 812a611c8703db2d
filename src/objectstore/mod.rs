//! Object storage uploaders.
//!
//! Two variants behind one write/close surface: a single presigned PUT and
//! an S3-style multipart upload. Callers stream chunks in; a background
//! task owns the outbound HTTP transfer. Parts of a multipart upload are
//! sent strictly in numeric order and the CompleteMultipartUpload document
//! is only posted once the last ETag is known.

pub mod multipart;
pub mod single;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::helper;

/// Upload timeout applied when the capability carries none.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(360);

/// Chunks buffered between the request reader and the uploader task.
const UPLOAD_CHANNEL_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("{method} request {url} returned: {status}")]
    StatusCode {
        method: &'static str,
        url: String,
        status: u16,
    },
    #[error("more data than part count x part size")]
    NotEnoughParts,
    #[error("object store request: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("part buffer io: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload timed out")]
    Timeout,
    #[error("uploader task aborted")]
    Aborted,
}

/// Streaming handle to an in-flight object upload.
///
/// Dropping the handle without calling [`close`](Self::close) aborts the
/// transfer; the caller's cleanup chain is responsible for the remote
/// delete or abort call afterwards.
pub struct ObjectUploader {
    tx: Option<mpsc::Sender<Bytes>>,
    task: Option<JoinHandle<Result<(), ObjectStoreError>>>,
    completed: Arc<AtomicBool>,
}

impl ObjectUploader {
    fn new(
        tx: mpsc::Sender<Bytes>,
        task: JoinHandle<Result<(), ObjectStoreError>>,
        completed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tx: Some(tx),
            task: Some(task),
            completed,
        }
    }

    /// Flag flipped by the uploader task once the remote transfer has
    /// fully succeeded. Shared with the cleanup chain.
    pub fn completed_flag(&self) -> Arc<AtomicBool> {
        self.completed.clone()
    }

    /// Feed one chunk to the transfer. The send suspends while the
    /// uploader is busy, which is what keeps the inbound read paced.
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), ObjectStoreError> {
        let Some(tx) = &self.tx else {
            return Err(ObjectStoreError::Aborted);
        };
        tx.send(chunk).await.map_err(|_| ObjectStoreError::Aborted)
    }

    /// Signal EOF and wait for the transfer to finish.
    pub async fn close(mut self) -> Result<(), ObjectStoreError> {
        self.tx = None;
        let Some(task) = self.task.take() else {
            return Err(ObjectStoreError::Aborted);
        };
        match task.await {
            Ok(result) => result,
            Err(_) => Err(ObjectStoreError::Aborted),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl Drop for ObjectUploader {
    fn drop(&mut self) {
        // A handle dropped before close() means the caller bailed out
        // mid-stream; finishing the PUT would store a truncated object.
        if self.tx.is_some() {
            if let Some(task) = &self.task {
                task.abort();
            }
        }
    }
}

fn upload_channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    mpsc::channel(UPLOAD_CHANNEL_DEPTH)
}

/// Fire a DELETE against a presigned URL, logging failures. Used for both
/// RemoveObject and AbortMultipartUpload cleanup calls.
pub async fn issue_delete(client: &reqwest::Client, url: &str) {
    if url.is_empty() {
        return;
    }

    match client.delete(url).send().await {
        Ok(response) if !response.status().is_success() => {
            tracing::warn!(
                object = %helper::scrub_url_params(url),
                status = response.status().as_u16(),
                "object store delete refused"
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(object = %helper::scrub_url_params(url), "object store delete failed: {}", e);
        }
    }
}

/// Strip the double quotes S3 puts around ETag header values.
fn trim_etag(raw: &str) -> String {
    raw.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_quotes_are_stripped() {
        assert_eq!(trim_etag("\"d41d8cd9\""), "d41d8cd9");
        assert_eq!(trim_etag("d41d8cd9"), "d41d8cd9");
    }
}

//! S3-style multipart upload against presigned part URLs.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use super::{trim_etag, upload_channel, ObjectStoreError, ObjectUploader};
use crate::helper;
use crate::observability::metrics;

/// Presigned URL set for one multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartTarget {
    pub part_size: u64,
    pub part_urls: Vec<String>,
    pub complete_url: String,
    pub abort_url: String,
}

/// Start a multipart upload. Incoming bytes are buffered to a scratch file
/// up to `part_size` at a time, each chunk is PUT to its part URL in
/// order, and the complete document is posted after EOF.
pub fn start_multipart(
    client: reqwest::Client,
    target: MultipartTarget,
    timeout: Duration,
) -> ObjectUploader {
    let (tx, rx) = upload_channel();
    let completed = Arc::new(AtomicBool::new(false));
    let completed_task = completed.clone();

    metrics::object_storage_open(1);
    let task = tokio::spawn(async move {
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, run(&client, &target, rx)).await;
        metrics::object_storage_open(-1);
        metrics::record_object_storage_time(started);

        match result {
            Ok(Ok(())) => {
                completed_task.store(true, Ordering::Release);
                metrics::record_object_storage("succeeded");
                Ok(())
            }
            Ok(Err(e)) => {
                metrics::record_object_storage(match e {
                    ObjectStoreError::NotEnoughParts => "not-enough-parts",
                    ObjectStoreError::StatusCode { .. } => "invalid-status",
                    _ => "request-failed",
                });
                super::issue_delete(&client, &target.abort_url).await;
                Err(e)
            }
            Err(_) => {
                metrics::record_object_storage("request-failed");
                super::issue_delete(&client, &target.abort_url).await;
                Err(ObjectStoreError::Timeout)
            }
        }
    });

    ObjectUploader::new(tx, task, completed)
}

async fn run(
    client: &reqwest::Client,
    target: &MultipartTarget,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<(), ObjectStoreError> {
    let scratch_dir = tempfile::tempdir()?;
    let scratch = scratch_dir.path().join("part-buffer");

    let mut leftover: Option<Bytes> = None;
    let mut etags: Vec<String> = Vec::new();

    for part_url in &target.part_urls {
        let n = fill_scratch(&scratch, &mut rx, &mut leftover, target.part_size).await?;
        if n == 0 {
            break;
        }

        let etag = put_part(client, part_url, &scratch, n).await?;
        metrics::record_object_storage_bytes(n);
        etags.push(etag);
    }

    // Anything left after the last part URL means the body was bigger
    // than the presigned URLs can carry.
    if leftover.is_some() || rx.recv().await.is_some() {
        return Err(ObjectStoreError::NotEnoughParts);
    }

    complete(client, &target.complete_url, &etags).await
}

/// Copy up to `limit` bytes from the channel into the scratch file,
/// truncating it first. Returns the number of bytes written; a surplus
/// tail of the last chunk is handed back through `leftover`.
async fn fill_scratch(
    path: &Path,
    rx: &mut mpsc::Receiver<Bytes>,
    leftover: &mut Option<Bytes>,
    limit: u64,
) -> Result<u64, ObjectStoreError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written: u64 = 0;

    loop {
        let mut chunk = match leftover.take() {
            Some(chunk) => chunk,
            None => match rx.recv().await {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let room = limit - written;
        if (chunk.len() as u64) > room {
            *leftover = Some(chunk.split_off(room as usize));
        }

        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if written == limit {
            break;
        }
    }

    file.flush().await?;
    Ok(written)
}

async fn put_part(
    client: &reqwest::Client,
    url: &str,
    scratch: &Path,
    size: u64,
) -> Result<String, ObjectStoreError> {
    let file = tokio::fs::File::open(scratch).await?;
    let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

    let response = client
        .put(url)
        .header(reqwest::header::CONTENT_LENGTH, size)
        .body(body)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(ObjectStoreError::StatusCode {
            method: "PUT",
            url: helper::scrub_url_params(url),
            status: response.status().as_u16(),
        });
    }

    let etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(trim_etag)
        .unwrap_or_default();

    Ok(etag)
}

async fn complete(
    client: &reqwest::Client,
    url: &str,
    etags: &[String],
) -> Result<(), ObjectStoreError> {
    let body = complete_document(etags);

    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/xml")
        .header(reqwest::header::CONTENT_LENGTH, body.len())
        .body(body)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(ObjectStoreError::StatusCode {
            method: "POST",
            url: helper::scrub_url_params(url),
            status: response.status().as_u16(),
        });
    }

    Ok(())
}

/// Render the CompleteMultipartUpload document, parts in numeric order.
fn complete_document(etags: &[String]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for (i, etag) in etags.iter().enumerate() {
        let _ = write!(
            xml,
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            i + 1,
            etag
        );
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_document_orders_parts() {
        let xml = complete_document(&["aa".to_string(), "bb".to_string()]);
        assert_eq!(
            xml,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>aa</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>bb</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[tokio::test]
    async fn fill_scratch_splits_oversized_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part");
        let (tx, mut rx) = mpsc::channel(4);

        tx.send(Bytes::from_static(b"abcdefgh")).await.unwrap();
        drop(tx);

        let mut leftover = None;
        let n = fill_scratch(&path, &mut rx, &mut leftover, 5).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcde");
        assert_eq!(leftover.as_deref(), Some(&b"fgh"[..]));

        let n = fill_scratch(&path, &mut rx, &mut leftover, 5).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(std::fs::read(&path).unwrap(), b"fgh");
        assert!(leftover.is_none());

        let n = fill_scratch(&path, &mut rx, &mut leftover, 5).await.unwrap();
        assert_eq!(n, 0);
    }
}

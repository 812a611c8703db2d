//! Single-object presigned PUT.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::{upload_channel, ObjectStoreError, ObjectUploader};
use crate::helper;
use crate::observability::metrics;

/// Headers sent with the PUT. Either the capability's custom set or the
/// default octet-stream content type.
#[derive(Debug, Clone)]
pub enum PutHeaders {
    Default,
    Custom(Vec<(String, String)>),
}

/// Start a streaming PUT to a presigned URL. The declared size, when
/// known, becomes the Content-Length; otherwise the transfer is chunked.
pub fn start_single_put(
    client: reqwest::Client,
    url: String,
    headers: PutHeaders,
    size: Option<u64>,
    timeout: Duration,
) -> ObjectUploader {
    let (tx, rx) = upload_channel();
    let completed = Arc::new(AtomicBool::new(false));
    let completed_task = completed.clone();

    metrics::object_storage_open(1);
    let task = tokio::spawn(async move {
        let started = Instant::now();
        let result =
            tokio::time::timeout(timeout, put_object(client, &url, headers, size, rx)).await;
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
                    ObjectStoreError::StatusCode { .. } => "invalid-status",
                    _ => "request-failed",
                });
                Err(e)
            }
            Err(_) => {
                metrics::record_object_storage("request-failed");
                Err(ObjectStoreError::Timeout)
            }
        }
    });

    ObjectUploader::new(tx, task, completed)
}

async fn put_object(
    client: reqwest::Client,
    url: &str,
    headers: PutHeaders,
    size: Option<u64>,
    rx: tokio::sync::mpsc::Receiver<Bytes>,
) -> Result<(), ObjectStoreError> {
    let sent = Arc::new(AtomicU64::new(0));
    let counting = sent.clone();
    let stream = ReceiverStream::new(rx).map(move |chunk| {
        counting.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok::<Bytes, std::io::Error>(chunk)
    });

    let mut request = client.put(url).body(reqwest::Body::wrap_stream(stream));

    match headers {
        PutHeaders::Default => {
            request = request.header(reqwest::header::CONTENT_TYPE, "application/octet-stream");
        }
        PutHeaders::Custom(pairs) => {
            for (name, value) in pairs {
                request = request.header(name, value);
            }
        }
    }

    if let Some(size) = size {
        request = request.header(reqwest::header::CONTENT_LENGTH, size);
    }

    let response = request.send().await?;
    metrics::record_object_storage_bytes(sent.load(Ordering::Relaxed));

    if !response.status().is_success() {
        return Err(ObjectStoreError::StatusCode {
            method: "PUT",
            url: helper::scrub_url_params(url),
            status: response.status().as_u16(),
        });
    }

    Ok(())
}

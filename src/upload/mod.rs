//! Upload acceleration.
//!
//! The proxy intercepts `multipart/form-data` bodies on accelerated
//! routes: file parts are persisted (locally and/or to object storage)
//! while they stream in, and the backend receives a rewritten form that
//! carries only metadata fields. The backend worker never touches file
//! bytes.

pub mod form;
pub mod rewrite;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response};
use bytes::Bytes;
use futures_util::StreamExt;

use crate::api::{pre_auth_handler, ApiClient, Capability};
use crate::filestore::{FileHandler, FileStoreError};
use crate::helper;
use crate::routing::Handler;

pub use form::FormWriter;
pub use rewrite::{rewrite_form, CleanupChain, RewrittenForm};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("illegal filename: {0:?}")]
    IllegalFilename(String),
    #[error("illegal form field: {0:?}")]
    IllegalField(String),
    #[error("parse multipart form: {0}")]
    Malformed(#[from] multer::Error),
    #[error(transparent)]
    Storage(#[from] FileStoreError),
}

/// Policy object deciding what a rewritten form may contain. One instance
/// per request.
pub trait FormProcessor: Send {
    /// Short name used as the metrics label for this upload kind.
    fn name(&self) -> &'static str;

    /// Offered every non-file field (already copied through).
    fn process_field(&mut self, name: &str, value: &str) -> Result<(), UploadError>;

    /// Offered every stored file, after its metadata fields were written.
    /// May append additional fields.
    fn process_file(
        &mut self,
        field_name: &str,
        file: &FileHandler,
        writer: &mut FormWriter,
    ) -> Result<(), UploadError>;
}

/// The permissive processor: any field, any number of files.
pub struct FieldFilter {
    name: &'static str,
}

impl FieldFilter {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl FormProcessor for FieldFilter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn process_field(&mut self, _name: &str, _value: &str) -> Result<(), UploadError> {
        Ok(())
    }

    fn process_file(
        &mut self,
        _field_name: &str,
        _file: &FileHandler,
        _writer: &mut FormWriter,
    ) -> Result<(), UploadError> {
        Ok(())
    }
}

/// Build the accelerated upload handler: pre-authorize, rewrite the
/// multipart body, forward the rewritten form to the backend.
pub fn accelerate<F>(
    api: Arc<ApiClient>,
    client: reqwest::Client,
    forward: Handler,
    make_processor: F,
) -> Handler
where
    F: Fn() -> Box<dyn FormProcessor> + Send + Sync + 'static,
{
    let make_processor = Arc::new(make_processor);
    pre_auth_handler(api, "/authorize", move |req, capability| {
        let client = client.clone();
        let forward = forward.clone();
        let make_processor = make_processor.clone();
        Box::pin(async move {
            let mut processor = make_processor();
            handle_file_uploads(&client, forward, req, &capability, processor.as_mut()).await
        })
    })
}

/// Rewrite the request body and forward. A non-multipart body is proxied
/// unchanged.
pub async fn handle_file_uploads(
    client: &reqwest::Client,
    forward: Handler,
    req: Request<Body>,
    capability: &Capability,
    processor: &mut dyn FormProcessor,
) -> Response<Body> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let Ok(boundary) = multer::parse_boundary(content_type) else {
        return forward(req).await;
    };

    let (mut parts, body) = req.into_parts();

    let (form, cleanups) = match rewrite_form(client, capability, boundary, body, processor).await
    {
        Ok(result) => result,
        Err(e) => {
            let probe = Request::from_parts(parts, Body::empty());
            return helper::fail_500(&probe, &e);
        }
    };

    parts.headers.remove(header::CONTENT_LENGTH);
    if let Ok(value) = HeaderValue::from_str(&form.content_type) {
        parts.headers.insert(header::CONTENT_TYPE, value);
    }
    parts.headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(form.body.len() as u64),
    );

    let proxied = Request::from_parts(parts, Body::from(form.body));
    let response = forward(proxied).await;

    // Temp files must outlive the backend's bookkeeping: run the cleanup
    // chain only once the response has fully streamed (or the connection
    // is dropped, in which case each Cleanup fires from Drop).
    run_cleanup_after(response, cleanups)
}

fn run_cleanup_after(response: Response<Body>, cleanups: CleanupChain) -> Response<Body> {
    let (parts, body) = response.into_parts();
    let tail = futures_util::stream::once(async move {
        cleanups.run().await;
        Ok::<Bytes, axum::Error>(Bytes::new())
    });
    let stream = body.into_data_stream().chain(tail);
    Response::from_parts(parts, Body::from_stream(stream))
}

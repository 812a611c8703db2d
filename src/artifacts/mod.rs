//! CI artifacts: the upload form policy and the `artifact:` entry injector.

use std::path::Path;

use axum::http::{header, HeaderValue, Response, StatusCode};
use serde::Deserialize;

use crate::filestore::FileHandler;
use crate::helper;
use crate::routing::HandlerFuture;
use crate::senddata::{unpack, InjectContext, Injector};
use crate::upload::{FormProcessor, FormWriter, UploadError};

/// Artifacts requests carry exactly one file, in the `file` form field.
#[derive(Default)]
pub struct ArtifactsProcessor {
    file_seen: bool,
}

impl ArtifactsProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FormProcessor for ArtifactsProcessor {
    fn name(&self) -> &'static str {
        "artifacts"
    }

    fn process_field(&mut self, _name: &str, _value: &str) -> Result<(), UploadError> {
        Ok(())
    }

    fn process_file(
        &mut self,
        field_name: &str,
        _file: &FileHandler,
        _writer: &mut FormWriter,
    ) -> Result<(), UploadError> {
        if field_name != "file" {
            return Err(UploadError::IllegalField(field_name.to_string()));
        }
        if self.file_seen {
            return Err(UploadError::IllegalField(
                "request contains more than one file".to_string(),
            ));
        }
        self.file_seen = true;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EntryParams {
    #[serde(default)]
    archive: String,
    #[serde(default)]
    entry: String,
}

/// Serve one entry out of a saved artifacts archive.
pub struct SendEntry;

impl Injector for SendEntry {
    fn prefix(&self) -> &'static str {
        "artifact"
    }

    fn inject(&self, ctx: InjectContext, data: String) -> HandlerFuture {
        Box::pin(async move {
            let params: EntryParams = match unpack(&data) {
                Ok(params) => params,
                Err(e) => {
                    tracing::error!("SendEntry: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            if params.archive.is_empty() || params.entry.is_empty() {
                return helper::plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                );
            }

            tracing::info!(
                archive = %params.archive,
                entry = %params.entry,
                path = %ctx.uri.path(),
                "SendEntry: sending"
            );

            if tokio::fs::metadata(&params.archive).await.is_err() {
                return helper::not_found();
            }

            // The archive is a zip; `unzip -p` streams one entry to stdout
            // and exits nonzero when the entry is absent.
            let mut cmd = tokio::process::Command::new("unzip");
            cmd.arg("-p")
                .arg(&params.archive)
                .arg(&params.entry)
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .stdin(std::process::Stdio::null())
                .kill_on_drop(true);

            let output = match cmd.spawn() {
                Ok(mut child) => match child.stdout.take() {
                    Some(stdout) => (child, stdout),
                    None => {
                        return helper::plain_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal server error",
                        )
                    }
                },
                Err(e) => {
                    tracing::error!("SendEntry: spawn unzip: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };
            let (mut child, mut stdout) = output;

            // Read the first chunk before committing to a 200: a missing
            // entry fails fast with no output.
            use tokio::io::AsyncReadExt;
            let mut first = vec![0u8; 32 * 1024];
            let n = match stdout.read(&mut first).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("SendEntry: read unzip output: {}", e);
                    return helper::not_found();
                }
            };

            if n == 0 {
                let status = child.wait().await;
                if !matches!(&status, Ok(s) if s.success()) {
                    return helper::not_found();
                }
            }
            first.truncate(n);

            child.stdout = Some(stdout);
            let body = match artifacts_entry_body(first, child) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("SendEntry: {}", e);
                    return helper::plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                    );
                }
            };

            let filename = Path::new(&params.entry)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "entry".to_string());

            let mut response = Response::new(body);
            let headers = response.headers_mut();
            if let Ok(value) =
                HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
            {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        })
    }
}

/// Chain the probe chunk back in front of the remaining subprocess output.
fn artifacts_entry_body(
    first: Vec<u8>,
    child: tokio::process::Child,
) -> std::io::Result<axum::body::Body> {
    use bytes::Bytes;
    use futures_util::StreamExt;

    let head = futures_util::stream::once(async move {
        Ok::<Bytes, std::io::Error>(Bytes::from(first))
    });
    let rest = crate::git::command::command_output_body(child, "SendEntry")?;
    let stream = head.chain(rest.into_data_stream().map(|r| r.map_err(std::io::Error::other)));
    Ok(axum::body::Body::from_stream(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_file_field_may_carry_a_file() {
        let mut processor = ArtifactsProcessor::new();
        let file = FileHandler::default();
        let mut writer = FormWriter::new();

        let err = processor
            .process_file("attachment", &file, &mut writer)
            .unwrap_err();
        assert!(matches!(err, UploadError::IllegalField(_)));

        processor.process_file("file", &file, &mut writer).unwrap();
        let err = processor.process_file("file", &file, &mut writer).unwrap_err();
        assert!(matches!(err, UploadError::IllegalField(_)));
    }
}

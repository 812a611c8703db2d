//! Multipart form rewriting.
//!
//! Reads the inbound form one part at a time. Non-file fields are copied
//! through; file parts are streamed into the filestore pipeline and
//! replaced by a handful of metadata fields. Whole files are never held
//! in memory.

use std::path::PathBuf;

use axum::body::Body;
use uuid::Uuid;

use super::form::FormWriter;
use super::{FormProcessor, UploadError};
use crate::api::Capability;
use crate::filestore::{self, Cleanup, FileHandler, LocalTarget, SaveFileOpts};
use crate::observability::metrics;

/// The digest fields emitted per file, in a fixed order.
const EMITTED_HASHES: &[&str] = &["md5", "sha1", "sha256", "sha512"];

/// Cleanup chain for all files saved while rewriting one form.
#[derive(Debug, Default)]
pub struct CleanupChain(Vec<Cleanup>);

impl CleanupChain {
    pub async fn run(self) {
        for cleanup in self.0 {
            cleanup.run().await;
        }
    }
}

#[derive(Debug)]
pub struct RewrittenForm {
    pub body: bytes::Bytes,
    pub content_type: String,
}

/// Rewrite a multipart body per the capability's storage targets.
pub async fn rewrite_form(
    client: &reqwest::Client,
    capability: &Capability,
    boundary: String,
    body: Body,
    processor: &mut dyn FormProcessor,
) -> Result<(RewrittenForm, CleanupChain), UploadError> {
    metrics::record_multipart_request(processor.name());

    let mut form = multer::Multipart::new(body.into_data_stream(), boundary);
    let mut writer = FormWriter::new();
    let mut cleanups = CleanupChain::default();
    // Presigned URLs are single-use: only the first file part may be
    // stored remotely.
    let mut remote_used = false;

    while let Some(field) = form.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };

        match field.file_name().map(str::to_owned) {
            Some(filename) => {
                let handler = handle_file_part(
                    client,
                    capability,
                    &filename,
                    field,
                    &mut cleanups,
                    processor,
                    &mut remote_used,
                )
                .await?;

                write_file_fields(&mut writer, &name, &filename, &handler);
                processor.process_file(&name, &handler, &mut writer)?;
                metrics::record_multipart_bytes(processor.name(), handler.size);
            }
            None => {
                let value = field.text().await?;
                writer.write_field(&name, &value);
                processor.process_field(&name, &value)?;
            }
        }
    }

    let content_type = writer.content_type();
    Ok((
        RewrittenForm {
            body: writer.finish(),
            content_type,
        },
        cleanups,
    ))
}

async fn handle_file_part(
    client: &reqwest::Client,
    capability: &Capability,
    filename: &str,
    field: multer::Field<'static>,
    cleanups: &mut CleanupChain,
    processor: &mut dyn FormProcessor,
    remote_used: &mut bool,
) -> Result<FileHandler, UploadError> {
    metrics::record_multipart_file(processor.name());

    if filename.contains('/') || filename == "." || filename == ".." {
        return Err(UploadError::IllegalFilename(filename.to_string()));
    }

    let local = if capability.temp_path.is_empty() {
        None
    } else {
        Some(LocalTarget {
            dir: PathBuf::from(&capability.temp_path)
                .join(format!("multipart-{}", Uuid::new_v4().simple())),
            filename: filename.to_string(),
            own_dir: true,
        })
    };

    let mut opts = SaveFileOpts::from_capability(capability, local)?;
    if opts.remote.is_some() {
        if *remote_used {
            metrics::record_object_storage("multiple-uploads");
            opts.remote = None;
            opts.remote_id.clear();
            opts.remote_url.clear();
            opts.delete_url.clear();
            if opts.local.is_none() {
                return Err(UploadError::Storage(
                    crate::filestore::FileStoreError::NoStorageTarget,
                ));
            }
        } else {
            *remote_used = true;
        }
    }

    // Drive the part with chunk() so the inbound read only advances once
    // every sink has consumed the previous chunk.
    let stream = Box::pin(futures_util::stream::unfold(field, |mut field| async move {
        match field.chunk().await {
            Ok(Some(bytes)) => Some((Ok(bytes), field)),
            Ok(None) => None,
            Err(e) => Some((Err(e), field)),
        }
    }));

    let (handler, cleanup) = filestore::save_file(client, &opts, stream, None).await?;
    cleanups.0.push(cleanup);

    Ok(handler)
}

fn write_file_fields(writer: &mut FormWriter, name: &str, filename: &str, file: &FileHandler) {
    writer.write_field(&format!("{}.name", name), filename);
    if let Some(path) = &file.local_path {
        writer.write_field(&format!("{}.path", name), &path.to_string_lossy());
    }
    if !file.remote_url.is_empty() {
        writer.write_field(&format!("{}.remote_url", name), &file.remote_url);
    }
    if !file.remote_id.is_empty() {
        writer.write_field(&format!("{}.remote_id", name), &file.remote_id);
    }
    writer.write_field(&format!("{}.size", name), &file.size.to_string());
    for hash in EMITTED_HASHES {
        if let Some(value) = file.hashes.get(*hash) {
            writer.write_field(&format!("{}.{}", name, hash), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::FieldFilter;

    fn multipart_body(boundary: &str, fields: &[(&str, Option<&str>, &str)]) -> Body {
        let mut raw = String::new();
        for (name, filename, value) in fields {
            raw.push_str(&format!("--{}\r\n", boundary));
            match filename {
                Some(f) => raw.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\r\n",
                    name, f
                )),
                None => raw.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    name
                )),
            }
            raw.push_str(value);
            raw.push_str("\r\n");
        }
        raw.push_str(&format!("--{}--\r\n", boundary));
        Body::from(raw)
    }

    async fn parse_fields(form: RewrittenForm) -> Vec<(String, String)> {
        let boundary = multer::parse_boundary(&form.content_type).unwrap();
        let stream =
            futures_util::stream::once(async move { Ok::<_, std::io::Error>(form.body) });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut fields = Vec::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap().to_string();
            fields.push((name, field.text().await.unwrap()));
        }
        fields
    }

    #[tokio::test]
    async fn file_parts_become_metadata_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let capability = Capability {
            temp_path: tmp.path().to_string_lossy().into_owned(),
            ..Capability::default()
        };

        let body = multipart_body(
            "b1",
            &[
                ("token", None, "abc"),
                ("upload", Some("hello.txt"), "hello"),
            ],
        );

        let client = reqwest::Client::new();
        let mut processor = FieldFilter::new("test");
        let (form, cleanups) =
            rewrite_form(&client, &capability, "b1".to_string(), body, &mut processor)
                .await
                .unwrap();

        let fields = parse_fields(form).await;

        fn get<'a>(fields: &'a [(String, String)], key: &str) -> &'a str {
            &fields
                .iter()
                .find(|(name, _)| name == key)
                .unwrap_or_else(|| panic!("missing field {}", key))
                .1
        }

        assert_eq!(get(&fields, "token"), "abc");
        assert_eq!(get(&fields, "upload.name"), "hello.txt");
        assert_eq!(get(&fields, "upload.size"), "5");
        assert_eq!(get(&fields, "upload.md5"), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(
            get(&fields, "upload.sha1"),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );

        let path = PathBuf::from(get(&fields, "upload.path"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert!(path
            .parent()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("multipart-"));

        // Inbound field order is preserved in the rewritten form.
        assert_eq!(fields[0].0, "token");
        assert_eq!(fields[1].0, "upload.name");

        cleanups.run().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn illegal_filenames_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let capability = Capability {
            temp_path: tmp.path().to_string_lossy().into_owned(),
            ..Capability::default()
        };

        for bad in ["../evil", "a/b", ".", ".."] {
            let body = multipart_body("b1", &[("upload", Some(bad), "x")]);
            let client = reqwest::Client::new();
            let mut processor = FieldFilter::new("test");
            let err = rewrite_form(&client, &capability, "b1".to_string(), body, &mut processor)
                .await
                .unwrap_err();
            assert!(
                matches!(err, UploadError::IllegalFilename(_)),
                "filename {:?} must be rejected",
                bad
            );
        }
    }
}

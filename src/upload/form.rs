//! Outbound multipart/form-data writer.
//!
//! The rewritten form only ever carries small metadata fields (file
//! contents are persisted elsewhere), so it is buffered in memory.

use bytes::{BufMut, Bytes, BytesMut};

pub struct FormWriter {
    boundary: String,
    buf: BytesMut,
}

impl FormWriter {
    pub fn new() -> Self {
        Self {
            boundary: format!("stevedore-{}", uuid::Uuid::new_v4().simple()),
            buf: BytesMut::new(),
        }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Append one text field.
    pub fn write_field(&mut self, name: &str, value: &str) {
        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"\r\n");
        self.buf.put_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                escape_quotes(name)
            )
            .as_bytes(),
        );
        self.buf.put_slice(value.as_bytes());
        self.buf.put_slice(b"\r\n");
    }

    /// Close the form and return the encoded body.
    pub fn finish(mut self) -> Bytes {
        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"--\r\n");
        self.buf.freeze()
    }
}

impl Default for FormWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_a_multipart_parser() {
        let mut writer = FormWriter::new();
        writer.write_field("token", "abc");
        writer.write_field("file.name", "a\"b");
        let content_type = writer.content_type();
        let body = writer.finish();

        let boundary = multer::parse_boundary(&content_type).unwrap();
        let stream = futures_util::stream::once(async move {
            Ok::<bytes::Bytes, std::io::Error>(body)
        });
        let mut form = multer::Multipart::new(stream, boundary);

        let field = form.next_field().await.unwrap().unwrap();
        assert_eq!(field.name(), Some("token"));
        assert_eq!(field.text().await.unwrap(), "abc");

        let field = form.next_field().await.unwrap().unwrap();
        assert_eq!(field.name(), Some("file.name"));
        assert_eq!(field.text().await.unwrap(), "a\"b");

        assert!(form.next_field().await.unwrap().is_none());
    }
}

//! `multipart/form-data` body builder for store uploads
//!
//! The body is assembled in memory into a single `Bytes`, the same way the
//! file is read whole for hashing. Field values are written verbatim; names and
//! file names are quoted with `"` and CR/LF stripped.

use bytes::{BufMut, Bytes, BytesMut};
use rand::distributions::Alphanumeric;
use rand::Rng;

const BOUNDARY_PREFIX: &str = "----omclient";

#[derive(Debug)]
pub struct MultipartForm {
    boundary: String,
    body: BytesMut,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    /// Create a form with a random boundary
    pub fn new() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_boundary(format!("{}{}", BOUNDARY_PREFIX, token))
    }

    pub fn with_boundary(boundary: String) -> Self {
        Self {
            boundary,
            body: BytesMut::with_capacity(1024),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request's `content-type` header
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Append a text field
    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.write_part_header(name, None);
        self.body.put_slice(value.as_bytes());
        self.body.put_slice(b"\r\n");
        self
    }

    /// Append a file field
    pub fn file(mut self, name: &str, file_name: &str, data: &[u8]) -> Self {
        self.body.reserve(data.len() + 256);
        self.write_part_header(name, Some(file_name));
        self.body.put_slice(data);
        self.body.put_slice(b"\r\n");
        self
    }

    /// Close the form and return the complete body
    pub fn finish(mut self) -> Bytes {
        self.body.put_slice(b"--");
        self.body.put_slice(self.boundary.as_bytes());
        self.body.put_slice(b"--\r\n");
        self.body.freeze()
    }

    fn write_part_header(&mut self, name: &str, file_name: Option<&str>) {
        self.body.put_slice(b"--");
        self.body.put_slice(self.boundary.as_bytes());
        self.body.put_slice(b"\r\nContent-Disposition: form-data; name=\"");
        self.body.put_slice(Self::quote(name).as_bytes());
        self.body.put_u8(b'"');
        if let Some(file_name) = file_name {
            self.body.put_slice(b"; filename=\"");
            self.body.put_slice(Self::quote(file_name).as_bytes());
            self.body.put_slice(b"\"\r\nContent-Type: application/octet-stream");
        }
        self.body.put_slice(b"\r\n\r\n");
    }

    fn quote(s: &str) -> String {
        s.chars()
            .filter(|c| *c != '\r' && *c != '\n')
            .map(|c| if c == '"' { '\'' } else { c })
            .collect()
    }
}

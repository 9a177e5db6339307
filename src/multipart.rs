//! `multipart/form-data` request bodies.
//!
//! A [`Form`] collects named text and file parts and encodes them into one
//! buffered body, so multipart requests stay replayable. Forms are usually
//! attached through the `with_multipart*` request options; build one directly
//! only when a part needs a custom content type or file name.

use std::fmt;

use bytes::Bytes;
use mime::Mime;

/// A `multipart/form-data` request body under construction.
///
/// # Example
///
/// ```rust
/// use optreq::multipart::{Form, Part};
///
/// let form = Form::new()
///     .text("comment", "first!")
///     .file("attachment", "notes.txt", &b"contents"[..])
///     .part("avatar", Part::bytes(&b"\x89PNG"[..]).mime(mime::IMAGE_PNG));
/// assert!(form.content_type().starts_with("multipart/form-data; boundary="));
/// ```
pub struct Form {
    boundary: String,
    parts: Vec<(String, Part)>,
}

impl Form {
    /// Creates an empty form with a freshly generated boundary.
    pub fn new() -> Form {
        Form {
            boundary: gen_boundary(),
            parts: Vec::new(),
        }
    }

    /// The boundary separating the parts of the encoded form.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Adds a text part.
    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Form {
        self.part(name, Part::text(value))
    }

    /// Adds a file part carrying `application/octet-stream` data.
    pub fn file(
        self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Form {
        self.part(
            name,
            Part::bytes(data)
                .file_name(file_name)
                .mime(mime::APPLICATION_OCTET_STREAM),
        )
    }

    /// Adds a custom part under the given field name.
    pub fn part(mut self, name: impl Into<String>, part: Part) -> Form {
        self.parts.push((name.into(), part));
        self
    }

    /// The value for the `Content-Type` header of a request carrying this form.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Encodes the parts, in insertion order, into the multipart wire format.
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        for (name, part) in &self.parts {
            buf.extend_from_slice(b"--");
            buf.extend_from_slice(self.boundary.as_bytes());
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(b"Content-Disposition: form-data; name=\"");
            buf.extend_from_slice(escape_disposition(name).as_bytes());
            buf.extend_from_slice(b"\"");
            if let Some(file_name) = &part.file_name {
                buf.extend_from_slice(b"; filename=\"");
                buf.extend_from_slice(escape_disposition(file_name).as_bytes());
                buf.extend_from_slice(b"\"");
            }
            buf.extend_from_slice(b"\r\n");
            if let Some(mime) = &part.mime {
                buf.extend_from_slice(b"Content-Type: ");
                buf.extend_from_slice(mime.as_ref().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(&part.value);
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"--");
        buf.extend_from_slice(self.boundary.as_bytes());
        buf.extend_from_slice(b"--\r\n");

        Bytes::from(buf)
    }
}

impl Default for Form {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Form")
            .field("boundary", &self.boundary)
            .field("parts", &self.parts)
            .finish()
    }
}

/// One part of a multipart form.
pub struct Part {
    value: Bytes,
    file_name: Option<String>,
    mime: Option<Mime>,
}

impl Part {
    /// Makes a text part.
    pub fn text(value: impl Into<String>) -> Part {
        Part::bytes(Bytes::from(value.into()))
    }

    /// Makes a part from arbitrary bytes.
    pub fn bytes(value: impl Into<Bytes>) -> Part {
        Part {
            value: value.into(),
            file_name: None,
            mime: None,
        }
    }

    /// Sets the file name of this part, shown in its disposition header.
    pub fn file_name(mut self, file_name: impl Into<String>) -> Part {
        self.file_name = Some(file_name.into());
        self
    }

    /// Sets the content type of this part.
    pub fn mime(mut self, mime: Mime) -> Part {
        self.mime = Some(mime);
        self
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("len", &self.value.len())
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .finish()
    }
}

fn gen_boundary() -> String {
    let a = fastrand::u64(..);
    let b = fastrand::u64(..);
    let c = fastrand::u64(..);
    let d = fastrand::u64(..);

    format!("{a:016x}-{b:016x}-{c:016x}-{d:016x}")
}

// Quoted-string escaping for disposition parameters. CR and LF must not
// reach the part headers verbatim.
fn escape_disposition(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_shape() {
        let boundary = gen_boundary();
        assert_eq!(boundary.len(), 67);
        assert!(
            boundary
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '-')
        );

        // Two forms never share a boundary.
        assert_ne!(Form::new().boundary(), Form::new().boundary());
    }

    #[test]
    fn encode_text_then_file() {
        let form = Form::new()
            .text("name", "jack")
            .file("media", "1.txt", &b"hello world"[..]);
        let boundary = form.boundary().to_string();
        let encoded = form.encode();

        let expected = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"name\"\r\n\
             \r\n\
             jack\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"media\"; filename=\"1.txt\"\r\n\
             Content-Type: application/octet-stream\r\n\
             \r\n\
             hello world\r\n\
             --{boundary}--\r\n"
        );
        assert_eq!(encoded, expected.as_bytes());
    }

    #[test]
    fn encode_is_deterministic_for_one_form() {
        let form = Form::new().text("a", "1").text("b", "2");
        assert_eq!(form.encode(), form.encode());
    }

    #[test]
    fn quotes_in_names_are_escaped() {
        let form = Form::new().file("f", "we\"ird\\name", &b"x"[..]);
        let encoded = form.encode();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.contains(r#"filename="we\"ird\\name""#));
    }

    #[test]
    fn newlines_cannot_reach_part_headers() {
        let form = Form::new().file("f", "evil\r\nX-Injected: 1", &b"x"[..]);
        let encoded = form.encode();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.contains(r#"filename="evil\r\nX-Injected: 1""#));
        assert!(!text.contains("\r\nX-Injected"));
    }

    #[test]
    fn multibyte_payload_survives_encoding() {
        let payload = "hello world世界！".as_bytes().to_vec();
        let form = Form::new().file("media", "1.txt", payload.clone());
        let encoded = form.encode();

        let needle = &payload[..];
        assert!(
            encoded
                .windows(needle.len())
                .any(|window| window == needle)
        );
    }
}

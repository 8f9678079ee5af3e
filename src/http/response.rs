//! HTTP/1.1 response builder.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// Content type assumed for a body without an explicit `Content-Type` header.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// An HTTP/1.1 response.
///
/// ```
/// use genpage::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "text/html")
///     .body("<b>hi</b>");
///
/// assert_eq!(response.content_type(), "text/html");
/// assert_eq!(response.body_ref().as_ref(), b"<b>hi</b>");
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces a header in place. Used by layers that decorate a downstream
    /// response without rebuilding it.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_ref(&self) -> &Bytes {
        &self.body
    }

    /// Returns the declared `Content-Type`, or [`DEFAULT_CONTENT_TYPE`].
    pub fn content_type(&self) -> &str {
        self.headers
            .get("content-type")
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Serializes the response in HTTP/1.1 wire format.
    ///
    /// A non-empty body without a `Content-Type` gets [`DEFAULT_CONTENT_TYPE`];
    /// `Content-Length` is always written last.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers.insert("Content-Type", DEFAULT_CONTENT_TYPE);
        }

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + content_length);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);
        buf.put(self.body);

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn content_type_falls_back_to_default() {
        let r = Response::new(StatusCode::Ok).body("x");
        assert_eq!(r.content_type(), DEFAULT_CONTENT_TYPE);

        let r = r.header("Content-Type", "text/html; charset=utf-8");
        assert_eq!(r.content_type(), "text/html; charset=utf-8");
    }

    #[test]
    fn set_header_overwrites_existing_value() {
        let mut r = Response::new(StatusCode::Ok).header("ETag", "stale");
        r.set_header("ETag", "abc");
        assert_eq!(r.headers().get("etag"), Some("abc"));
        assert_eq!(r.headers().len(), 1);
    }

    #[test]
    fn wire_format_carries_etag_and_length() {
        let r = Response::new(StatusCode::Ok)
            .header("ETag", "0123")
            .body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("ETag: 0123\r\n"));
        assert!(s.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(s.ends_with("Content-Length: 5\r\n\r\nHello"));
    }

    #[test]
    fn empty_body_has_no_content_type() {
        let s = to_string(Response::new(StatusCode::NoContent).into_bytes());
        assert!(s.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }
}

//! The response value produced by handlers and decorated by stages.

use bytes::Bytes;

use super::{Headers, StatusCode};

/// Response body as an ordered sequence of byte chunks.
///
/// Handlers usually produce a single chunk; the sequence form lets a stage
/// prepend or append content without re-buffering what downstream produced.
#[derive(Debug, Clone, Default)]
pub struct Body {
    chunks: Vec<Bytes>,
}

impl Body {
    /// Creates an empty body.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Appends a chunk.
    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        self.chunks.push(chunk.into());
    }

    /// Iterates the chunks in order.
    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }

    /// Returns `true` if the body holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_empty())
    }

    /// Total byte length across all chunks.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Concatenates the chunks into a string, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self {
            chunks: vec![Bytes::from(s)],
        }
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        s.to_owned().into()
    }
}

impl From<Bytes> for Body {
    fn from(chunk: Bytes) -> Self {
        Self {
            chunks: vec![chunk],
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

/// An HTTP-style response value: status, headers, chunked body.
///
/// # Examples
///
/// ```
/// use twig::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.body_text(), r#"{"status":"ok"}"#);
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
}

impl Response {
    /// Creates a response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::empty(),
        }
    }

    /// A `200 OK` plain-text response.
    pub fn text(body: impl Into<Body>) -> Self {
        Self::new(StatusCode::Ok)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
    }

    /// A `200 OK` HTML response.
    pub fn html(body: impl Into<Body>) -> Self {
        Self::new(StatusCode::Ok)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(body)
    }

    /// A `303 See Other` redirect to `location`.
    pub fn see_other(location: impl Into<String>) -> Self {
        Self::new(StatusCode::SeeOther).header("Location", location)
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for stages that receive a response
    /// from downstream and decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the response headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body.
    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    /// Concatenated body text, for logging and assertions.
    pub fn body_text(&self) -> String {
        self.body.text()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// A bare string body is a `200 OK` plain-text response.
impl From<&str> for Response {
    fn from(body: &str) -> Self {
        Response::text(body)
    }
}

impl From<String> for Response {
    fn from(body: String) -> Self {
        Response::text(body)
    }
}

//! The request value flowing through the pipeline.
//!
//! A [`Request`] is an in-memory value: the pipeline performs no I/O on it.
//! Embedders construct one field by field (builder style) or, when sitting on
//! a raw HTTP/1.1 transport, with the [`httparse`]-backed [`Request::parse`]
//! boundary adapter.

use std::str;

use thiserror::Error;

use crate::accept::AcceptPreference;
use crate::env::{Extensions, Params};

use super::{Headers, Method};

/// Errors from the [`Request::parse`] boundary adapter.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// An HTTP-style request value.
///
/// Carries the method, the not-yet-consumed path, a case-insensitive header
/// map, the path prefix already consumed by mounting (`script_prefix`), route
/// captures, and a type-erased per-request environment bag that stages may
/// annotate.
///
/// # Examples
///
/// ```
/// use twig::http::{Method, Request};
///
/// let req = Request::new(Method::Get, "/users/42")
///     .with_header("Host", "example.com")
///     .with_header("Accept", "application/json");
///
/// assert_eq!(req.path(), "/users/42");
/// assert_eq!(req.host(), Some("example.com"));
/// ```
pub struct Request {
    method: Method,
    path: String,
    headers: Headers,
    script_prefix: String,
    params: Params,
    env: Extensions,
}

impl Request {
    /// Maximum number of headers [`Request::parse`] will accept.
    const MAX_HEADERS: usize = 64;

    /// Creates a request with the given method and path and no headers.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Headers::new(),
            script_prefix: String::new(),
            params: Params::new(),
            env: Extensions::new(),
        }
    }

    /// Builder-style header append, for embedders and tests.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Parses a raw HTTP/1.1 request head from a byte buffer.
    ///
    /// Boundary adapter for transports; the core algorithms only ever see the
    /// resulting value. Any query string is kept on the path verbatim. The
    /// body, if present, is the transport's concern and is ignored here.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — the header section is not complete yet.
    /// - [`RequestError::Parse`] — the bytes are not a valid request head.
    /// - [`RequestError::MissingField`] — method or path absent.
    pub fn parse(buf: &[u8]) -> Result<Self, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        match raw.parse(buf)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        }

        let method: Method = raw
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
            .unwrap_or(Method::Get); // FromStr is infallible

        let path = raw
            .path
            .ok_or(RequestError::MissingField { field: "path" })?
            .to_owned();

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        Ok(Self {
            method,
            path,
            headers: header_map,
            script_prefix: String::new(),
            params: Params::new(),
            env: Extensions::new(),
        })
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the portion of the request path not yet consumed by mounting.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Replaces the remaining path. Used by mount delegation.
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the `Host` header value, if present.
    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    /// Returns the path prefix already consumed by mount resolution.
    pub fn script_prefix(&self) -> &str {
        &self.script_prefix
    }

    /// Appends a matched mount prefix to the consumed-path record.
    pub fn push_script_prefix(&mut self, prefix: &str) {
        self.script_prefix.push_str(prefix);
    }

    /// Returns the captures bound by the matched route.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Shorthand for `params().get(name)`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// Replaces the route captures. Used by route dispatch.
    pub fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    /// Returns the per-request environment bag.
    pub fn env(&self) -> &Extensions {
        &self.env
    }

    /// Mutable access to the per-request environment bag.
    pub fn env_mut(&mut self) -> &mut Extensions {
        &mut self.env
    }

    /// Returns the ranked accept preferences attached by the `accept` stage,
    /// if negotiation has run and succeeded for this request.
    pub fn accepted(&self) -> Option<&[AcceptPreference]> {
        self.env
            .get::<Vec<AcceptPreference>>()
            .map(Vec::as_slice)
    }
}

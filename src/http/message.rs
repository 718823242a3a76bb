//! HTTP message types.
//!
//! Requests and responses carry only what the harness needs to round-trip
//! an exchange. Responses additionally carry harness-only metadata
//! (`keep_alive`, `close_connection`, `write_as_blob`) consumed by the
//! listener state machine and never serialized to the wire.

use std::fmt;

use super::{Headers, CRLF};
use crate::error::HarnessError;

/// HTTP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
}

impl Method {
    pub fn parse(s: &str) -> Result<Self, HarnessError> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            other => Err(HarnessError::Protocol(format!(
                "unsupported method '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
        }
    }

    /// Whether a request with this method may carry a body.
    pub fn allows_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Map httparse's minor version digit.
    pub fn from_minor(minor: u8) -> Self {
        if minor == 0 {
            Version::Http10
        } else {
            Version::Http11
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const FOUND: Status = Status(302);
    pub const BAD_REQUEST: Status = Status(400);
    pub const UNAUTHORIZED: Status = Status(401);
    pub const NOT_FOUND: Status = Status(404);
    pub const PROXY_AUTH_REQUIRED: Status = Status(407);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const BAD_GATEWAY: Status = Status(502);

    pub fn new(code: u16) -> Result<Self, HarnessError> {
        if (100..600).contains(&code) {
            Ok(Status(code))
        } else {
            Err(HarnessError::Protocol(format!(
                "invalid status code {}",
                code
            )))
        }
    }

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            307 => "Temporary Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            405 => "Method Not Allowed",
            407 => "Proxy Authentication Required",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            _ => "Unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// A parsed HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        HttpRequest {
            method,
            path: path.into(),
            version: Version::default(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Keep-alive as requested by the client: HTTP/1.1 defaults to true
    /// unless `Connection: close`; HTTP/1.0 defaults to false unless
    /// `Connection: keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        match self.headers.get("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == Version::Http11,
        }
    }

    /// Encode the request head (request line + headers + blank line).
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.path.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());
        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }
        buf.extend_from_slice(CRLF.as_bytes());
        buf
    }

    /// Full wire image: head followed by body.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = self.head_bytes();
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// An HTTP response plus the harness-only metadata driving the listener
/// state machine.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: Status,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Reuse the connection for another request after this response.
    pub keep_alive: bool,
    /// Force-close regardless of `keep_alive`.
    pub close_connection: bool,
    /// Write the full wire image in a single write instead of head-then-body.
    pub write_as_blob: bool,
}

impl HttpResponse {
    pub fn new(status: Status) -> Self {
        HttpResponse {
            version: Version::default(),
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
            close_connection: false,
            write_as_blob: false,
        }
    }

    pub fn builder() -> HttpResponseBuilder {
        HttpResponseBuilder::default()
    }

    /// The effective keep-alive decision for the state machine.
    pub fn effective_keep_alive(&self) -> bool {
        self.keep_alive && !self.close_connection
    }

    /// Encode the response head (status line + headers + blank line).
    ///
    /// A `Connection` header derived from the keep-alive metadata is added
    /// here so real clients observe the same decision the state machine
    /// makes; the metadata itself is never serialized.
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.code().to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.reason_phrase().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());
        for (name, value) in self.headers.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(CRLF.as_bytes());
        }
        if !self.headers.contains("Content-Length") {
            buf.extend_from_slice(
                format!("Content-Length: {}{}", self.body.len(), CRLF).as_bytes(),
            );
        }
        if !self.headers.contains("Connection") {
            let value = if self.effective_keep_alive() {
                "keep-alive"
            } else {
                "close"
            };
            buf.extend_from_slice(format!("Connection: {}{}", value, CRLF).as_bytes());
        }
        buf.extend_from_slice(CRLF.as_bytes());
        buf
    }

    /// Full wire image: head followed by body.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = self.head_bytes();
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Builder for HTTP responses.
#[derive(Debug, Default)]
pub struct HttpResponseBuilder {
    version: Option<Version>,
    status: Option<Status>,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: Option<bool>,
    close_connection: bool,
    write_as_blob: bool,
}

impl HttpResponseBuilder {
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn close_connection(mut self, close: bool) -> Self {
        self.close_connection = close;
        self
    }

    pub fn write_as_blob(mut self, blob: bool) -> Self {
        self.write_as_blob = blob;
        self
    }

    pub fn build(self) -> HttpResponse {
        HttpResponse {
            version: self.version.unwrap_or_default(),
            status: self.status.unwrap_or(Status::OK),
            headers: self.headers,
            body: self.body,
            keep_alive: self.keep_alive.unwrap_or(true),
            close_connection: self.close_connection,
            write_as_blob: self.write_as_blob,
        }
    }
}

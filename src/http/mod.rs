//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → framing.rs (read request head via httparse, body via Content-Length)
//!     → [listener layer matches a registered operation]
//!     → message.rs (response built by a handler)
//!     → framing.rs (write status line, headers, body)
//! ```
//!
//! # Design Decisions
//! - HTTP/1.x only, enough to round-trip a request/response; no caching,
//!   no HTTP/2
//! - Response metadata (keep_alive, close_connection, write_as_blob) is
//!   consumed by the local state machine and never serialized to the wire
//! - Bodies are sized by Content-Length; the harness controls both ends,
//!   so chunked decoding is not needed

pub mod framing;
pub mod headers;
pub mod message;

pub use headers::Headers;
pub use message::{HttpRequest, HttpResponse, Method, Status, Version};

/// CRLF line terminator used throughout the wire format.
pub const CRLF: &str = "\r\n";

/// Maximum number of headers accepted in one message head.
pub const MAX_HEADERS: usize = 64;

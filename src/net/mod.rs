//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → instrument.rs (optional read-hook decorator over the raw stream)
//!     → tls.rs (optional TLS handshake via the provider abstraction)
//!     → connection.rs (framed message I/O, peek, close notification)
//!     → Hand off to the listener state machine
//! ```
//!
//! # Design Decisions
//! - Instrumentation sits below TLS so injected corruption hits TLS records
//! - TLS is optional and handled transparently behind a boxed transport
//! - Closing a connection notifies the owning listener so reuse pools can
//!   evict it

pub mod connection;
pub mod instrument;
pub mod tls;

use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe transport bound used for boxed connection streams.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A type-erased transport: plain TCP, instrumented TCP, or TLS-layered.
pub type BoxedTransport = Box<dyn Transport>;

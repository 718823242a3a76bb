//! Error taxonomy for the harness core.
//!
//! # Responsibilities
//! - Distinguish transport failures from protocol violations
//! - Keep cancellation a distinct terminal state, never conflated with failure
//! - Carry response-validation failures to the embedding harness
//!
//! # Design Decisions
//! - Transport failures may be *expected* (aborted handshakes declared by
//!   operation flags); that classification happens at the operation layer,
//!   not here
//! - Nothing in the core retries; retry policy belongs to the orchestration
//!   layer above

use thiserror::Error;

/// Errors surfaced by the harness core.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Transport-level I/O failure (connect, accept, read, write).
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or stream failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Peer closed the connection where a message was required.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A request arrived for a path with no pending operation.
    #[error("no operation registered for path {0}")]
    UnknownPath(String),

    /// Malformed or unexpected bytes on the wire.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Cancellation fired at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// The observed status did not match the operation's expectation.
    #[error("unexpected status: expected {expected}, got {actual}")]
    UnexpectedStatus { expected: u16, actual: u16 },

    /// The handler's content comparison rejected the observed body.
    #[error("response content mismatch")]
    ContentMismatch,

    /// The client side completed before the server accepted a connection,
    /// meaning the client used a connection the harness did not hand out.
    #[error("client finished before the server accepted a connection")]
    ClientRanAhead,

    /// Invalid harness configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    /// Whether this error is the distinct cancellation terminal state.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarnessError::Cancelled)
    }

    /// Whether this error is a transport failure (as opposed to a protocol
    /// violation or validation failure).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HarnessError::Io(_) | HarnessError::Tls(_) | HarnessError::ConnectionClosed
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_transport() {
        assert!(HarnessError::Cancelled.is_cancelled());
        assert!(!HarnessError::Cancelled.is_transport());
    }

    #[test]
    fn io_errors_convert() {
        let err: HarnessError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(err.is_transport());
    }
}

//! One accepted transport and its framed message I/O.
//!
//! # Responsibilities
//! - Own the (possibly TLS-layered, possibly instrumented) stream
//! - Peek for a first byte to distinguish "client sent nothing" from a
//!   real request
//! - Framed request read / response write with cancellation
//! - Idempotent close that notifies the owning listener's reuse pool
//!
//! Exactly one listener context drives a Connection at a time; ownership
//! moves to a fresh context when the connection is reused.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::instrument::InstrumentationHandle;
use super::tls::TlsInfo;
use super::BoxedTransport;
use crate::error::Result;
use crate::http::framing;
use crate::http::{HttpRequest, HttpResponse};

/// A live server-side connection.
pub struct Connection {
    id: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    stream: BoxedTransport,
    read_buf: BytesMut,
    instrumentation: InstrumentationHandle,
    tls: TlsInfo,
    open: bool,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn new(
        id: u64,
        stream: BoxedTransport,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Connection {
            id,
            remote_addr,
            local_addr,
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            instrumentation: InstrumentationHandle::new(),
            tls: TlsInfo::default(),
            open: true,
            closed_tx,
        }
    }

    pub fn with_tls_info(mut self, tls: TlsInfo) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_instrumentation(mut self, handle: InstrumentationHandle) -> Self {
        self.instrumentation = handle;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tls_info(&self) -> TlsInfo {
        self.tls
    }

    /// Handle for installing read hooks on the underlying raw stream.
    /// Survives context reuse because it travels with the connection.
    pub fn instrumentation(&self) -> InstrumentationHandle {
        self.instrumentation.clone()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Observe the close notification; flips to `true` exactly once.
    pub fn on_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Wait for at least one request byte without consuming it.
    ///
    /// Returns `Ok(false)` when the peer closed without sending anything
    /// (for example an intentionally aborted handshake).
    pub async fn has_request(&mut self, cancel: &CancellationToken) -> Result<bool> {
        if !self.read_buf.is_empty() {
            return Ok(true);
        }
        let read = framing::fill(&mut self.stream, &mut self.read_buf, cancel).await?;
        Ok(read > 0)
    }

    /// Read one framed request.
    pub async fn read_request(&mut self, cancel: &CancellationToken) -> Result<HttpRequest> {
        framing::read_request(&mut self.stream, &mut self.read_buf, cancel).await
    }

    /// Write one framed response.
    pub async fn write_response(
        &mut self,
        response: &HttpResponse,
        cancel: &CancellationToken,
    ) -> Result<()> {
        framing::write_response(&mut self.stream, response, cancel).await
    }

    /// Close the transport. Idempotent; safe from error and disposal paths.
    pub async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        // Suppress hook-injected errors while tearing down on purpose.
        self.instrumentation.set_ignore_errors(true);
        let _ = self.stream.shutdown().await;
        let _ = self.closed_tx.send(true);
        tracing::debug!(connection_id = self.id, peer = %self.remote_addr, "connection closed");
    }

}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.closed_tx.send(true);
    }
}

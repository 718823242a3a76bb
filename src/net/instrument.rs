//! Stream instrumentation: one-shot interception of read operations.
//!
//! # Responsibilities
//! - Wrap a raw transport so test code can interfere with exactly one read
//!   at a chosen point in a TLS record or HTTP parse
//! - Support delay before the read and mutation of its outcome (corrupt,
//!   truncate, inject an error)
//! - Leave writes untouched
//!
//! # Design Decisions
//! - The hook is a transform around the next inner read (optional delay,
//!   then a mutator over the filled bytes and result) rather than a closure
//!   receiving the original read function; that is the poll-compatible
//!   shape of the same contract
//! - A hook is consumed the moment a read begins; it never fires twice
//! - `ignore_errors` turns inner read errors into EOF while a connection is
//!   being torn down intentionally

use std::future::Future;
use std::io;
use std::ops::Range;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Mutator applied to the newly filled bytes and the read result.
/// Returns the adjusted byte count (≤ the actual count) or an error.
pub type ReadMutator =
    Box<dyn FnOnce(&mut [u8], io::Result<usize>) -> io::Result<usize> + Send>;

/// A single-shot hook over the next read operation.
pub struct ReadHook {
    delay: Option<Duration>,
    mutator: Option<ReadMutator>,
}

impl ReadHook {
    /// A hook that does nothing but consume itself; useful as a base for
    /// `with_delay` / `with_mutator`.
    pub fn new() -> Self {
        ReadHook {
            delay: None,
            mutator: None,
        }
    }

    /// Sleep before the read is issued.
    pub fn delay(duration: Duration) -> Self {
        ReadHook::new().with_delay(duration)
    }

    /// XOR-corrupt the given byte range of the read result.
    pub fn corrupt(range: Range<usize>) -> Self {
        ReadHook::new().with_mutator(move |data, result| {
            let read = result?;
            let start = range.start.min(read);
            let end = range.end.min(read);
            for byte in &mut data[start..end] {
                *byte ^= 0xFF;
            }
            Ok(read)
        })
    }

    /// Pretend the peer sent at most `max` bytes.
    pub fn truncate(max: usize) -> Self {
        ReadHook::new().with_mutator(move |_, result| {
            let read = result?;
            Ok(read.min(max))
        })
    }

    /// Replace the read result with an error.
    pub fn fail(kind: io::ErrorKind, message: &'static str) -> Self {
        ReadHook::new().with_mutator(move |_, _| Err(io::Error::new(kind, message)))
    }

    pub fn with_delay(mut self, duration: Duration) -> Self {
        self.delay = Some(duration);
        self
    }

    pub fn with_mutator<F>(mut self, mutator: F) -> Self
    where
        F: FnOnce(&mut [u8], io::Result<usize>) -> io::Result<usize> + Send + 'static,
    {
        self.mutator = Some(Box::new(mutator));
        self
    }
}

impl Default for ReadHook {
    fn default() -> Self {
        ReadHook::new()
    }
}

#[derive(Default)]
struct Shared {
    next_read: Option<ReadHook>,
    ignore_errors: bool,
}

/// Shared handle for installing hooks on an [`Instrumented`] stream.
///
/// The handle stays valid across listener-context reuse because it is
/// attached to the transport, not to the session driving it.
#[derive(Clone, Default)]
pub struct InstrumentationHandle {
    shared: Arc<Mutex<Shared>>,
}

impl InstrumentationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a hook over the next read. Replaces any unfired hook.
    pub fn on_next_read(&self, hook: ReadHook) {
        self.shared.lock().unwrap().next_read = Some(hook);
    }

    /// Whether an installed hook has not yet fired.
    pub fn has_pending_hook(&self) -> bool {
        self.shared.lock().unwrap().next_read.is_some()
    }

    /// Turn inner read errors into EOF during intentional teardown.
    pub fn set_ignore_errors(&self, ignore: bool) {
        self.shared.lock().unwrap().ignore_errors = ignore;
    }
}

/// A transport decorator that applies at most one [`ReadHook`] to the next
/// read operation. Writes pass straight through.
pub struct Instrumented<S> {
    inner: S,
    handle: InstrumentationHandle,
    active_mutator: Option<ReadMutator>,
    pending_delay: Option<Pin<Box<Sleep>>>,
}

impl<S> Instrumented<S> {
    pub fn new(inner: S) -> Self {
        Self::with_handle(inner, InstrumentationHandle::new())
    }

    /// Wrap a stream with an externally created handle so test code holds
    /// the installer before any I/O happens.
    pub fn with_handle(inner: S, handle: InstrumentationHandle) -> Self {
        Instrumented {
            inner,
            handle,
            active_mutator: None,
            pending_delay: None,
        }
    }

    pub fn handle(&self) -> InstrumentationHandle {
        self.handle.clone()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> AsyncRead for Instrumented<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Claim the hook as soon as a read begins so it can never apply to
        // a later read, even if this one returns Pending first.
        if this.active_mutator.is_none() && this.pending_delay.is_none() {
            if let Some(hook) = this.handle.shared.lock().unwrap().next_read.take() {
                if let Some(duration) = hook.delay {
                    this.pending_delay = Some(Box::pin(tokio::time::sleep(duration)));
                }
                this.active_mutator = hook.mutator;
            }
        }

        if let Some(delay) = this.pending_delay.as_mut() {
            match delay.as_mut().poll(cx) {
                Poll::Ready(()) => this.pending_delay = None,
                Poll::Pending => return Poll::Pending,
            }
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);

        match result {
            Poll::Pending => Poll::Pending,
            Poll::Ready(inner_result) => {
                let read = buf.filled().len() - before;
                let ignore_errors = this.handle.shared.lock().unwrap().ignore_errors;

                let outcome = match this.active_mutator.take() {
                    Some(mutator) => {
                        let filled = &mut buf.filled_mut()[before..];
                        mutator(filled, inner_result.map(|()| read))
                    }
                    None => inner_result.map(|()| read),
                };

                match outcome {
                    Ok(kept) => {
                        debug_assert!(kept <= read);
                        buf.set_filled(before + kept.min(read));
                        Poll::Ready(Ok(()))
                    }
                    Err(_) if ignore_errors => {
                        buf.set_filled(before);
                        Poll::Ready(Ok(()))
                    }
                    Err(e) => Poll::Ready(Err(e)),
                }
            }
        }
    }
}

impl<S> AsyncWrite for Instrumented<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

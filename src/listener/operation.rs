//! Operations: one logical request/response exchange.
//!
//! # Responsibilities
//! - Carry the handler, flags, and expectations for one exchange
//! - Drive the server session and the client side concurrently, observing
//!   whichever finishes first
//! - Chain redirect operations, sharing the caller's completion wait
//!
//! # Design Decisions
//! - Claim and redirect slots are compare-and-swap / single-assignment; a
//!   second claim of either is a programming error by contract
//! - Ids come from atomics owned by the Listener, never process statics,
//!   so independent listeners coexist in one process

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::context::SessionOutcome;
use super::handler::{Handler, HandlerAction, PeerInfo};
use super::listener::Listener;
use crate::error::{HarnessError, Result};
use crate::http::{HttpRequest, Status};
use crate::net::connection::Connection;

/// Behavior switches for one operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationFlags {
    /// Pool the connection for reuse after the response.
    pub keep_alive: bool,
    /// Force-close the connection regardless of the response metadata.
    pub dont_reuse_connection: bool,
    /// Tear the server session down once the client side has finished.
    pub abort_after_client_exits: bool,
    /// The server intentionally refuses to complete the TLS handshake.
    pub server_aborts_handshake: bool,
    /// The client is expected to bail out during the handshake.
    pub client_aborts_handshake: bool,
    /// The server side is expected to fail; its error is the test result.
    pub expect_server_error: bool,
}

impl OperationFlags {
    /// Whether a transport/protocol failure is an expected terminal state.
    pub fn expects_failure(&self) -> bool {
        self.expect_server_error || self.server_aborts_handshake || self.client_aborts_handshake
    }
}

/// Atomic claim of an idle context by an operation. Zero means unclaimed.
#[derive(Debug, Default)]
pub struct ClaimSlot(AtomicU64);

impl ClaimSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim for `operation_id`; returns false if someone else holds it.
    pub fn try_claim(&self, operation_id: u64) -> bool {
        self.0
            .compare_exchange(0, operation_id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn claimed_by(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }
}

/// A redirect hand-off created by a handler mid-exchange.
pub struct PendingRedirect {
    pub operation: Arc<Operation>,
    pub keep_alive: bool,
}

/// Single-assignment slot for a pending redirect.
///
/// Assigning twice violates the at-most-one-redirect contract and panics.
#[derive(Default)]
pub struct RedirectSlot(Mutex<Option<PendingRedirect>>);

impl RedirectSlot {
    pub fn set(&self, redirect: PendingRedirect) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_some() {
            panic!("operation redirected twice");
        }
        *slot = Some(redirect);
    }

    pub fn take(&self) -> Option<PendingRedirect> {
        self.0.lock().unwrap().take()
    }
}

/// What the client side of an operation observed.
#[derive(Debug, Clone)]
pub struct ClientObservation {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Terminal outcome of one logical operation.
#[derive(Debug)]
pub enum OperationOutcome {
    Success,
    ExpectedError(HarnessError),
    UnexpectedError(HarnessError),
    Cancelled,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success)
    }
}

enum ChainEnd {
    Served {
        client_result: Option<Result<ClientObservation>>,
        /// The operation that served the final hop; the client-visible
        /// status and body are validated against its expectations.
        last: Arc<Operation>,
    },
    Aborted,
}

/// One logical request lifecycle: registered under a unique path, claimed
/// by at most one listener context at a time, optionally continued by a
/// redirect operation.
pub struct Operation {
    id: u64,
    path: String,
    handler_name: &'static str,
    handler: tokio::sync::Mutex<Box<dyn Handler>>,
    flags: OperationFlags,
    expected_status: Option<Status>,
    redirect: RedirectSlot,
}

impl Operation {
    pub(crate) fn new(
        id: u64,
        path: String,
        handler: Box<dyn Handler>,
        flags: OperationFlags,
        expected_status: Option<Status>,
    ) -> Self {
        Operation {
            id,
            path,
            handler_name: handler.name(),
            handler: tokio::sync::Mutex::new(handler),
            flags,
            expected_status,
            redirect: RedirectSlot::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    pub fn flags(&self) -> OperationFlags {
        self.flags
    }

    pub fn redirect_slot(&self) -> &RedirectSlot {
        &self.redirect
    }

    pub(crate) async fn invoke_handler(
        &self,
        request: &HttpRequest,
        peer: &PeerInfo,
    ) -> Result<HandlerAction> {
        self.handler.lock().await.handle(request, peer).await
    }

    /// Run the client-visible and server-visible sides concurrently and
    /// classify the result against this operation's expectations.
    pub async fn run<F>(self: Arc<Self>, listener: Arc<Listener>, client: F) -> OperationOutcome
    where
        F: Future<Output = Result<ClientObservation>> + Send + 'static,
    {
        match self.run_inner(&listener, client).await {
            Ok(Some((observation, last))) => match last.validate(&observation).await {
                Ok(()) if self.flags.expect_server_error => OperationOutcome::UnexpectedError(
                    HarnessError::Protocol("expected a server error, none occurred".into()),
                ),
                Ok(()) => OperationOutcome::Success,
                Err(e) => OperationOutcome::UnexpectedError(e),
            },
            // Expected abort: the exchange never produced a response.
            Ok(None) => OperationOutcome::ExpectedError(HarnessError::Tls(
                "handshake aborted as flagged".into(),
            )),
            Err(e) if e.is_cancelled() => OperationOutcome::Cancelled,
            Err(e) if self.error_expected(&e) => OperationOutcome::ExpectedError(e),
            Err(e) => OperationOutcome::UnexpectedError(e),
        }
    }

    async fn run_inner<F>(
        self: &Arc<Self>,
        listener: &Arc<Listener>,
        client: F,
    ) -> Result<Option<(ClientObservation, Arc<Operation>)>>
    where
        F: Future<Output = Result<ClientObservation>> + Send + 'static,
    {
        let cancel = listener.cancel_token().child_token();
        let mut client_task = tokio::spawn(client);

        match self.drive_chain(listener, &cancel, &mut client_task).await {
            Ok(ChainEnd::Aborted) => {
                client_task.abort();
                Ok(None)
            }
            Ok(ChainEnd::Served { client_result, last }) => {
                let observation = match client_result {
                    Some(result) => result?,
                    None => client_task
                        .await
                        .map_err(|e| HarnessError::Protocol(format!("client task failed: {}", e)))??,
                };
                Ok(Some((observation, last)))
            }
            Err(e) => {
                client_task.abort();
                Err(e)
            }
        }
    }

    /// Drive server sessions hop by hop through any redirect chain, using a
    /// wait-for-any loop over {server-init, server-done, client-done}.
    async fn drive_chain(
        self: &Arc<Self>,
        listener: &Arc<Listener>,
        cancel: &CancellationToken,
        client_task: &mut JoinHandle<Result<ClientObservation>>,
    ) -> Result<ChainEnd> {
        let mut current = Arc::clone(self);
        let mut allow_reuse = !self.flags.dont_reuse_connection;
        let mut client_result: Option<Result<ClientObservation>> = None;
        // A keep-alive redirect hop hands its connection to the next hop
        // directly; the shared pool is only for reuse across operations.
        let mut carried: Option<Connection> = None;

        loop {
            let (context, was_reused) = listener
                .find_or_create_context(&current, allow_reuse, carried.take())
                .await?;
            tracing::debug!(
                operation = current.id,
                handler = current.handler_name,
                reused = was_reused,
                "starting server session"
            );

            let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
            let mut accepted_rx = accepted_rx.fuse();
            let mut accepted = was_reused;

            let session_listener = Arc::clone(listener);
            let session_cancel = cancel.clone();
            let mut server_task =
                tokio::spawn(context.run(session_listener, session_cancel, accepted_tx));

            let session = loop {
                tokio::select! {
                    res = &mut server_task => {
                        break res.map_err(|e| {
                            HarnessError::Protocol(format!("server session panicked: {}", e))
                        })?;
                    }
                    res = &mut *client_task, if client_result.is_none() => {
                        let result = res.map_err(|e| {
                            HarnessError::Protocol(format!("client task failed: {}", e))
                        })?;
                        tracing::debug!(operation = current.id, "client side finished");
                        client_result = Some(result);
                        if !accepted && !current.flags.expects_failure() {
                            server_task.abort();
                            return Err(HarnessError::ClientRanAhead);
                        }
                        if current.flags.abort_after_client_exits {
                            cancel.cancel();
                        }
                    }
                    _ = &mut accepted_rx, if !accepted => {
                        tracing::trace!(operation = current.id, "server session initialized");
                        accepted = true;
                    }
                }
            };

            let outcome: SessionOutcome = match session {
                Ok(outcome) => outcome,
                Err(e)
                    if e.is_cancelled()
                        && current.flags.abort_after_client_exits
                        && client_result.is_some() =>
                {
                    // The harness cancelled the session itself once the
                    // client exited; the exchange still counts.
                    return Ok(ChainEnd::Served {
                        client_result,
                        last: current,
                    });
                }
                Err(e) => return Err(e),
            };

            if outcome.aborted {
                listener.continue_or_retire(outcome);
                return Ok(ChainEnd::Aborted);
            }

            // A failure in any hop above aborts the whole chain; reaching
            // here means this hop served its response.
            match current.redirect.take() {
                Some(redirect) => {
                    tracing::debug!(
                        from = current.id,
                        to = redirect.operation.id,
                        keep_alive = redirect.keep_alive,
                        "following redirect"
                    );
                    allow_reuse = redirect.keep_alive;
                    if redirect.keep_alive && outcome.keep_alive {
                        // The follow-up request arrives on this exact
                        // connection, so it must not detour through the
                        // pool where another operation could claim it.
                        carried = outcome.connection;
                    } else {
                        listener.continue_or_retire(outcome);
                    }
                    current = redirect.operation;
                }
                None => {
                    listener.continue_or_retire(outcome);
                    return Ok(ChainEnd::Served {
                        client_result,
                        last: current,
                    });
                }
            }
        }
    }

    async fn validate(&self, observation: &ClientObservation) -> Result<()> {
        if let Some(expected) = self.expected_status {
            if observation.status != expected.code() {
                return Err(HarnessError::UnexpectedStatus {
                    expected: expected.code(),
                    actual: observation.status,
                });
            }
        }
        if !self.handler.lock().await.check_content(&observation.body) {
            return Err(HarnessError::ContentMismatch);
        }
        Ok(())
    }

    fn error_expected(&self, err: &HarnessError) -> bool {
        self.flags.expects_failure()
            && (err.is_transport() || matches!(err, HarnessError::Protocol(_)))
    }
}

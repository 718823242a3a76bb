//! Per-session state machine owning one connection for one operation.
//!
//! # Responsibilities
//! - Walk a session through accept (or reuse), request read, handler
//!   dispatch, response write, and retirement
//! - Route the request path back to its registered operation and fail the
//!   session on unknown paths
//! - Decide whether the connection survives the session for reuse
//!
//! # Data Flow
//! Listener claims/creates a context -> context accepts or adopts a
//! connection -> request is read and dispatched to the handler -> the
//! response (or redirect) is written -> the outcome hands the connection
//! back to the listener or closes it.

use std::sync::Arc;

use futures_util::future::select_all;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::handler::{HandlerAction, PeerInfo};
use super::listener::Listener;
use super::operation::{Operation, PendingRedirect};
use crate::error::{HarnessError, Result};
use crate::http::{HttpRequest, HttpResponse, Status};
use crate::net::connection::Connection;

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting to accept a fresh connection from the socket.
    Listening,
    /// Adopted an idle pooled connection; no accept needed.
    ReuseConnection,
    /// Connection established, waiting for request bytes.
    WaitingForRequest,
    /// A request head is buffered and ready to be served.
    HasRequest,
    /// The response has been written; deciding the connection's fate.
    RequestComplete,
    /// Terminal.
    Closed,
}

/// What a finished session hands back to the listener.
pub struct SessionOutcome {
    pub context_id: u64,
    pub connection: Option<Connection>,
    pub keep_alive: bool,
    pub aborted: bool,
}

/// One session: a single operation served over a single connection. A new
/// context is built per session even when the connection is reused.
pub struct ListenerContext {
    id: u64,
    operation: Arc<Operation>,
    state: ConnectionState,
    connection: Option<Connection>,
    /// Claimed idle connections still competing to carry this session.
    candidates: Vec<Connection>,
    keep_alive: bool,
    aborted: bool,
}

impl ListenerContext {
    pub(crate) fn fresh(id: u64, operation: Arc<Operation>) -> Self {
        ListenerContext {
            id,
            operation,
            state: ConnectionState::Listening,
            connection: None,
            candidates: Vec::new(),
            keep_alive: false,
            aborted: false,
        }
    }

    pub(crate) fn for_reuse(
        id: u64,
        operation: Arc<Operation>,
        candidates: Vec<Connection>,
    ) -> Self {
        ListenerContext {
            id,
            operation,
            state: ConnectionState::ReuseConnection,
            connection: None,
            candidates,
            keep_alive: false,
            aborted: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn candidate_ids(&self) -> Vec<u64> {
        self.candidates.iter().map(|c| c.id()).collect()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the session to completion. `accepted` fires once a connection
    /// is live, so the caller can detect a client running ahead of it.
    pub(crate) async fn run(
        mut self,
        listener: Arc<Listener>,
        cancel: CancellationToken,
        accepted: oneshot::Sender<()>,
    ) -> Result<SessionOutcome> {
        let mut accepted = Some(accepted);
        loop {
            tracing::trace!(context = self.id, state = ?self.state, "session step");
            match self.state {
                ConnectionState::Listening => {
                    let flags = self.operation.flags();
                    match listener
                        .accept_connection(&cancel, flags.server_aborts_handshake)
                        .await?
                    {
                        Some(connection) => {
                            self.connection = Some(connection);
                            self.notify_accepted(&mut accepted);
                            self.state = ConnectionState::WaitingForRequest;
                        }
                        None => {
                            // Accepted at the TCP level, then deliberately
                            // torn down before the handshake.
                            self.notify_accepted(&mut accepted);
                            self.aborted = true;
                            self.state = ConnectionState::Closed;
                        }
                    }
                }
                ConnectionState::ReuseConnection => {
                    self.notify_accepted(&mut accepted);
                    self.adopt_ready_candidate(&listener, &cancel).await?;
                    self.state = ConnectionState::WaitingForRequest;
                }
                ConnectionState::WaitingForRequest => {
                    let connection = self.connection_mut()?;
                    if connection.has_request(&cancel).await? {
                        self.state = ConnectionState::HasRequest;
                    } else if self.operation.flags().client_aborts_handshake {
                        self.aborted = true;
                        self.state = ConnectionState::Closed;
                    } else {
                        self.close_connection().await;
                        return Err(HarnessError::Protocol(
                            "connection closed before a request arrived".into(),
                        ));
                    }
                }
                ConnectionState::HasRequest => {
                    let request = self.connection_mut()?.read_request(&cancel).await?;
                    // Retire the registration only when the path really is
                    // ours; a stray path must not deregister someone else.
                    let matched = request.path == self.operation.path()
                        && listener.take_operation(&request.path).is_some();
                    if !matched {
                        let path = request.path.clone();
                        tracing::warn!(context = self.id, %path, "request for unknown path");
                        self.close_connection().await;
                        return Err(HarnessError::UnknownPath(path));
                    }
                    self.serve(&listener, &cancel, request).await?;
                    self.state = ConnectionState::RequestComplete;
                }
                ConnectionState::RequestComplete => {
                    let flags = self.operation.flags();
                    self.keep_alive = self.keep_alive && flags.keep_alive
                        && !flags.dont_reuse_connection;
                    self.state = ConnectionState::Closed;
                }
                ConnectionState::Closed => {
                    if !self.keep_alive {
                        self.close_connection().await;
                    }
                    tracing::debug!(
                        context = self.id,
                        keep_alive = self.keep_alive,
                        aborted = self.aborted,
                        "session finished"
                    );
                    return Ok(SessionOutcome {
                        context_id: self.id,
                        connection: self.connection.take(),
                        keep_alive: self.keep_alive,
                        aborted: self.aborted,
                    });
                }
            }
        }
    }

    async fn serve(
        &mut self,
        listener: &Arc<Listener>,
        cancel: &CancellationToken,
        request: HttpRequest,
    ) -> Result<()> {
        let peer = {
            let connection = self.connection_mut()?;
            PeerInfo {
                remote_addr: connection.remote_addr(),
                tls: connection.tls_info(),
            }
        };
        let action = self.operation.invoke_handler(&request, &peer).await;
        let action = match action {
            Ok(action) => action,
            Err(e) => {
                let response = HttpResponse::builder()
                    .status(Status::INTERNAL_SERVER_ERROR)
                    .close_connection(true)
                    .build();
                let _ = self.write_response(cancel, &response).await;
                self.close_connection().await;
                return Err(e);
            }
        };
        let response = match action {
            HandlerAction::Respond(response) => response,
            HandlerAction::Redirect {
                target,
                keep_alive,
                status,
            } => {
                let (operation, url) = listener.register_redirect(target, keep_alive)?;
                self.operation.redirect_slot().set(PendingRedirect {
                    operation,
                    keep_alive,
                });
                let mut builder = HttpResponse::builder()
                    .status(status)
                    .header("Location", url.as_str());
                if keep_alive {
                    builder = builder.keep_alive(true);
                } else {
                    builder = builder.close_connection(true);
                }
                builder.build()
            }
        };
        self.keep_alive = request.wants_keep_alive() && response.effective_keep_alive();
        self.write_response(cancel, &response).await
    }

    /// Settle which claimed connection carries this session: the one the
    /// client actually sends its request on. Quiet candidates go back to
    /// the pool with their buffers intact; candidates whose peer hung up
    /// while pooled are closed and dropped.
    async fn adopt_ready_candidate(
        &mut self,
        listener: &Arc<Listener>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            match self.candidates.len() {
                0 => return Err(HarnessError::ConnectionClosed),
                1 => {
                    self.connection = self.candidates.pop();
                    return Ok(());
                }
                _ => {}
            }
            let (winner, ready) = {
                let races = self
                    .candidates
                    .iter_mut()
                    .enumerate()
                    .map(|(index, connection)| {
                        Box::pin(async move { (index, connection.has_request(cancel).await) })
                    })
                    .collect::<Vec<_>>();
                let ((index, ready), _, rest) = select_all(races).await;
                drop(rest);
                (index, ready)
            };
            match ready {
                Ok(true) => {
                    self.connection = Some(self.candidates.swap_remove(winner));
                    for idle in self.candidates.drain(..) {
                        listener.pool_connection(self.id, idle);
                    }
                    return Ok(());
                }
                Ok(false) => {
                    // The peer hung up while this connection sat idle.
                    let mut dead = self.candidates.swap_remove(winner);
                    dead.close().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_response(
        &mut self,
        cancel: &CancellationToken,
        response: &HttpResponse,
    ) -> Result<()> {
        self.connection_mut()?.write_response(response, cancel).await
    }

    fn connection_mut(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or(HarnessError::ConnectionClosed)
    }

    async fn close_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
    }

    fn notify_accepted(&self, accepted: &mut Option<oneshot::Sender<()>>) {
        if let Some(tx) = accepted.take() {
            let _ = tx.send(());
        }
    }
}

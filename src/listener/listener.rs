//! Listener: one bound socket, its operation registry, and its idle pool.
//!
//! # Responsibilities
//! - Own the TCP socket (optionally fronted by TLS) and hand out accepted,
//!   instrumented connections
//! - Register operations under unique `/id/{operation}/{handler}/` paths
//!   and route request paths back to them
//! - Pool keep-alive connections between sessions and arbitrate claims
//!
//! # Design Decisions
//! - There is no background accept loop; the session that needs a fresh
//!   connection performs the accept itself, serialized on the socket lock
//! - Instrumentation is staged on the listener and bound to the next
//!   accepted connection, so hooks apply below any TLS layer

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::TcpListener as TcpSocket;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::context::{ListenerContext, SessionOutcome};
use super::handler::Handler;
use super::operation::{ClaimSlot, Operation, OperationFlags};
use crate::config::ListenerConfig;
use crate::error::{HarnessError, Result};
use crate::http::Status;
use crate::net::connection::Connection;
use crate::net::instrument::{Instrumented, InstrumentationHandle};
use crate::net::tls::TlsProvider;
use crate::net::BoxedTransport;

/// An idle keep-alive connection waiting for its next session.
struct IdleEntry {
    context_id: u64,
    connection: Connection,
    claim: ClaimSlot,
}

#[derive(Default)]
struct ListenerState {
    registry: HashMap<String, Arc<Operation>>,
    pool: Vec<IdleEntry>,
}

/// A bound test server socket with its registered operations.
pub struct Listener {
    local_addr: SocketAddr,
    socket: tokio::sync::Mutex<TcpSocket>,
    tls: Option<TlsProvider>,
    state: StdMutex<ListenerState>,
    next_operation_id: AtomicU64,
    next_context_id: AtomicU64,
    next_connection_id: AtomicU64,
    staged_instrumentation: StdMutex<Option<InstrumentationHandle>>,
    cancel: CancellationToken,
}

impl Listener {
    /// Bind a plaintext listener. Use `"127.0.0.1:0"` for an ephemeral port.
    pub async fn bind(addr: &str) -> Result<Arc<Self>> {
        Self::bind_inner(addr, None).await
    }

    /// Bind a TLS listener fronted by the given provider.
    pub async fn bind_with_tls(addr: &str, tls: TlsProvider) -> Result<Arc<Self>> {
        Self::bind_inner(addr, Some(tls)).await
    }

    /// Bind according to a loaded configuration section.
    pub async fn from_config(config: &ListenerConfig) -> Result<Arc<Self>> {
        let tls = match &config.tls {
            Some(tls_config) => Some(TlsProvider::from_config(tls_config)?),
            None => None,
        };
        Self::bind_inner(&config.bind_address, tls).await
    }

    async fn bind_inner(addr: &str, tls: Option<TlsProvider>) -> Result<Arc<Self>> {
        let socket = TcpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        tracing::info!(%local_addr, tls = tls.is_some(), "listener bound");
        Ok(Arc::new(Listener {
            local_addr,
            socket: tokio::sync::Mutex::new(socket),
            tls,
            state: StdMutex::new(ListenerState::default()),
            next_operation_id: AtomicU64::new(0),
            next_context_id: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(0),
            staged_instrumentation: StdMutex::new(None),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Root URL of this listener, `http` or `https` by configuration.
    pub fn base_url(&self) -> Result<Url> {
        let scheme = if self.is_tls() { "https" } else { "http" };
        Url::parse(&format!("{}://{}/", scheme, self.local_addr))
            .map_err(|e| HarnessError::Config(format!("listener url: {}", e)))
    }

    /// Register an operation and return it with its absolute URL.
    ///
    /// Paths follow `/id/{operationId}/{handlerName}/`; the id is unique
    /// within this listener, so the path can never collide.
    pub fn register_operation(
        &self,
        handler: Box<dyn Handler>,
        flags: OperationFlags,
        expected_status: Option<Status>,
    ) -> Result<(Arc<Operation>, Url)> {
        let id = self.next_operation_id.fetch_add(1, Ordering::Relaxed) + 1;
        let path = format!("/id/{}/{}/", id, handler.name());
        let operation = Arc::new(Operation::new(id, path.clone(), handler, flags, expected_status));

        let url = self
            .base_url()?
            .join(&path)
            .map_err(|e| HarnessError::Config(format!("operation url: {}", e)))?;

        let mut state = self.state.lock().unwrap();
        state.registry.insert(path.clone(), Arc::clone(&operation));
        tracing::debug!(operation = id, %path, "operation registered");
        Ok((operation, url))
    }

    /// Register the target of a redirect as its own operation. The redirect
    /// hop inherits keep-alive so the follow-up can reuse the connection.
    pub(crate) fn register_redirect(
        &self,
        handler: Box<dyn Handler>,
        keep_alive: bool,
    ) -> Result<(Arc<Operation>, Url)> {
        let flags = OperationFlags {
            keep_alive,
            ..OperationFlags::default()
        };
        self.register_operation(handler, flags, None)
    }

    /// Look up the operation registered under a request path.
    pub fn operation(&self, path: &str) -> Option<Arc<Operation>> {
        self.state.lock().unwrap().registry.get(path).cloned()
    }

    /// Match a request path to its pending operation, retiring the
    /// registration. Each registered path serves exactly one request.
    pub(crate) fn take_operation(&self, path: &str) -> Option<Arc<Operation>> {
        self.state.lock().unwrap().registry.remove(path)
    }

    /// Build the context that will serve `operation`: one adopting the
    /// `carried` connection a redirect hop handed over, one racing every
    /// claimable idle connection, or a fresh one that accepts its own.
    /// Returns whether an existing connection was adopted.
    ///
    /// Reuse claims *all* unclaimed pool entries rather than one: the
    /// harness cannot know which pooled socket the client script is about
    /// to write on, so the context watches every candidate and returns the
    /// quiet ones once one of them produces a request.
    pub(crate) async fn find_or_create_context(
        &self,
        operation: &Arc<Operation>,
        allow_reuse: bool,
        carried: Option<Connection>,
    ) -> Result<(ListenerContext, bool)> {
        let context_id = self.next_context_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(connection) = carried {
            tracing::debug!(
                operation = operation.id(),
                context = context_id,
                "adopting carried connection"
            );
            return Ok((
                ListenerContext::for_reuse(context_id, Arc::clone(operation), vec![connection]),
                true,
            ));
        }
        if allow_reuse {
            let candidates = {
                let mut state = self.state.lock().unwrap();
                let mut claimed = Vec::new();
                let mut index = 0;
                while index < state.pool.len() {
                    if state.pool[index].claim.try_claim(operation.id()) {
                        claimed.push(state.pool.swap_remove(index).connection);
                    } else {
                        index += 1;
                    }
                }
                claimed
            };
            if !candidates.is_empty() {
                tracing::debug!(
                    operation = operation.id(),
                    context = context_id,
                    candidates = candidates.len(),
                    "reusing idle connections"
                );
                return Ok((
                    ListenerContext::for_reuse(context_id, Arc::clone(operation), candidates),
                    true,
                ));
            }
        }
        Ok((ListenerContext::fresh(context_id, Arc::clone(operation)), false))
    }

    /// Take a finished session's connection back into the pool, or let it
    /// drop if the session closed it.
    pub(crate) fn continue_or_retire(&self, outcome: SessionOutcome) {
        if !outcome.keep_alive {
            return;
        }
        let Some(connection) = outcome.connection else {
            return;
        };
        self.pool_connection(outcome.context_id, connection);
    }

    /// Return an idle connection to the pool with a fresh claim slot.
    pub(crate) fn pool_connection(&self, context_id: u64, connection: Connection) {
        tracing::debug!(context = context_id, "pooling idle connection");
        self.state.lock().unwrap().pool.push(IdleEntry {
            context_id,
            connection,
            claim: ClaimSlot::new(),
        });
    }

    /// How many session contexts this listener has created so far.
    pub fn contexts_created(&self) -> u64 {
        self.next_context_id.load(Ordering::Relaxed)
    }

    /// Number of idle pooled connections, for tests and diagnostics.
    pub fn idle_connections(&self) -> usize {
        self.state.lock().unwrap().pool.len()
    }

    /// Accept one connection, run the TLS handshake if configured, and wire
    /// in any staged instrumentation. With `abort_handshake` the raw stream
    /// is dropped before (or instead of) the handshake.
    pub(crate) async fn accept_connection(
        &self,
        cancel: &CancellationToken,
        abort_handshake: bool,
    ) -> Result<Option<Connection>> {
        let (stream, remote_addr) = {
            let socket = self.socket.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                res = socket.accept() => res?,
            }
        };

        if abort_handshake {
            tracing::debug!(%remote_addr, "dropping connection before handshake");
            drop(stream);
            return Ok(None);
        }

        let _ = stream.set_nodelay(true);
        let local_addr = stream.local_addr()?;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;

        let handle = self
            .staged_instrumentation
            .lock()
            .unwrap()
            .take()
            .unwrap_or_default();
        let instrumented = Instrumented::with_handle(stream, handle.clone());

        let connection = match &self.tls {
            Some(provider) => {
                let handshake = provider.create_server_stream(instrumented);
                let (tls_stream, tls_info) = tokio::select! {
                    _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                    res = handshake => res?,
                };
                Connection::new(
                    connection_id,
                    Box::new(tls_stream) as BoxedTransport,
                    remote_addr,
                    local_addr,
                )
                .with_tls_info(tls_info)
                .with_instrumentation(handle)
            }
            None => Connection::new(
                connection_id,
                Box::new(instrumented) as BoxedTransport,
                remote_addr,
                local_addr,
            )
            .with_instrumentation(handle),
        };

        tracing::debug!(connection = connection_id, %remote_addr, "connection accepted");
        Ok(Some(connection))
    }

    /// Stage an instrumentation handle: it binds to the next accepted
    /// connection, below the TLS layer if one is configured.
    pub fn prepare_instrumentation(&self) -> InstrumentationHandle {
        let handle = InstrumentationHandle::new();
        *self.staged_instrumentation.lock().unwrap() = Some(handle.clone());
        handle
    }

    /// Cancel in-flight sessions and drop pooled connections.
    pub fn shutdown(&self) {
        tracing::info!(local_addr = %self.local_addr, "listener shutting down");
        self.cancel.cancel();
        self.state.lock().unwrap().pool.clear();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

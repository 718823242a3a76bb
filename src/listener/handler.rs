//! Pluggable request handlers.
//!
//! A Handler produces the response for one request and may instead ask for
//! a redirect to a different handler on the same or a new connection.
//! Handlers are cloneable because every registered request gets an
//! independent copy; per-request mutable state (such as "have I already
//! issued my challenge") must not leak across retries.

use async_trait::async_trait;
use std::net::SocketAddr;

use crate::error::{HarnessError, Result};
use crate::http::{HttpRequest, HttpResponse, Status};
use crate::net::tls::TlsInfo;
use crate::proxy::auth::{AuthDecision, AuthenticationManager, BasicAuth};

/// Facts about the connection a request arrived on, visible to handlers.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub remote_addr: SocketAddr,
    pub tls: TlsInfo,
}

/// What a handler decided to do with a request.
pub enum HandlerAction {
    /// Send this response and finish the exchange.
    Respond(HttpResponse),
    /// Continue the logical operation via `target`, on the same connection
    /// when `keep_alive` or a fresh one otherwise.
    Redirect {
        target: Box<dyn Handler>,
        keep_alive: bool,
        status: Status,
    },
}

/// The capability "produce an HttpResponse given an HttpRequest".
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short type name used in registered paths (`/id/{id}/{name}/`).
    fn name(&self) -> &'static str;

    /// Independent copy for a new registration.
    fn clone_handler(&self) -> Box<dyn Handler>;

    async fn handle(&mut self, request: &HttpRequest, peer: &PeerInfo) -> Result<HandlerAction>;

    /// Validate the body the client ultimately observed.
    fn check_content(&self, _body: &[u8]) -> bool {
        true
    }
}

/// Canned-response handler.
pub struct HelloHandler {
    body: String,
}

impl HelloHandler {
    pub fn new() -> Self {
        Self::with_body("hello")
    }

    pub fn with_body(body: impl Into<String>) -> Self {
        HelloHandler { body: body.into() }
    }
}

impl Default for HelloHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for HelloHandler {
    fn name(&self) -> &'static str {
        "Hello"
    }

    fn clone_handler(&self) -> Box<dyn Handler> {
        Box::new(HelloHandler {
            body: self.body.clone(),
        })
    }

    async fn handle(&mut self, request: &HttpRequest, _peer: &PeerInfo) -> Result<HandlerAction> {
        Ok(HandlerAction::Respond(
            HttpResponse::builder()
                .status(Status::OK)
                .header("Content-Type", "text/plain")
                .body(self.body.as_bytes().to_vec())
                .keep_alive(request.wants_keep_alive())
                .build(),
        ))
    }

    fn check_content(&self, body: &[u8]) -> bool {
        body == self.body.as_bytes()
    }
}

/// POST/PUT handler that matches the received body against an expectation
/// and echoes it back.
pub struct PostEchoHandler {
    expected_body: Option<Vec<u8>>,
}

impl PostEchoHandler {
    pub fn new() -> Self {
        PostEchoHandler {
            expected_body: None,
        }
    }

    pub fn expecting(body: impl Into<Vec<u8>>) -> Self {
        PostEchoHandler {
            expected_body: Some(body.into()),
        }
    }
}

impl Default for PostEchoHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for PostEchoHandler {
    fn name(&self) -> &'static str {
        "PostEcho"
    }

    fn clone_handler(&self) -> Box<dyn Handler> {
        Box::new(PostEchoHandler {
            expected_body: self.expected_body.clone(),
        })
    }

    async fn handle(&mut self, request: &HttpRequest, _peer: &PeerInfo) -> Result<HandlerAction> {
        if !request.method.allows_body() {
            return Ok(HandlerAction::Respond(
                HttpResponse::builder()
                    .status(Status::BAD_REQUEST)
                    .body(b"body-carrying method required".to_vec())
                    .keep_alive(false)
                    .build(),
            ));
        }

        if let Some(expected) = &self.expected_body {
            if request.body != *expected {
                tracing::warn!(
                    expected = expected.len(),
                    got = request.body.len(),
                    "request body mismatch"
                );
                return Ok(HandlerAction::Respond(
                    HttpResponse::builder()
                        .status(Status::BAD_REQUEST)
                        .body(b"body mismatch".to_vec())
                        .keep_alive(false)
                        .build(),
                ));
            }
        }

        Ok(HandlerAction::Respond(
            HttpResponse::builder()
                .status(Status::OK)
                .body(request.body.clone())
                .keep_alive(request.wants_keep_alive())
                .build(),
        ))
    }

    fn check_content(&self, body: &[u8]) -> bool {
        match &self.expected_body {
            Some(expected) => body == expected.as_slice(),
            None => true,
        }
    }
}

/// Wraps another handler behind an authentication challenge.
///
/// The first request without valid credentials receives a 401 challenge on
/// a kept-alive connection; a correctly authenticated retry is delegated to
/// the inner handler.
pub struct AuthChallengeHandler {
    manager: AuthenticationManager,
    inner: Box<dyn Handler>,
}

impl AuthChallengeHandler {
    pub fn new(inner: Box<dyn Handler>, username: &str, password: &str) -> Self {
        AuthChallengeHandler {
            manager: AuthenticationManager::new(std::sync::Arc::new(BasicAuth::new(
                username, password,
            ))),
            inner,
        }
    }

    fn with_manager(inner: Box<dyn Handler>, manager: AuthenticationManager) -> Self {
        AuthChallengeHandler { manager, inner }
    }
}

#[async_trait]
impl Handler for AuthChallengeHandler {
    fn name(&self) -> &'static str {
        "AuthChallenge"
    }

    fn clone_handler(&self) -> Box<dyn Handler> {
        Box::new(AuthChallengeHandler::with_manager(
            self.inner.clone_handler(),
            self.manager.fresh(),
        ))
    }

    async fn handle(&mut self, request: &HttpRequest, peer: &PeerInfo) -> Result<HandlerAction> {
        match self.manager.evaluate(request.headers.get("Authorization")) {
            AuthDecision::Accept => self.inner.handle(request, peer).await,
            AuthDecision::Challenge(challenge) => Ok(HandlerAction::Respond(
                HttpResponse::builder()
                    .status(Status::UNAUTHORIZED)
                    .header("WWW-Authenticate", challenge)
                    .keep_alive(true)
                    .build(),
            )),
            AuthDecision::Reject => Ok(HandlerAction::Respond(
                HttpResponse::builder()
                    .status(Status::UNAUTHORIZED)
                    .keep_alive(false)
                    .build(),
            )),
        }
    }

    fn check_content(&self, body: &[u8]) -> bool {
        self.inner.check_content(body)
    }
}

/// Issues a redirect to `target`, optionally on a fresh connection.
pub struct RedirectHandler {
    target: Option<Box<dyn Handler>>,
    keep_alive: bool,
    status: Status,
}

impl RedirectHandler {
    pub fn new(target: Box<dyn Handler>, keep_alive: bool) -> Self {
        RedirectHandler {
            target: Some(target),
            keep_alive,
            status: Status::FOUND,
        }
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    fn name(&self) -> &'static str {
        "Redirect"
    }

    fn clone_handler(&self) -> Box<dyn Handler> {
        Box::new(RedirectHandler {
            target: self.target.as_ref().map(|t| t.clone_handler()),
            keep_alive: self.keep_alive,
            status: self.status,
        })
    }

    async fn handle(&mut self, _request: &HttpRequest, _peer: &PeerInfo) -> Result<HandlerAction> {
        let target = self.target.take().ok_or_else(|| {
            HarnessError::Protocol("redirect handler invoked more than once".into())
        })?;
        Ok(HandlerAction::Redirect {
            target,
            keep_alive: self.keep_alive,
            status: self.status,
        })
    }

    fn check_content(&self, body: &[u8]) -> bool {
        match &self.target {
            // Once the redirect fired, the target operation validates the
            // final body itself as the last hop of the chain.
            None => true,
            Some(target) => target.check_content(body),
        }
    }
}

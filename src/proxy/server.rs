//! Minimal forward proxy for exercising client proxy code paths.
//!
//! # Responsibilities
//! - Accept client connections on its own socket, one task per connection
//! - Serve CONNECT by dialing the requested authority and tunneling bytes
//! - Serve plain requests by forwarding them to the configured target
//! - Enforce proxy credentials with a 407 challenge when configured
//!
//! # Design Decisions
//! - The proxy never inspects tunneled bytes; TLS through CONNECT stays
//!   end to end between client and origin
//! - Forwarded exchanges are one-shot: the upstream response is rewritten
//!   to `Connection: close` and the client socket is dropped after it

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::auth::{AuthScheme, BasicAuth};
use super::tunnel;
use crate::config::ProxyConfig;
use crate::error::{HarnessError, Result};
use crate::http::{framing, HttpRequest, HttpResponse, Method, Status};

/// A running forward proxy bound to its own port.
pub struct ProxyServer {
    local_addr: SocketAddr,
    target: Option<String>,
    auth: Option<Arc<dyn AuthScheme>>,
    cancel: CancellationToken,
}

impl ProxyServer {
    /// Bind the proxy and start its accept loop.
    pub async fn bind(config: &ProxyConfig) -> Result<Arc<Self>> {
        let socket = TcpListener::bind(&config.bind_address).await?;
        let local_addr = socket.local_addr()?;

        let auth: Option<Arc<dyn AuthScheme>> = match &config.auth {
            Some(auth_config) => {
                if !auth_config.scheme.eq_ignore_ascii_case("basic") {
                    return Err(HarnessError::Config(format!(
                        "unsupported proxy auth scheme: {}",
                        auth_config.scheme
                    )));
                }
                Some(Arc::new(BasicAuth::new(
                    &auth_config.username,
                    &auth_config.password,
                )))
            }
            None => None,
        };

        let server = Arc::new(ProxyServer {
            local_addr,
            target: config.target.clone(),
            auth,
            cancel: CancellationToken::new(),
        });

        tracing::info!(%local_addr, "proxy bound");
        tokio::spawn(Arc::clone(&server).accept_loop(socket));
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients should configure as their proxy.
    pub fn proxy_url(&self) -> Result<Url> {
        Url::parse(&format!("http://{}/", self.local_addr))
            .map_err(|e| HarnessError::Config(format!("proxy url: {}", e)))
    }

    pub fn shutdown(&self) {
        tracing::info!(local_addr = %self.local_addr, "proxy shutting down");
        self.cancel.cancel();
    }

    async fn accept_loop(self: Arc<Self>, socket: TcpListener) {
        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = socket.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "proxy accept failed");
                        continue;
                    }
                },
            };
            tracing::debug!(%remote_addr, "proxy connection accepted");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    if !e.is_cancelled() {
                        tracing::debug!(%remote_addr, error = %e, "proxy connection ended");
                    }
                }
            });
        }
    }

    async fn serve_connection(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let cancel = self.cancel.clone();
        let peer = stream.peer_addr()?;
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let request = framing::read_request(&mut stream, &mut buf, &cancel).await?;

        if !self.authorized(&request) {
            let challenge = match &self.auth {
                Some(scheme) => scheme.challenge(),
                None => String::new(),
            };
            let response = HttpResponse::builder()
                .status(Status::PROXY_AUTH_REQUIRED)
                .header("Proxy-Authenticate", challenge)
                .close_connection(true)
                .build();
            framing::write_response(&mut stream, &response, &cancel).await?;
            return Ok(());
        }

        match request.method {
            Method::Connect => self.serve_tunnel(stream, buf, request).await,
            _ => self.serve_forward(stream, request, peer.ip()).await,
        }
    }

    fn authorized(&self, request: &HttpRequest) -> bool {
        let Some(scheme) = &self.auth else {
            return true;
        };
        let Some(header) = request.headers.get("Proxy-Authorization") else {
            return false;
        };
        header
            .strip_prefix(scheme.scheme())
            .and_then(|rest| rest.strip_prefix(' '))
            .map(|credentials| scheme.verify(credentials.trim()))
            .unwrap_or(false)
    }

    /// CONNECT: dial the authority, confirm the tunnel, then shuttle bytes
    /// until either side closes. Bytes the client sent ahead of the
    /// confirmation are flushed upstream first.
    async fn serve_tunnel(
        &self,
        mut stream: TcpStream,
        leftover: BytesMut,
        request: HttpRequest,
    ) -> Result<()> {
        let authority = request.path.clone();
        let mut upstream = match TcpStream::connect(&authority).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::debug!(%authority, error = %e, "tunnel dial failed");
                let response = HttpResponse::builder()
                    .status(Status::BAD_GATEWAY)
                    .close_connection(true)
                    .build();
                framing::write_response(&mut stream, &response, &self.cancel).await?;
                return Err(HarnessError::Io(e));
            }
        };

        stream
            .write_all(b"HTTP/1.0 200 Connection Established\r\n\r\n")
            .await?;
        stream.flush().await?;

        if !leftover.is_empty() {
            upstream.write_all(&leftover).await?;
        }

        tracing::debug!(%authority, "tunnel established");
        tunnel::relay(stream, upstream, &self.cancel).await?;
        Ok(())
    }

    /// Plain request: forward to the configured target and copy one
    /// response back, demoting the exchange to `Connection: close`.
    async fn serve_forward(
        &self,
        mut stream: TcpStream,
        request: HttpRequest,
        peer: IpAddr,
    ) -> Result<()> {
        let Some(target) = &self.target else {
            let response = HttpResponse::builder()
                .status(Status::BAD_GATEWAY)
                .close_connection(true)
                .build();
            framing::write_response(&mut stream, &response, &self.cancel).await?;
            return Err(HarnessError::Config(
                "forward request without a configured target".into(),
            ));
        };

        let outbound = rewrite_for_upstream(request, peer)?;

        let mut upstream = TcpStream::connect(target).await?;
        framing::write_request(&mut upstream, &outbound, &self.cancel).await?;

        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut response =
            framing::read_response(&mut upstream, &mut buf, &self.cancel).await?;
        response.headers.remove("Proxy-Connection");
        response.headers.set("Connection", "close");
        response.close_connection = true;

        framing::write_response(&mut stream, &response, &self.cancel).await?;
        Ok(())
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turn a proxy-form request into the origin-form request sent upstream,
/// recording the connecting client in `X-Forwarded-For`.
fn rewrite_for_upstream(mut request: HttpRequest, peer: IpAddr) -> Result<HttpRequest> {
    if request.path.starts_with("http://") || request.path.starts_with("https://") {
        let url = Url::parse(&request.path)
            .map_err(|e| HarnessError::Protocol(format!("bad proxy request target: {}", e)))?;
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        if let Some(host) = url.host_str() {
            let host_value = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            request.headers.set("Host", host_value);
        }
        request.path = path;
    }
    request.headers.remove("Proxy-Authorization");
    request.headers.remove("Proxy-Connection");
    request.headers.set("X-Forwarded-For", peer.to_string());
    Ok(request)
}

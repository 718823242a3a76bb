//! Shared raw-socket client helpers for integration tests.
//!
//! Tests drive the server with hand-written clients over plain
//! `TcpStream`s so they control exactly when connections open, reuse, and
//! close.

#![allow(dead_code)]

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use http_harness::http::framing;
use http_harness::http::{HttpRequest, HttpResponse, Method};
use http_harness::listener::ClientObservation;

/// Send one GET and read one framed response on an existing stream.
pub async fn exchange(
    stream: &mut TcpStream,
    path: &str,
) -> http_harness::error::Result<HttpResponse> {
    exchange_request(stream, HttpRequest::new(Method::Get, path)).await
}

/// Send an arbitrary request and read one framed response.
pub async fn exchange_request(
    stream: &mut TcpStream,
    request: HttpRequest,
) -> http_harness::error::Result<HttpResponse> {
    let cancel = CancellationToken::new();
    framing::write_request(stream, &request, &cancel).await?;
    let mut buf = BytesMut::with_capacity(8 * 1024);
    framing::read_response(stream, &mut buf, &cancel).await
}

/// One-shot client: connect, GET `path`, observe status and body.
pub async fn one_shot_get(
    addr: std::net::SocketAddr,
    path: String,
) -> http_harness::error::Result<ClientObservation> {
    let mut stream = TcpStream::connect(addr).await?;
    let response = exchange(&mut stream, &path).await?;
    let _ = stream.shutdown().await;
    Ok(ClientObservation {
        status: response.status.code(),
        body: response.body,
    })
}

pub fn observe(response: &HttpResponse) -> ClientObservation {
    ClientObservation {
        status: response.status.code(),
        body: response.body.clone(),
    }
}

/// Start a fixed-response HTTP backend and return its address. Each
/// connection gets one response and is then closed.
pub async fn start_fixed_backend(body: &'static str) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut stream = BufStream::new(socket);
                // Drain the request head before answering.
                let mut buf = BytesMut::with_capacity(2048);
                let cancel = CancellationToken::new();
                let _ = framing::read_request(&mut stream, &mut buf, &cancel).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.flush().await;
                let _ = stream.get_mut().shutdown().await;
            });
        }
    });
    addr
}

/// Start a raw byte-echo backend and return its address.
pub async fn start_echo_backend() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

//! Async HTTP/1.x message framing.
//!
//! # Responsibilities
//! - Read request/response heads incrementally and parse them with httparse
//! - Read Content-Length bodies
//! - Write messages either as head-then-body or as one blob
//!
//! Leftover bytes past a parsed message stay in the caller's buffer so
//! pipelined requests and CONNECT payloads are never lost.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{Headers, HttpRequest, HttpResponse, Method, Status, Version, MAX_HEADERS};
use crate::error::{HarnessError, Result};

/// Read one framed request (head + Content-Length body) from `stream`.
///
/// `buf` carries partial data across calls; bytes beyond this request are
/// left in place.
pub async fn read_request<R>(
    stream: &mut R,
    buf: &mut BytesMut,
    cancel: &CancellationToken,
) -> Result<HttpRequest>
where
    R: AsyncRead + Unpin,
{
    let mut request = loop {
        if let Some(request) = try_parse_request(buf)? {
            break request;
        }
        if fill(stream, buf, cancel).await? == 0 {
            return Err(HarnessError::ConnectionClosed);
        }
    };

    let body_len = request.headers.content_length().unwrap_or(0);
    request.body = read_exact_body(stream, buf, body_len, cancel).await?;
    Ok(request)
}

/// Read one framed response from `stream`.
pub async fn read_response<R>(
    stream: &mut R,
    buf: &mut BytesMut,
    cancel: &CancellationToken,
) -> Result<HttpResponse>
where
    R: AsyncRead + Unpin,
{
    let mut response = loop {
        if let Some(response) = try_parse_response(buf)? {
            break response;
        }
        if fill(stream, buf, cancel).await? == 0 {
            return Err(HarnessError::ConnectionClosed);
        }
    };

    let body_len = response.headers.content_length().unwrap_or(0);
    response.body = read_exact_body(stream, buf, body_len, cancel).await?;
    Ok(response)
}

/// Write a response, honoring its `write_as_blob` metadata.
pub async fn write_response<W>(
    stream: &mut W,
    response: &HttpResponse,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if response.write_as_blob {
        write_all(stream, &response.to_wire(), cancel).await?;
    } else {
        write_all(stream, &response.head_bytes(), cancel).await?;
        stream.flush().await?;
        write_all(stream, &response.body, cancel).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Write a full request.
pub async fn write_request<W>(
    stream: &mut W,
    request: &HttpRequest,
    cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_all(stream, &request.to_wire(), cancel).await?;
    stream.flush().await?;
    Ok(())
}

/// One cancellable read into `buf`. Returns the number of bytes read;
/// zero means EOF.
pub async fn fill<R>(
    stream: &mut R,
    buf: &mut BytesMut,
    cancel: &CancellationToken,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(HarnessError::Cancelled),
        read = stream.read_buf(buf) => Ok(read?),
    }
}

async fn write_all<W>(stream: &mut W, data: &[u8], cancel: &CancellationToken) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(HarnessError::Cancelled),
        written = stream.write_all(data) => {
            written?;
            Ok(())
        }
    }
}

async fn read_exact_body<R>(
    stream: &mut R,
    buf: &mut BytesMut,
    len: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < len {
        if fill(stream, buf, cancel).await? == 0 {
            return Err(HarnessError::ConnectionClosed);
        }
    }
    Ok(buf.split_to(len).to_vec())
}

/// Attempt to parse a request head from `buf`. On success the head bytes
/// are consumed and a request with an empty body is returned.
fn try_parse_request(buf: &mut BytesMut) -> Result<Option<HttpRequest>> {
    let (consumed, request) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parser = httparse::Request::new(&mut headers);
        match parser.parse(buf) {
            Ok(httparse::Status::Complete(consumed)) => {
                let method = Method::parse(parser.method.unwrap_or(""))?;
                let path = parser.path.unwrap_or("").to_string();
                let version = Version::from_minor(parser.version.unwrap_or(1));
                let headers = copy_headers(parser.headers)?;
                (
                    consumed,
                    HttpRequest {
                        method,
                        path,
                        version,
                        headers,
                        body: Vec::new(),
                    },
                )
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => {
                return Err(HarnessError::Protocol(format!(
                    "malformed request head: {}",
                    e
                )))
            }
        }
    };
    let _ = buf.split_to(consumed);
    Ok(Some(request))
}

/// Attempt to parse a response head from `buf`.
fn try_parse_response(buf: &mut BytesMut) -> Result<Option<HttpResponse>> {
    let (consumed, response) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parser = httparse::Response::new(&mut headers);
        match parser.parse(buf) {
            Ok(httparse::Status::Complete(consumed)) => {
                let status = Status::new(parser.code.unwrap_or(0))?;
                let version = Version::from_minor(parser.version.unwrap_or(1));
                let headers = copy_headers(parser.headers)?;
                let keep_alive = match headers.get("Connection") {
                    Some(v) if v.eq_ignore_ascii_case("close") => false,
                    Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
                    _ => version == Version::Http11,
                };
                let mut response = HttpResponse::new(status);
                response.version = version;
                response.headers = headers;
                response.keep_alive = keep_alive;
                (consumed, response)
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => {
                return Err(HarnessError::Protocol(format!(
                    "malformed response head: {}",
                    e
                )))
            }
        }
    };
    let _ = buf.split_to(consumed);
    Ok(Some(response))
}

fn copy_headers(parsed: &[httparse::Header<'_>]) -> Result<Headers> {
    let mut headers = Headers::new();
    for h in parsed {
        let value = std::str::from_utf8(h.value)
            .map_err(|_| HarnessError::Protocol(format!("non-utf8 value for header {}", h.name)))?;
        headers.insert(h.name, value);
    }
    Ok(headers)
}

//! WebSocket tunneling.
//!
//! # Data Flow
//! ```text
//! client upgrade request
//!     → dial backend, write request head verbatim
//!     → read backend response head
//!     → 101: reply 101 to client, then splice bytes both ways
//!     → other status: relay as-is
//! ```
//!
//! The tunnel ends when either direction finishes (EOF or error); both
//! sockets are closed then.

use std::io;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::proxy::{ProxyBody, ProxyError};
use crate::registry::Backend;

/// Upper bound on a backend response head.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// Upper bound on a non-101 body relayed to the client.
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// `Connection` lists `upgrade` and `Upgrade` is `websocket`, ignoring case.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
    });

    let upgrade_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_upgrade && upgrade_websocket
}

/// Serialize the request line and headers as they go on the wire.
fn request_head<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut head = format!("{} {} {:?}\r\n", req.method(), path, req.version()).into_bytes();

    for (name, value) in req.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// A parsed backend response head plus any bytes read past it.
#[derive(Debug)]
struct ResponseHead {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    rest: Vec<u8>,
}

impl ResponseHead {
    fn content_length(&self) -> Option<usize> {
        self.headers
            .iter()
            .find(|(name, _)| name == hyper::header::CONTENT_LENGTH)
            .and_then(|(_, value)| value.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn parse_response_head(head: &[u8]) -> Option<(StatusCode, Vec<(HeaderName, HeaderValue)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_bytes(parts.next()?.as_bytes()).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
        let value = HeaderValue::from_str(value.trim()).ok()?;
        headers.push((name, value));
    }

    Some((status, headers))
}

async fn read_response_head<S>(stream: &mut S) -> Result<ResponseHead, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await.map_err(ProxyError::Read)?;
        if n == 0 {
            return Err(ProxyError::Read(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed before response head",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let (status, headers) =
                parse_response_head(&buf[..end]).ok_or(ProxyError::MalformedResponse)?;
            return Ok(ResponseHead {
                status,
                headers,
                rest: buf[end..].to_vec(),
            });
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(ProxyError::MalformedResponse);
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == hyper::header::TRANSFER_ENCODING
        || name == hyper::header::CONTENT_LENGTH
        || name == "keep-alive"
}

/// Forward an upgrade request to `backend` and, on 101, tunnel the upgraded
/// client connection to it.
pub async fn serve<B>(mut req: Request<B>, backend: &Backend) -> Result<Response<ProxyBody>, ProxyError> {
    let addr = backend.canonical_addr();
    let mut upstream = TcpStream::connect(&addr).await.map_err(ProxyError::Dial)?;

    upstream
        .write_all(&request_head(&req))
        .await
        .map_err(ProxyError::Write)?;

    let head = read_response_head(&mut upstream).await?;

    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        tracing::info!(backend = %addr, status = %head.status, "Backend refused websocket upgrade");
        return relay_rejection(head, upstream).await;
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &head.headers {
        if !is_hop_by_hop(name) {
            response = response.header(name, value);
        }
    }
    let response = response
        .body(empty())
        .map_err(|_| ProxyError::MalformedResponse)?;

    let on_upgrade = hyper::upgrade::on(&mut req);
    let early = head.rest;
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => tunnel(upgraded, upstream, early).await,
            Err(e) => tracing::warn!(error = %e, "Client upgrade failed"),
        }
    });

    tracing::debug!(backend = %addr, "Websocket upgraded");
    Ok(response)
}

async fn relay_rejection(head: ResponseHead, mut upstream: TcpStream) -> Result<Response<ProxyBody>, ProxyError> {
    let mut body = head.rest.clone();
    if let Some(len) = head.content_length() {
        let len = len.min(MAX_REJECTION_BODY);
        while body.len() < len {
            let mut chunk = vec![0u8; len - body.len()];
            let n = upstream.read(&mut chunk).await.map_err(ProxyError::Read)?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(len);
    } else {
        body.clear();
    }

    let mut response = Response::builder().status(head.status);
    for (name, value) in &head.headers {
        if !is_hop_by_hop(name) && name != CONNECTION {
            response = response.header(name, value);
        }
    }
    response
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed_unsync())
        .map_err(|_| ProxyError::MalformedResponse)
}

fn empty() -> ProxyBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Splice `client` and `upstream` until either direction completes.
async fn tunnel(client: Upgraded, upstream: TcpStream, early: Vec<u8>) {
    let (mut client_rd, mut client_wr) = tokio::io::split(TokioIo::new(client));
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    if !early.is_empty() {
        if let Err(e) = client_wr.write_all(&early).await {
            tracing::debug!(error = %e, "Client closed before tunnel started");
            return;
        }
    }

    let (done_tx, mut done_rx) = mpsc::channel::<(&'static str, io::Result<u64>)>(2);

    let tx = done_tx.clone();
    let to_upstream = tokio::spawn(async move {
        let result = copy_then_shutdown(&mut client_rd, &mut upstream_wr).await;
        let _ = tx.send(("client_to_backend", result)).await;
    });

    let tx = done_tx;
    let to_client = tokio::spawn(async move {
        let result = copy_then_shutdown(&mut upstream_rd, &mut client_wr).await;
        let _ = tx.send(("backend_to_client", result)).await;
    });

    if let Some((direction, result)) = done_rx.recv().await {
        match result {
            Ok(bytes) => tracing::debug!(direction, bytes, "Websocket tunnel closed"),
            Err(e) => tracing::debug!(direction, error = %e, "Websocket tunnel closed with error"),
        }
    }

    to_upstream.abort();
    to_client.abort();
}

async fn copy_then_shutdown<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(reader, writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

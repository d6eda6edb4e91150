//! HTTP version gate.
//!
//! # Responsibilities
//! - Read the first request line before hyper sees the connection
//! - Reject anything that is not HTTP/1.0 or HTTP/1.1 with a raw 400
//! - Replay the consumed bytes to hyper for accepted connections

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Written verbatim to connections speaking an unsupported HTTP version.
pub const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\r\n";

/// Longest request line inspected. Longer lines are left for hyper to judge.
const MAX_REQUEST_LINE: usize = 8 * 1024;

/// Outcome of inspecting the first request line.
#[derive(Debug, PartialEq, Eq)]
pub enum Sniffed {
    /// HTTP/1.x (or undecidable); carries the bytes read so far.
    Http1(Vec<u8>),
    /// Any other protocol version.
    Unsupported,
    /// The peer closed before sending anything.
    Closed,
}

/// Classify a complete request line (without the line terminator).
fn classify(line: &[u8]) -> bool {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let Ok(line) = std::str::from_utf8(line) else {
        return false;
    };

    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let (Some(_method), Some(_target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    version == "HTTP/1.0" || version == "HTTP/1.1"
}

/// Read until the end of the first request line and classify it.
pub async fn sniff_request_line<S>(stream: &mut S) -> io::Result<Sniffed>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(if buf.is_empty() {
                Sniffed::Closed
            } else {
                Sniffed::Http1(buf)
            });
        }
        buf.extend_from_slice(&chunk[..n]);

        // Leading blank lines are tolerated before the request line.
        let start = buf.iter().position(|b| *b != b'\r' && *b != b'\n');
        if let Some(start) = start {
            if let Some(end) = buf[start..].iter().position(|b| *b == b'\n') {
                let line = &buf[start..start + end];
                return Ok(if classify(line) {
                    Sniffed::Http1(buf)
                } else {
                    Sniffed::Unsupported
                });
            }
        }

        if buf.len() > MAX_REQUEST_LINE {
            return Ok(Sniffed::Http1(buf));
        }
    }
}

/// Answer an unsupported connection with the raw 400 and close it.
pub async fn reject<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(BAD_REQUEST_RESPONSE).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// A stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct Prefixed<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    /// Replay `prefix`, already read from `inner`, ahead of the rest of the stream.
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    /// Unwrap the stream. Any unread prefix bytes are lost.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sniff(input: &[u8]) -> Sniffed {
        let (mut client, mut server) = tokio::io::duplex(16 * 1024);
        client.write_all(input).await.unwrap();
        drop(client);
        sniff_request_line(&mut server).await.unwrap()
    }

    #[test]
    fn test_classify() {
        assert!(classify(b"GET / HTTP/1.1\r"));
        assert!(classify(b"POST /x?y HTTP/1.0"));
        assert!(!classify(b"GET / HTTP/1.2\r"));
        assert!(!classify(b"GET / HTTP/2.0\r"));
        assert!(!classify(b"PRI * HTTP/2.0\r"));
        assert!(!classify(b"GET /\r"));
        assert!(!classify(b"GET / HTTP/1.1 extra\r"));
    }

    #[tokio::test]
    async fn test_http11_is_replayed() {
        let input = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        assert_eq!(sniff(input).await, Sniffed::Http1(input.to_vec()));
    }

    #[tokio::test]
    async fn test_unsupported_versions() {
        assert_eq!(sniff(b"GET / HTTP/0.9\r\n\r\n").await, Sniffed::Unsupported);
        assert_eq!(sniff(b"GET / HTTP/1.5\r\n\r\n").await, Sniffed::Unsupported);
        assert_eq!(sniff(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await, Sniffed::Unsupported);
    }

    #[tokio::test]
    async fn test_empty_connection() {
        assert_eq!(sniff(b"").await, Sniffed::Closed);
    }

    #[tokio::test]
    async fn test_split_request_line() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let sniffer = tokio::spawn(async move { sniff_request_line(&mut server).await.unwrap() });

        client.write_all(b"GET / HT").await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"TP/1.0\r\n").await.unwrap();

        assert_eq!(sniffer.await.unwrap(), Sniffed::Http1(b"GET / HTTP/1.0\r\n".to_vec()));
    }

    #[tokio::test]
    async fn test_prefixed_replays_then_reads_inner() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut stream = Prefixed::new(b"hello".to_vec(), server);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_reject_writes_raw_400() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        reject(&mut server).await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, BAD_REQUEST_RESPONSE);
    }
}

//! Bounded-latency response streaming.
//!
//! # Data Flow
//! ```text
//! backend body frames
//!     → MaxLatencyWriter::write (buffer, no flush)
//!     → Ticker every max_flush_latency → flush
//!     → ChannelSink::flush → one Bytes frame to the client body
//! ```

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::body::Bytes;
use tokio::sync::mpsc;

use crate::lifecycle::ticker::Ticker;

/// Writer that passes bytes straight through and flushes the destination on
/// a fixed interval instead of on every write.
pub struct MaxLatencyWriter<W: Write + Send + 'static> {
    dst: Arc<Mutex<W>>,
    ticker: Ticker,
}

impl<W: Write + Send + 'static> MaxLatencyWriter<W> {
    /// Wrap `dst` and start flushing it every `latency`.
    pub fn new(dst: W, latency: Duration) -> Self {
        let dst = Arc::new(Mutex::new(dst));
        let flusher = Arc::clone(&dst);

        let ticker = Ticker::start("max_latency_flush", latency, move || {
            let mut dst = flusher.lock().expect("latency writer mutex poisoned");
            if let Err(e) = dst.flush() {
                tracing::trace!(error = %e, "Periodic flush failed");
            }
        });

        Self { dst, ticker }
    }

    /// Stop periodic flushing. Later calls do nothing.
    pub fn stop(&self) {
        self.ticker.stop();
    }

    /// False once periodic flushing has stopped.
    pub fn is_running(&self) -> bool {
        self.ticker.is_running()
    }
}

impl<W: Write + Send + 'static> Write for MaxLatencyWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.dst.lock().expect("latency writer mutex poisoned").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dst.lock().expect("latency writer mutex poisoned").flush()
    }
}

/// Buffering writer whose flush hands the buffered bytes to a response body
/// channel as a single frame.
#[derive(Debug)]
pub struct ChannelSink {
    buf: Vec<u8>,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSink {
    /// Sink feeding the body channel `tx`.
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { buf: Vec::new(), tx }
    }
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::take(&mut self.buf));
        self.tx
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

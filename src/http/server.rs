//! Client-facing HTTP server.
//!
//! # Responsibilities
//! - Accept connections from the bounded listener
//! - Gate on the HTTP version before hyper parses the request
//! - Serve HTTP/1 with upgrades, dispatching every request to the proxy
//! - Stop accepting on shutdown and let open connections drain

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::net::sniff::{self, Prefixed, Sniffed};
use crate::net::{ConnectionGuard, ConnectionTracker, Listener};
use crate::proxy::Proxy;

/// HTTP server for the router.
pub struct HttpServer {
    listener: Listener,
    proxy: Arc<Proxy>,
    tracker: ConnectionTracker,
}

impl HttpServer {
    /// Server accepting on `listener` and forwarding every request through `proxy`.
    pub fn new(listener: Listener, proxy: Arc<Proxy>) -> Self {
        Self {
            listener,
            proxy,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Address the proxy listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Handle used to wait for open connections after `run` returns.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let addr = self.listener.local_addr().ok();
        tracing::info!(address = ?addr, "HTTP server starting");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer, permit)) => {
                            let proxy = self.proxy.clone();
                            let guard = self.tracker.track();
                            tokio::spawn(async move {
                                serve_connection(stream, peer, proxy, guard).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("HTTP server received shutdown signal, no longer accepting");
                    break;
                }
            }
        }

        tracing::info!(open_connections = self.tracker.active_count(), "HTTP server stopped");
    }
}

async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, proxy: Arc<Proxy>, guard: ConnectionGuard) {
    let connection_id = guard.id();

    let prefix = match sniff::sniff_request_line(&mut stream).await {
        Ok(Sniffed::Http1(prefix)) => prefix,
        Ok(Sniffed::Unsupported) => {
            tracing::debug!(%connection_id, peer = %peer, "Rejecting unsupported HTTP version");
            if let Err(e) = sniff::reject(&mut stream).await {
                tracing::debug!(%connection_id, error = %e, "Failed to write 400");
            }
            return;
        }
        Ok(Sniffed::Closed) => return,
        Err(e) => {
            tracing::debug!(%connection_id, error = %e, "Failed to read request line");
            return;
        }
    };

    let io = TokioIo::new(Prefixed::new(prefix, stream));
    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        async move { Ok::<_, Infallible>(proxy.handle(req, peer).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        tracing::debug!(%connection_id, peer = %peer, error = %e, "Connection error");
    }
}

//! Request forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! hyper connection (http::server)
//!     → Proxy::handle
//!     → health check | registry lookup (sticky, then host)
//!     → websocket.rs (upgrade tunnel) | backend round trip
//!     → latency.rs (bounded-latency body streaming)
//!     → access_log.rs + varz
//! ```
//!
//! # Design Decisions
//! - One fresh backend connection per request, sent with `Connection: close`
//! - No retries: a transport failure is a 502
//! - Access log records are written once the body has finished streaming

pub mod access_log;
pub mod latency;
pub mod websocket;

use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::Local;
use futures_util::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::observability::Varz;
use crate::registry::{Backend, Registry};

pub use access_log::{AccessLogRecord, AccessLogger};
pub use latency::{ChannelSink, MaxLatencyWriter};

// Trace response headers, set when the request carries the trace key.
pub const VCAP_BACKEND_HEADER: &str = "x-vcap-backend";
pub const VCAP_ROUTER_HEADER: &str = "x-vcap-router";
pub const VCAP_TRACE_HEADER: &str = "x-vcap-trace";

/// Cookie naming the backend instance a sticky session is pinned to.
pub const VCAP_COOKIE_ID: &str = "__VCAP_ID__";

/// User agent of the load balancer heartbeat.
pub const HEALTH_CHECK_USER_AGENT: &str = "HTTP-Monitor/1.1";

/// Response body produced by the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Failure to complete a round trip with a backend.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to connect to backend: {0}")]
    Dial(#[source] std::io::Error),
    #[error("failed to write to backend: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to read from backend: {0}")]
    Read(#[source] std::io::Error),
    #[error("malformed backend response")]
    MalformedResponse,
    #[error("backend round trip failed: {0}")]
    Upstream(#[from] hyper::Error),
}

/// Complete in-memory body.
pub(crate) fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed_unsync()
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let text = format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    let mut response = Response::new(full(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

/// The request's host with any `:port` suffix removed.
pub fn host_without_port(host: &str) -> &str {
    match host.find(':') {
        Some(pos) => &host[..pos],
        None => host,
    }
}

/// Value of cookie `name` from the request's `Cookie` headers.
pub fn request_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Whether any `Set-Cookie` header in the response sets cookie `name`.
pub fn response_sets_cookie(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split_once('='))
        .any(|(key, _)| key.trim() == name)
}

/// Append `ip` to `X-Forwarded-For`, joining existing values with ", ".
pub fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let mut values: Vec<String> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    values.push(ip.to_string());

    if let Ok(value) = HeaderValue::from_str(&values.join(", ")) {
        headers.insert("x-forwarded-for", value);
    }
}

fn is_connection_header(name: &header::HeaderName) -> bool {
    name == header::CONNECTION || name == header::TRANSFER_ENCODING || name == "keep-alive"
}

/// Per-request forwarding to registered backends.
pub struct Proxy {
    registry: Arc<Registry>,
    varz: Arc<Varz>,
    /// Receives one record per request when configured.
    access_logger: Option<AccessLogger>,
    /// Value of `X-Vcap-Trace` that turns on trace headers.
    trace_key: String,
    /// Session cookie whose presence makes a backend sticky.
    sticky_cookie_name: String,
    max_flush_latency: Duration,
    /// Reported in `X-Vcap-Router`.
    router_ip: String,
}

impl Proxy {
    /// `router_ip` is reported in `X-Vcap-Router`. With `access_logger`
    /// unset no access log is written.
    pub fn new(
        config: &ProxyConfig,
        router_ip: impl Into<String>,
        registry: Arc<Registry>,
        varz: Arc<Varz>,
        access_logger: Option<AccessLogger>,
    ) -> Self {
        Self {
            registry,
            varz,
            access_logger,
            trace_key: config.trace_key.clone(),
            sticky_cookie_name: config.sticky_cookie_name.clone(),
            max_flush_latency: config.max_flush_latency(),
            router_ip: router_ip.into(),
        }
    }

    /// Choose a backend, preferring the session's instance when the request
    /// carries both the sticky cookie and `__VCAP_ID__`.
    pub fn lookup(&self, headers: &HeaderMap, host: &str) -> Option<Arc<Backend>> {
        let host = host_without_port(host);

        if request_cookie(headers, &self.sticky_cookie_name).is_some() {
            if let Some(instance) = request_cookie(headers, VCAP_COOKIE_ID) {
                if let Some(backend) = self.registry.lookup_by_private_instance_id(host, instance) {
                    return Some(backend);
                }
            }
        }

        self.registry.lookup(host)
    }

    /// Serve one client request.
    ///
    /// Never fails: lookup misses become 404, backend failures 502. Every
    /// call produces exactly one access log record.
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .unwrap_or("")
            .to_string();

        let record = AccessLogRecord {
            host: host.clone(),
            method: req.method().to_string(),
            uri: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            proto: format!("{:?}", req.version()),
            referer: header_str(req.headers(), header::REFERER).to_string(),
            user_agent: header_str(req.headers(), header::USER_AGENT).to_string(),
            remote_addr: remote_addr.to_string(),
            status: None,
            backend: None,
            started_at: Local::now(),
            first_byte_at: None,
            finished_at: None,
            body_bytes_sent: 0,
        };

        let span = tracing::info_span!("proxy", host = %host, remote_addr = %remote_addr);
        self.serve(req, remote_addr, record).instrument(span).await
    }

    async fn serve<B>(&self, req: Request<B>, remote_addr: SocketAddr, mut record: AccessLogRecord) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let start = Instant::now();

        if header_str(req.headers(), header::USER_AGENT) == HEALTH_CHECK_USER_AGENT {
            let body = "ok\n";
            record.body_bytes_sent = body.len() as u64;
            return self.finish(Response::new(full(body)), record);
        }

        let Some(backend) = self.lookup(req.headers(), &record.host) else {
            self.varz.capture_bad_request();
            tracing::warn!("No route for host");
            return self.finish(status_response(StatusCode::NOT_FOUND), record);
        };

        record.backend = Some(backend.clone());
        self.registry.capture_backend_request(&backend, SystemTime::now());
        self.varz.capture_backend_request(&backend);

        let (mut parts, body) = req.into_parts();
        append_forwarded_for(&mut parts.headers, remote_addr.ip());

        if websocket::is_websocket_upgrade(&parts.headers) {
            let req = Request::from_parts(parts, body);
            let response = match websocket::serve(req, &backend).await {
                Ok(response) => {
                    self.varz
                        .capture_backend_response(&backend, Some(response.status().as_u16()), start.elapsed());
                    response
                }
                Err(e) => {
                    tracing::warn!(backend = %backend.id, error = %e, "Websocket upgrade failed");
                    self.varz.capture_backend_response(&backend, None, start.elapsed());
                    status_response(StatusCode::BAD_GATEWAY)
                }
            };
            return self.finish(response, record);
        }

        let trace = !self.trace_key.is_empty()
            && header_str(&parts.headers, VCAP_TRACE_HEADER) == self.trace_key;

        parts.headers.remove(header::CONNECTION);
        parts
            .headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        parts.uri = origin_form(&parts.uri);
        let req = Request::from_parts(parts, body);

        let upstream = match round_trip(req, &backend).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(backend = %backend.id, error = %e, "Error reading from upstream");
                self.varz.capture_backend_response(&backend, None, start.elapsed());
                return self.finish(status_response(StatusCode::BAD_GATEWAY), record);
            }
        };

        self.varz
            .capture_backend_response(&backend, Some(upstream.status().as_u16()), start.elapsed());
        record.first_byte_at = Some(Local::now());
        record.status = Some(upstream.status().as_u16());

        let (upstream_parts, upstream_body) = upstream.into_parts();
        let mut response = Response::new(self.stream_body(upstream_body, record));
        *response.status_mut() = upstream_parts.status;

        let headers = response.headers_mut();
        for (name, value) in upstream_parts.headers.iter() {
            if !is_connection_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        if trace {
            if let Ok(ip) = HeaderValue::from_str(&self.router_ip) {
                headers.insert(VCAP_ROUTER_HEADER, ip);
            }
            if let Ok(addr) = HeaderValue::from_str(&backend.canonical_addr()) {
                headers.insert(VCAP_BACKEND_HEADER, addr);
            }
        }

        if !backend.private_instance_id.is_empty()
            && response_sets_cookie(&upstream_parts.headers, &self.sticky_cookie_name)
        {
            let cookie = format!("{}={}; Path=/", VCAP_COOKIE_ID, backend.private_instance_id);
            if let Ok(cookie) = HeaderValue::from_str(&cookie) {
                headers.append(header::SET_COOKIE, cookie);
            }
        }

        response
    }

    /// Log a response whose body is already complete.
    fn finish(&self, response: Response<ProxyBody>, mut record: AccessLogRecord) -> Response<ProxyBody> {
        let now = Local::now();
        record.status = Some(response.status().as_u16());
        record.first_byte_at.get_or_insert(now);
        record.finished_at = Some(now);
        if record.body_bytes_sent == 0 {
            record.body_bytes_sent = response.body().size_hint().exact().unwrap_or(0);
        }
        if let Some(logger) = &self.access_logger {
            logger.log(record);
        }
        response
    }

    /// Relay the backend body through a MaxLatencyWriter, logging the request
    /// once the body is done.
    fn stream_body(&self, mut upstream: Incoming, mut record: AccessLogRecord) -> ProxyBody {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let latency = self.max_flush_latency;
        let logger = self.access_logger.clone();

        tokio::spawn(
            async move {
                let mut writer = MaxLatencyWriter::new(ChannelSink::new(tx), latency);
                let mut sent: u64 = 0;

                while let Some(frame) = upstream.frame().await {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::debug!(error = %e, "Backend body ended with error");
                            break;
                        }
                    };
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if let Err(e) = std::io::Write::write_all(&mut writer, &data) {
                        tracing::debug!(error = %e, "Client stopped reading response");
                        break;
                    }
                    sent += data.len() as u64;
                }

                writer.stop();
                let _ = std::io::Write::flush(&mut writer);

                record.finished_at = Some(Local::now());
                record.body_bytes_sent = sent;
                if let Some(logger) = logger {
                    logger.log(record);
                }
            }
            .in_current_span(),
        );

        let frames = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<_, hyper::Error>(Frame::data(chunk)), rx))
        });
        StreamBody::new(frames).boxed_unsync()
    }
}

/// Rewrite an absolute-form URI to origin form.
fn origin_form(uri: &Uri) -> Uri {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    path.parse().unwrap_or_else(|_| Uri::from_static("/"))
}

/// Send `req` to `backend` over a fresh connection.
async fn round_trip<B>(req: Request<B>, backend: &Backend) -> Result<Response<Incoming>, ProxyError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let stream = TcpStream::connect(backend.canonical_addr())
        .await
        .map_err(ProxyError::Dial)?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "Backend connection closed with error");
        }
    });

    Ok(sender.send_request(req).await?)
}

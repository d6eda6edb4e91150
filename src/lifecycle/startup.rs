//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Initialize subsystems in dependency order
//! - Start background tasks (pruning, stats trimming, access log writer)
//! - Bind listeners, then subscribe to the bus and announce the router
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners bind before `router.start` so registrations find a live proxy

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::validation::{validate_config, ValidationError};
use crate::config::RouterConfig;
use crate::http::HttpServer;
use crate::lifecycle::{Shutdown, Ticker};
use crate::mbus::{BusError, MessageBus};
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::observability::{init_metrics, Varz};
use crate::proxy::access_log::AccessLogger;
use crate::proxy::Proxy;
use crate::registry::subscriber::RouterGreeting;
use crate::registry::{Registry, RouteSubscriber};
use crate::status::{self, StatusState};

/// How long the access log writer gets to flush after connections drain.
const ACCESS_LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the router failed to start.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {}", join_errors(.0))]
    Config(Vec<ValidationError>),
    #[error("proxy listener: {0}")]
    Listener(#[from] ListenerError),
    #[error("status server bind {address}: {source}")]
    StatusBind {
        address: String,
        source: std::io::Error,
    },
    #[error("access log {path}: {source}")]
    AccessLog {
        path: String,
        source: std::io::Error,
    },
    #[error("message bus: {0}")]
    Bus(#[from] BusError),
    #[error("metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A running router.
pub struct RouterHandle {
    registry: Arc<Registry>,
    varz: Arc<Varz>,
    greeting: RouterGreeting,
    proxy_addr: SocketAddr,
    status_addr: Option<SocketAddr>,
    shutdown: Shutdown,
    /// Pruning and stats trimming.
    tickers: Vec<Ticker>,
    /// Open proxy connections, drained on shutdown.
    connections: ConnectionTracker,
    server_task: JoinHandle<()>,
    /// Status server and bus subscriber.
    tasks: Vec<JoinHandle<()>>,
    /// Flushed last, after connections drain.
    access_log_task: Option<JoinHandle<()>>,
}

impl RouterHandle {
    /// Address the proxy listener is bound to.
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Status server address, `None` when the status server is disabled.
    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    /// Live routing table.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Traffic statistics behind `/varz`.
    pub fn varz(&self) -> &Arc<Varz> {
        &self.varz
    }

    /// Payload this router answers `router.greet` with.
    pub fn greeting(&self) -> &RouterGreeting {
        &self.greeting
    }

    /// Stop accepting, stop background work and wait up to `drain_timeout`
    /// for open connections to finish.
    pub async fn shutdown(self, drain_timeout: Duration) {
        tracing::info!("Router shutting down");
        self.shutdown.trigger();

        for ticker in &self.tickers {
            ticker.stop();
        }

        if let Err(e) = self.server_task.await {
            tracing::warn!(error = %e, "HTTP server task failed");
        }

        if !self.connections.wait_idle(drain_timeout).await {
            tracing::warn!(
                open_connections = self.connections.active_count(),
                "Drain deadline passed with connections still open"
            );
        }

        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task failed");
            }
        }

        if let Some(task) = self.access_log_task {
            if tokio::time::timeout(ACCESS_LOG_FLUSH_TIMEOUT, task).await.is_err() {
                tracing::warn!("Access log writer did not finish in time");
            }
        }

        tracing::info!("Shutdown complete");
    }
}

/// Start every router component described by `config` on `bus`.
///
/// Listeners are bound before the subscriber announces the router, so a
/// backend reacting to `router.start` finds the proxy already accepting.
/// Dropping the returned handle without calling `shutdown` leaves the
/// server tasks running.
pub async fn start(config: RouterConfig, bus: Arc<dyn MessageBus>) -> Result<RouterHandle, StartupError> {
    validate_config(&config).map_err(StartupError::Config)?;

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr)?;
        }
    }

    let shutdown = Shutdown::new();
    let mut tickers = Vec::new();

    let registry = Arc::new(Registry::new(&config.registry, bus.clone()));
    tickers.extend(registry.start_pruning_cycle());

    let stats = &config.stats;
    tickers.push(
        registry
            .top_apps()
            .start_trimming(stats.top_apps_trim_interval(), stats.top_apps_entry_lifetime()),
    );
    tickers.push(
        registry
            .active_apps()
            .start_trimming(stats.active_apps_trim_interval(), stats.active_apps_entry_lifetime()),
    );

    let varz = Arc::new(Varz::new(registry.clone(), stats.top_apps_entry_lifetime()));

    let (access_logger, access_log_task) = match &config.access_log.path {
        Some(path) => {
            let (logger, task) = AccessLogger::open(Path::new(path))
                .await
                .map_err(|source| StartupError::AccessLog {
                    path: path.clone(),
                    source,
                })?;
            (Some(logger), Some(task))
        }
        None => (None, None),
    };

    let proxy = Arc::new(Proxy::new(
        &config.proxy,
        config.ip.clone(),
        registry.clone(),
        varz.clone(),
        access_logger,
    ));

    let listener = Listener::bind(&config.listener).await?;
    let server = HttpServer::new(listener, proxy);
    let proxy_addr = server.local_addr().map_err(ListenerError::Bind)?;
    let connections = server.tracker();
    let server_task = tokio::spawn(server.run(shutdown.subscribe()));

    let mut tasks = Vec::new();

    let status_addr = if config.status.enabled {
        let status_listener = TcpListener::bind(&config.status.bind_address)
            .await
            .map_err(|source| StartupError::StatusBind {
                address: config.status.bind_address.clone(),
                source,
            })?;
        let addr = status_listener
            .local_addr()
            .map_err(|source| StartupError::StatusBind {
                address: config.status.bind_address.clone(),
                source,
            })?;
        let state = StatusState::new(&config.status, registry.clone(), varz.clone());
        let rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = status::serve(status_listener, state, rx).await {
                tracing::error!(error = %e, "Status server failed");
            }
        }));
        Some(addr)
    } else {
        None
    };

    let greeting = RouterGreeting::new(&config.ip, config.registry.minimum_register_interval_secs);
    let subscriber = RouteSubscriber::new(registry.clone(), bus, greeting.clone());
    tasks.push(subscriber.clone().spawn(shutdown.subscribe())?);
    if let Err(e) = subscriber.announce() {
        tracing::warn!(error = %e, "Failed to announce router start");
    }

    tracing::info!(
        index = config.index,
        router_id = %greeting.id,
        proxy_address = %proxy_addr,
        status_address = ?status_addr,
        "Router started"
    );

    Ok(RouterHandle {
        registry,
        varz,
        greeting,
        proxy_addr,
        status_addr,
        shutdown,
        tickers,
        connections,
        server_task,
        tasks,
        access_log_task,
    })
}

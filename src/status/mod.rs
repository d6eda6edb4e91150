//! Status server.
//!
//! A small axum app next to the proxy listener that exposes router health,
//! the varz document and the route table. Every route sits behind HTTP basic
//! auth when credentials are configured.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::StatusConfig;
use crate::observability::Varz;
use crate::registry::Registry;

use self::auth::{basic_auth_middleware, Credentials};
use self::handlers::{get_healthz, get_routes, get_varz};

/// Shared state for status handlers.
#[derive(Clone)]
pub struct StatusState {
    pub registry: Arc<Registry>,
    pub varz: Arc<Varz>,
    pub credentials: Option<Credentials>,
}

impl StatusState {
    /// Auth is enabled only when `config` sets both user and password.
    pub fn new(config: &StatusConfig, registry: Arc<Registry>, varz: Arc<Varz>) -> Self {
        Self {
            registry,
            varz,
            credentials: Credentials::from_config(config),
        }
    }
}

/// Build the status router with auth and request tracing.
pub fn setup_status_router(state: StatusState) -> Router {
    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/varz", get(get_varz))
        .route("/routes", get(get_routes))
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the status router on `listener` until `shutdown` fires.
///
/// In-flight requests finish before this returns.
pub async fn serve(
    listener: TcpListener,
    state: StatusState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Status server starting");

    axum::serve(listener, setup_status_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Status server stopped");
    Ok(())
}

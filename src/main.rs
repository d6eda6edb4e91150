//! Droplet router.
//!
//! # Architecture Overview
//!
//! ```text
//!                   ┌──────────────────────────────────────────────┐
//!   router.register │  ┌──────────┐    ┌───────────┐               │
//!  ─────────────────┼─▶│   mbus   │───▶│ registry  │◀── pruning    │
//!  router.unregister│  └──────────┘    └─────┬─────┘    ticker     │
//!                   │                        │ lookup              │
//!   Client Request  │  ┌─────────┐    ┌──────▼─────┐               │
//!  ─────────────────┼─▶│  http   │───▶│   proxy    │───────────────┼──▶ Backend
//!                   │  │ server  │    │            │◀──────────────┼─── (droplet)
//!   Client Response │  └─────────┘    └──────┬─────┘               │
//!  ◀────────────────┼────────────────────────┘                     │
//!                   │                                              │
//!                   │  stats · varz · access log · status server   │
//!                   └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use droplet_router::config::{load_config, RouterConfig};
use droplet_router::lifecycle::signals::wait_for_signal;
use droplet_router::mbus::LocalBus;
use droplet_router::observability::init_logging;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "droplet-router")]
#[command(about = "HTTP router for registered application instances", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RouterConfig::default(),
    };

    init_logging(&config.observability);

    tracing::info!("droplet-router v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        status_enabled = config.status.enabled,
        "Configuration loaded"
    );

    let bus = Arc::new(LocalBus::new());
    let router = droplet_router::start(config, bus).await?;

    wait_for_signal().await;
    router.shutdown(DRAIN_TIMEOUT).await;

    Ok(())
}

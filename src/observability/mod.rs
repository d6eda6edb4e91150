//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Registry, proxy, server, status
//!     → logging.rs (tracing subscriber, per-component spans)
//!     → metrics.rs (varz document + metrics facade)
//!
//! Consumers:
//!     → stdout log lines
//!     → /varz on the status server
//!     → Prometheus scrape (optional)
//! ```
//!
//! # Design Decisions
//! - Varz is the source of truth; the metrics facade mirrors it
//! - Counters are atomics; only latency samples and rate buckets take a lock

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{init_metrics, Varz, VarzSnapshot};

//! Usage statistics subsystem.
//!
//! # Data Flow
//! ```text
//! Proxy resolves a backend
//!     → Registry::capture_backend_request
//!     → active_apps.rs (last-seen time per app)
//!     → top_apps.rs (per-second request buckets per app)
//!
//! Background tickers trim both structures; varz reads TopApps for
//! the top10_app_requests report.
//! ```
//!
//! # Design Decisions
//! - Each structure keeps one arena of records and two heaps over it (heap.rs)
//! - Snapshots are heap clones, so reports never disturb live state
//! - Time is bucketed to whole unix seconds

pub mod active_apps;
pub mod heap;
pub mod top_apps;

use std::time::{SystemTime, UNIX_EPOCH};

pub use active_apps::ActiveApps;
pub use top_apps::{TopApps, TopAppsEntry};

/// Whole seconds since the unix epoch; negative before it.
pub(crate) fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

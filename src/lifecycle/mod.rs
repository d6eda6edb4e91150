//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Registry + stats tickers → Varz → Access log
//!     → Proxy listener → Status server → Bus subscriptions → router.start
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Stop tickers → Drain connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: listeners bind before the router announces itself
//! - Shutdown has a drain deadline

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod ticker;

pub use shutdown::Shutdown;
pub use startup::{start, RouterHandle, StartupError};
pub use ticker::Ticker;

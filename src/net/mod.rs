//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking)
//!     → sniff.rs (HTTP version gate, replay prefix)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Unsupported HTTP versions are answered before hyper parses anything

pub mod connection;
pub mod listener;
pub mod sniff;

pub use connection::{ConnectionGuard, ConnectionTracker};
pub use listener::{Listener, ListenerError};

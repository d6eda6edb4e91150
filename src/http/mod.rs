//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (net::listener)
//!     → server.rs (version gate, hyper HTTP/1 with upgrades)
//!     → proxy::Proxy::handle
//!     → Send to client
//! ```

pub mod server;

pub use server::HttpServer;

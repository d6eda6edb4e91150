//! Droplet router library.
//!
//! An HTTP routing tier: backends announce `(host, port, uris)` on a message
//! bus, the registry keeps the route table, and the proxy forwards each
//! client request to a backend chosen by its `Host` header.

// Core subsystems
pub mod config;
pub mod http;
pub mod mbus;
pub mod net;
pub mod proxy;
pub mod registry;

// Usage tracking and reporting
pub mod stats;
pub mod status;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::RouterConfig;
pub use http::HttpServer;
pub use lifecycle::{start, RouterHandle, Shutdown};
pub use registry::Registry;

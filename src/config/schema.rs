//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the router.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::stats::active_apps::{ACTIVE_APPS_ENTRY_LIFETIME, ACTIVE_APPS_TRIM_INTERVAL};
use crate::stats::top_apps::{TOP_APPS_ENTRY_LIFETIME, TOP_APPS_TRIM_INTERVAL};

/// Root configuration for the router.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Component index, reported to the bus on greet/start.
    pub index: u32,

    /// Address advertised in `X-Vcap-Router` and greet replies.
    pub ip: String,

    /// Proxy listener configuration.
    pub listener: ListenerConfig,

    /// Status server (healthz/varz/routes).
    pub status: StatusConfig,

    /// Route table maintenance.
    pub registry: RegistryConfig,

    /// Per-request forwarding behaviour.
    pub proxy: ProxyConfig,

    /// Usage statistics windows.
    pub stats: StatsConfig,

    /// Access log destination.
    pub access_log: AccessLogConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            index: 0,
            ip: "127.0.0.1".to_string(),
            listener: ListenerConfig::default(),
            status: StatusConfig::default(),
            registry: RegistryConfig::default(),
            proxy: ProxyConfig::default(),
            stats: StatsConfig::default(),
            access_log: AccessLogConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8081").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8081".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Status server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Serve the status endpoints at all.
    pub enabled: bool,

    /// Status server bind address.
    pub bind_address: String,

    /// Basic auth user. Empty user and password disable authentication.
    pub user: String,

    /// Basic auth password.
    pub password: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8082".to_string(),
            user: String::new(),
            password: String::new(),
        }
    }
}

/// Route table maintenance.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often stale droplets are pruned. 0 disables pruning.
    pub prune_stale_droplets_interval_secs: u64,

    /// A droplet not re-registered within this window is stale.
    pub droplet_stale_threshold_secs: u64,

    /// Advertised to backends in greet replies.
    pub minimum_register_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prune_stale_droplets_interval_secs: 30,
            droplet_stale_threshold_secs: 120,
            minimum_register_interval_secs: 5,
        }
    }
}

impl RegistryConfig {
    /// How often stale backends are pruned. Zero disables pruning.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_stale_droplets_interval_secs)
    }

    /// Age after which an unrefreshed registration is pruned.
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.droplet_stale_threshold_secs)
    }
}

/// Per-request forwarding behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Shared secret enabling the trace headers. Empty disables tracing.
    pub trace_key: String,

    /// Cookie whose presence in a backend response triggers session affinity.
    pub sticky_cookie_name: String,

    /// Upper bound on how long streamed response bytes sit unflushed.
    pub max_flush_latency_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            trace_key: String::new(),
            sticky_cookie_name: "JSESSIONID".to_string(),
            max_flush_latency_ms: 50,
        }
    }
}

impl ProxyConfig {
    /// Longest a streamed response chunk may sit in the buffer.
    pub fn max_flush_latency(&self) -> Duration {
        Duration::from_millis(self.max_flush_latency_ms)
    }
}

/// Usage statistics windows.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsConfig {
    pub top_apps_trim_interval_secs: u64,
    pub top_apps_entry_lifetime_secs: u64,
    pub active_apps_trim_interval_secs: u64,
    pub active_apps_entry_lifetime_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            top_apps_trim_interval_secs: TOP_APPS_TRIM_INTERVAL.as_secs(),
            top_apps_entry_lifetime_secs: TOP_APPS_ENTRY_LIFETIME.as_secs(),
            active_apps_trim_interval_secs: ACTIVE_APPS_TRIM_INTERVAL.as_secs(),
            active_apps_entry_lifetime_secs: ACTIVE_APPS_ENTRY_LIFETIME.as_secs(),
        }
    }
}

impl StatsConfig {
    /// How often old top-apps counts are discarded.
    pub fn top_apps_trim_interval(&self) -> Duration {
        Duration::from_secs(self.top_apps_trim_interval_secs)
    }

    /// Window over which `top10_app_requests` counts and averages requests.
    pub fn top_apps_entry_lifetime(&self) -> Duration {
        Duration::from_secs(self.top_apps_entry_lifetime_secs)
    }

    /// How often idle apps are dropped from the active set.
    pub fn active_apps_trim_interval(&self) -> Duration {
        Duration::from_secs(self.active_apps_trim_interval_secs)
    }

    /// Idle time after which an app is no longer active.
    pub fn active_apps_entry_lifetime(&self) -> Duration {
        Duration::from_secs(self.active_apps_entry_lifetime_secs)
    }
}

/// Access log destination.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AccessLogConfig {
    /// File the access log is appended to. No file, no access log.
    pub path: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

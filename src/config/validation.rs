//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (latencies > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RouterConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::RouterConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check every semantic constraint and collect all failures.
pub fn validate_config(config: &RouterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.status.enabled {
        check_addr(&mut errors, "status.bind_address", &config.status.bind_address);
    }
    if config.observability.metrics_enabled {
        check_addr(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if config.listener.max_connections == 0 {
        errors.push(ValidationError {
            field: "listener.max_connections",
            message: "must be greater than 0".to_string(),
        });
    }

    if config.proxy.max_flush_latency_ms == 0 {
        errors.push(ValidationError {
            field: "proxy.max_flush_latency_ms",
            message: "must be greater than 0".to_string(),
        });
    }

    if config.proxy.sticky_cookie_name.trim().is_empty() {
        errors.push(ValidationError {
            field: "proxy.sticky_cookie_name",
            message: "must not be empty".to_string(),
        });
    }

    if config.registry.prune_stale_droplets_interval_secs > 0 && config.registry.droplet_stale_threshold_secs == 0 {
        errors.push(ValidationError {
            field: "registry.droplet_stale_threshold_secs",
            message: "must be greater than 0 when pruning is enabled".to_string(),
        });
    }

    let stats = &config.stats;
    for (field, value) in [
        ("stats.top_apps_trim_interval_secs", stats.top_apps_trim_interval_secs),
        ("stats.top_apps_entry_lifetime_secs", stats.top_apps_entry_lifetime_secs),
        ("stats.active_apps_trim_interval_secs", stats.active_apps_trim_interval_secs),
        ("stats.active_apps_entry_lifetime_secs", stats.active_apps_entry_lifetime_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError {
                field,
                message: "must be greater than 0".to_string(),
            });
        }
    }

    if config.status.user.is_empty() != config.status.password.is_empty() {
        errors.push(ValidationError {
            field: "status.user",
            message: "user and password must be set together".to_string(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if let Err(e) = value.parse::<SocketAddr>() {
        errors.push(ValidationError {
            field,
            message: format!("invalid socket address {:?}: {}", value, e),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&RouterConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = RouterConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.proxy.max_flush_latency_ms = 0;
        config.status.user = "admin".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["listener.bind_address", "proxy.max_flush_latency_ms", "status.user"]
        );
    }

    #[test]
    fn test_zero_threshold_only_matters_when_pruning() {
        let mut config = RouterConfig::default();
        config.registry.droplet_stale_threshold_secs = 0;
        assert!(validate_config(&config).is_err());

        config.registry.prune_stale_droplets_interval_secs = 0;
        assert!(validate_config(&config).is_ok());
    }
}

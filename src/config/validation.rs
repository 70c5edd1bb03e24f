//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports valid)
//! - Check route patterns and limiter parameters
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{GatewayConfig, StoreKind};
use crate::security::limit_config::{LimitConfig, LimitKind};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid bind address `{0}`")]
    BindAddress(String),

    #[error("`{0}` must be greater than zero")]
    ZeroValue(&'static str),

    #[error("route `{0}`: path pattern must start with '/'")]
    RoutePattern(String),

    #[error("route `{0}`: service id is empty")]
    RouteService(String),

    #[error("duplicate route id `{0}`")]
    DuplicateRoute(String),

    #[error("service `{service}`: invalid instance `{host}:{port}`")]
    Instance {
        service: String,
        host: String,
        port: u16,
    },

    #[error("rate limit for `{0}`: {1}")]
    Limit(String, &'static str),

    #[error("redis counter store requires the `redis` feature")]
    RedisUnavailable,

    #[error("auth.jwt_secret must not be empty")]
    JwtSecret,
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }
    if config.listener.max_body_size == 0 {
        errors.push(ValidationError::ZeroValue("listener.max_body_size"));
    }

    let timeouts = [
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.response_secs", config.timeouts.response_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
        ("pool.keep_alive_secs", config.pool.keep_alive_secs),
        ("pool.maintenance_interval_secs", config.pool.maintenance_interval_secs),
    ];
    for (name, value) in timeouts {
        if value == 0 {
            errors.push(ValidationError::ZeroValue(name));
        }
    }

    let mut route_ids = HashSet::new();
    for route in &config.routes {
        if !route.path_pattern.starts_with('/') {
            errors.push(ValidationError::RoutePattern(route.id.clone()));
        }
        if route.service_id.trim().is_empty() {
            errors.push(ValidationError::RouteService(route.id.clone()));
        }
        if !route_ids.insert(route.id.as_str()) {
            errors.push(ValidationError::DuplicateRoute(route.id.clone()));
        }
    }

    for service in &config.services {
        for instance in &service.instances {
            if instance.host.trim().is_empty() || instance.port == 0 {
                errors.push(ValidationError::Instance {
                    service: service.service_id.clone(),
                    host: instance.host.clone(),
                    port: instance.port,
                });
            }
        }
    }

    for (service_id, limit) in &config.rate_limit.strategy {
        if let Some(problem) = limit_problem(limit) {
            errors.push(ValidationError::Limit(service_id.clone(), problem));
        }
    }

    if config.rate_limit.store.kind == StoreKind::Redis && !cfg!(feature = "redis") {
        errors.push(ValidationError::RedisUnavailable);
    }

    if config.auth.enabled && config.auth.jwt_secret.is_empty() {
        errors.push(ValidationError::JwtSecret);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn limit_problem(limit: &LimitConfig) -> Option<&'static str> {
    match limit.kind {
        LimitKind::TokenBucket if limit.capacity == 0 => Some("capacity must be greater than zero"),
        LimitKind::SlidingWindow if limit.window == 0 => Some("window must be greater than zero"),
        LimitKind::SlidingWindow if limit.threshold == 0 => Some("threshold must be greater than zero"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RouteConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&GatewayConfig::default()), Ok(()));
    }

    #[test]
    fn collects_every_error() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.timeouts.response_secs = 0;
        config.routes.push(RouteConfig {
            id: "r1".into(),
            path_pattern: "api/**".into(),
            service_id: "".into(),
            enabled: true,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::ZeroValue("timeouts.response_secs")));
        assert!(errors.contains(&ValidationError::RoutePattern("r1".into())));
    }

    #[test]
    fn rejects_empty_window() {
        let mut config = GatewayConfig::default();
        config.rate_limit.strategy.insert(
            "order-service".into(),
            LimitConfig {
                kind: LimitKind::SlidingWindow,
                window: 0,
                threshold: 3,
                ..LimitConfig::default()
            },
        );
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::Limit("order-service".into(), "window must be greater than zero")]
        );
    }
}

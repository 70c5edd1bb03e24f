//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<GatewayConfig, ConfigError> {
    let config: GatewayConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PoolMode;
    use crate::load_balancer::Strategy;
    use crate::security::limit_config::LimitKind;

    #[test]
    fn parses_full_document() {
        let config = parse_config(
            r#"
            [listener]
            bind_address = "127.0.0.1:9261"

            [pool]
            mode = "per_request"

            [load_balancer]
            strategy = "least_connections"

            [rate_limit.strategy.order-service]
            type = "sliding_window"
            window = 60
            threshold = 3

            [[routes]]
            id = "orders"
            path_pattern = "/api/orders/**"
            service_id = "order-service"

            [[services]]
            service_id = "order-service"
            instances = [{ host = "127.0.0.1", port = 8081, weight = 3 }]
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.mode, PoolMode::PerRequest);
        assert_eq!(config.load_balancer.strategy, Some(Strategy::LeastConnections));
        let limit = &config.rate_limit.strategy["order-service"];
        assert_eq!(limit.kind, LimitKind::SlidingWindow);
        assert_eq!(limit.threshold, 3);
        assert!(config.routes[0].enabled);
        assert_eq!(config.services[0].instances[0].weight, 3);
    }

    #[test]
    fn reports_validation_errors() {
        let err = parse_config("[timeouts]\nconnect_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref errors) if errors.len() == 1));
        assert!(err.to_string().contains("timeouts.connect_secs"));
    }
}

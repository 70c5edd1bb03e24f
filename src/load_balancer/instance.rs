//! Service instance abstraction.
//!
//! # Responsibilities
//! - Represent one concrete `host:port` endpoint of a service
//! - Expose the weight used by the weighted strategies
//!
//! Instances are immutable; a registry update replaces the whole list.

use std::collections::HashMap;
use std::fmt;

use crate::config::schema::InstanceConfig;

pub const WEIGHT_KEY: &str = "weight";

/// A single backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.metadata.insert(WEIGHT_KEY.to_string(), weight.to_string());
        self
    }

    /// Weight from metadata. Missing or unparsable weights count as 1;
    /// fractional weights are truncated and huge ones clamp to `u32::MAX`,
    /// so summing any instance list cannot overflow.
    pub fn weight(&self) -> u64 {
        self.metadata
            .get(WEIGHT_KEY)
            .and_then(|w| w.trim().parse::<f64>().ok())
            .filter(|w| w.is_finite() && *w >= 0.0)
            .map(|w| w.min(u32::MAX as f64) as u64)
            .unwrap_or(1)
    }

    /// `host:port`, also the key of per-instance counters.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<&InstanceConfig> for ServiceInstance {
    fn from(config: &InstanceConfig) -> Self {
        let mut metadata = config.metadata.clone();
        metadata
            .entry(WEIGHT_KEY.to_string())
            .or_insert_with(|| config.weight.to_string());
        Self {
            host: config.host.clone(),
            port: config.port,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_defaults_and_truncates() {
        let plain = ServiceInstance::new("10.0.0.1", 80);
        assert_eq!(plain.weight(), 1);

        let mut fractional = plain.clone();
        fractional.metadata.insert(WEIGHT_KEY.into(), "2.7".into());
        assert_eq!(fractional.weight(), 2);

        let mut garbage = plain;
        garbage.metadata.insert(WEIGHT_KEY.into(), "heavy".into());
        assert_eq!(garbage.weight(), 1);
    }

    #[test]
    fn huge_weight_is_clamped() {
        let mut huge = ServiceInstance::new("10.0.0.1", 80);
        huge.metadata.insert(WEIGHT_KEY.into(), "1e30".into());
        assert_eq!(huge.weight(), u32::MAX as u64);

        let total: u64 = vec![huge; 4].iter().map(ServiceInstance::weight).sum();
        assert_eq!(total, 4 * u32::MAX as u64);
    }

    #[test]
    fn config_weight_does_not_override_metadata() {
        let config = InstanceConfig {
            host: "h".into(),
            port: 1,
            weight: 3,
            metadata: HashMap::from([(WEIGHT_KEY.to_string(), "5".to_string())]),
        };
        assert_eq!(ServiceInstance::from(&config).weight(), 5);
    }
}

//! Field-level runtime configuration changes.
//!
//! A configuration source publishes changes as `key = value` items. Two key
//! families are understood:
//!
//! ```text
//! ratelimit.strategy.<service_id>.<field>   field: type | rate | capacity | window | threshold
//! loadbalancer.strategy                     value: strategy name
//! ```
//!
//! Items are applied to the live limiter and balancer state without a
//! restart. Malformed items are logged and skipped.

use std::sync::Arc;

use crate::config::schema::GatewayConfig;
use crate::load_balancer::LoadBalancerContext;
use crate::security::limit_config::{LimitConfig, LimitConfigStore, LimitField};

const RATE_LIMIT_PREFIX: &str = "ratelimit.strategy.";
const STRATEGY_KEY: &str = "loadbalancer.strategy";

/// One changed configuration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeItem {
    pub key: String,
    pub value: String,
}

impl ChangeItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Applies change items to the live gateway state.
#[derive(Clone)]
pub struct DynamicConfig {
    limits: Arc<LimitConfigStore>,
    balancer: Arc<LoadBalancerContext>,
}

impl DynamicConfig {
    pub fn new(limits: Arc<LimitConfigStore>, balancer: Arc<LoadBalancerContext>) -> Self {
        Self { limits, balancer }
    }

    /// Apply a batch of changes in order. Returns how many were accepted.
    pub fn apply(&self, items: &[ChangeItem]) -> usize {
        items.iter().filter(|item| self.apply_one(item)).count()
    }

    fn apply_one(&self, item: &ChangeItem) -> bool {
        tracing::info!(key = %item.key, value = %item.value, "Applying config change");

        if item.key == STRATEGY_KEY {
            return match item.value.parse() {
                Ok(strategy) => {
                    self.balancer.set_strategy(strategy);
                    true
                }
                Err(e) => {
                    tracing::warn!(value = %item.value, error = %e, "Ignoring load balancer change");
                    false
                }
            };
        }

        let Some(rest) = item.key.strip_prefix(RATE_LIMIT_PREFIX) else {
            tracing::warn!(key = %item.key, "Unknown config key");
            return false;
        };
        // Service ids may not contain dots; the field is the last segment.
        let Some((service_id, field)) = rest.split_once('.') else {
            tracing::warn!(key = %item.key, "Malformed rate limit key");
            return false;
        };
        if service_id.is_empty() || field.contains('.') {
            tracing::warn!(key = %item.key, "Malformed rate limit key");
            return false;
        }
        let field: LimitField = match field.parse() {
            Ok(field) => field,
            Err(e) => {
                tracing::warn!(key = %item.key, error = %e, "Unknown rate limit field");
                return false;
            }
        };

        match self.limits.apply_change(service_id, field, &item.value) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %item.key, value = %item.value, error = %e, "Ignoring rate limit change");
                false
            }
        }
    }
}

/// Compute the change items that turn `old` into `new`.
///
/// Only the dynamic sections (per-service limits and the balancer strategy)
/// are compared; everything else requires a restart.
pub fn diff_configs(old: &GatewayConfig, new: &GatewayConfig) -> Vec<ChangeItem> {
    let mut items = Vec::new();

    if old.load_balancer.strategy != new.load_balancer.strategy {
        if let Some(strategy) = new.load_balancer.strategy {
            items.push(ChangeItem::new(STRATEGY_KEY, strategy.as_str()));
        }
    }

    let mut services: Vec<&String> = new.rate_limit.strategy.keys().collect();
    services.sort();
    for service_id in services {
        let updated = &new.rate_limit.strategy[service_id];
        let previous = old.rate_limit.strategy.get(service_id);
        for field in LimitField::ALL {
            let value = updated.field_value(field);
            if previous.map(|p| p.field_value(field)) != Some(value.clone()) {
                items.push(ChangeItem::new(
                    format!("{RATE_LIMIT_PREFIX}{service_id}.{}", field.as_str()),
                    value,
                ));
            }
        }
    }

    items
}

/// Initial change set for a freshly loaded configuration.
pub fn initial_changes(config: &GatewayConfig) -> Vec<ChangeItem> {
    let empty = GatewayConfig {
        load_balancer: Default::default(),
        rate_limit: Default::default(),
        ..config.clone()
    };
    diff_configs(&empty, config)
}

impl LimitConfig {
    fn field_value(&self, field: LimitField) -> String {
        match field {
            LimitField::Type => self.kind.as_str().to_string(),
            LimitField::Rate => self.rate.to_string(),
            LimitField::Capacity => self.capacity.to_string(),
            LimitField::Window => self.window.to_string(),
            LimitField::Threshold => self.threshold.to_string(),
        }
    }
}

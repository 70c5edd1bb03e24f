//! Per-service limiter settings.
//!
//! Settings live in a concurrent map keyed by service id. Each field can be
//! changed on its own at runtime; a change rewrites that one field in place
//! under the entry lock, so concurrent readers see either the old or the new
//! value and never a reset of the others.

use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limiter algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    #[default]
    TokenBucket,
    SlidingWindow,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::TokenBucket => "token_bucket",
            LimitKind::SlidingWindow => "sliding_window",
        }
    }
}

impl FromStr for LimitKind {
    type Err = LimitChangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "token_bucket" => Ok(LimitKind::TokenBucket),
            "sliding_window" => Ok(LimitKind::SlidingWindow),
            _ => Err(LimitChangeError::Kind(s.to_string())),
        }
    }
}

/// Limiter settings of one service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Algorithm used for this service.
    #[serde(rename = "type")]
    pub kind: LimitKind,

    /// Token bucket: tokens added per whole elapsed second.
    pub rate: u64,

    /// Token bucket: maximum tokens.
    pub capacity: u64,

    /// Sliding window: window length in seconds.
    pub window: u64,

    /// Sliding window: maximum requests inside the window.
    pub threshold: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            kind: LimitKind::TokenBucket,
            rate: 5,
            capacity: 10,
            window: 60,
            threshold: 100,
        }
    }
}

/// Individually changeable field of a [`LimitConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitField {
    Type,
    Rate,
    Capacity,
    Window,
    Threshold,
}

impl LimitField {
    pub const ALL: [LimitField; 5] = [
        LimitField::Type,
        LimitField::Rate,
        LimitField::Capacity,
        LimitField::Window,
        LimitField::Threshold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitField::Type => "type",
            LimitField::Rate => "rate",
            LimitField::Capacity => "capacity",
            LimitField::Window => "window",
            LimitField::Threshold => "threshold",
        }
    }
}

impl FromStr for LimitField {
    type Err = LimitChangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LimitField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| LimitChangeError::Field(s.to_string()))
    }
}

impl fmt::Display for LimitField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected field change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitChangeError {
    #[error("unknown limiter type `{0}`")]
    Kind(String),

    #[error("unknown limit field `{0}`")]
    Field(String),

    #[error("`{field}` expects a non-negative integer, got `{value}`")]
    Value { field: LimitField, value: String },
}

/// Live per-service limiter settings.
#[derive(Debug, Default)]
pub struct LimitConfigStore {
    configs: DashMap<String, LimitConfig>,
}

impl LimitConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for `service_id`, or the conservative default when unset.
    pub fn get(&self, service_id: &str) -> LimitConfig {
        self.configs
            .get(service_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.configs.contains_key(service_id)
    }

    /// Replace the whole entry for a service.
    pub fn set(&self, service_id: impl Into<String>, config: LimitConfig) {
        self.configs.insert(service_id.into(), config);
    }

    /// Change one field of a service's settings.
    ///
    /// An unknown service starts from the default settings. The value is
    /// parsed before the entry is touched, so a bad value changes nothing.
    pub fn apply_change(
        &self,
        service_id: &str,
        field: LimitField,
        value: &str,
    ) -> Result<(), LimitChangeError> {
        enum Parsed {
            Kind(LimitKind),
            Number(u64),
        }

        let parsed = match field {
            LimitField::Type => Parsed::Kind(value.parse()?),
            _ => Parsed::Number(value.trim().parse().map_err(|_| LimitChangeError::Value {
                field,
                value: value.to_string(),
            })?),
        };

        let mut entry = self.configs.entry(service_id.to_string()).or_default();
        let config = entry.value_mut();
        match (field, parsed) {
            (_, Parsed::Kind(kind)) => config.kind = kind,
            (LimitField::Rate, Parsed::Number(n)) => config.rate = n,
            (LimitField::Capacity, Parsed::Number(n)) => config.capacity = n,
            (LimitField::Window, Parsed::Number(n)) => config.window = n,
            (LimitField::Threshold, Parsed::Number(n)) => config.threshold = n,
            (LimitField::Type, Parsed::Number(_)) => {}
        }

        tracing::info!(service_id = %service_id, field = %field, value = %value, "Rate limit setting updated");
        Ok(())
    }
}

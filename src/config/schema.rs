//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::load_balancer::Strategy;
use crate::security::limit_config::LimitConfig;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, body limit).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Backend connection pool settings.
    pub pool: PoolConfig,

    /// Load balancing strategy.
    pub load_balancer: LoadBalancerConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Credential checks run by the auth stage.
    pub auth: AuthConfig,

    /// Route definitions mapping paths to services.
    pub routes: Vec<RouteConfig>,

    /// Static service registry: instances per service.
    pub services: Vec<ServiceConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:9261").
    pub bind_address: String,

    /// Maximum buffered request body in bytes.
    pub max_body_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9261".to_string(),
            max_body_size: 64 * 1024,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backend connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Time allowed for a backend to answer a forwarded request, in seconds.
    pub response_secs: u64,

    /// Total time for an inbound request/response, in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            response_secs: 30,
            request_secs: 60,
        }
    }
}

/// How backend connections are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// Keep connections open after a response and reuse them.
    #[default]
    KeepAlive,
    /// Open one connection per forwarded request and close it afterwards.
    PerRequest,
}

/// Backend connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Reuse mode.
    pub mode: PoolMode,

    /// How long a returned connection stays in the keep-alive slot, in seconds.
    pub keep_alive_secs: u64,

    /// Maximum idle connections retained per destination.
    pub max_idle_per_destination: usize,

    /// Connections opened ahead of traffic per destination after a table rebuild.
    pub min_idle: usize,

    /// Interval of the stats/cleanup task, in seconds.
    pub maintenance_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mode: PoolMode::KeepAlive,
            keep_alive_secs: 60,
            max_idle_per_destination: 50,
            min_idle: 0,
            maintenance_interval_secs: 30,
        }
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Active strategy. Unset selects IP hash.
    pub strategy: Option<Strategy>,
}

/// Where limiter state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Process-local store.
    #[default]
    Memory,
    /// Redis, shared between gateway processes (requires the `redis` feature).
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,

    /// Redis connection URL.
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable the rate limit stage.
    pub enabled: bool,

    /// Counter store backend.
    pub store: StoreConfig,

    /// Per-service limiter settings, keyed by service id.
    pub strategy: HashMap<String, LimitConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: StoreConfig::default(),
            strategy: HashMap::new(),
        }
    }
}

/// Credential checks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable the auth stage.
    pub enabled: bool,

    /// Required prefix of the `X-API-KEY` header. Unset disables the check.
    pub api_key_prefix: Option<String>,

    /// HMAC-SHA256 secret for the `X-SIGNATURE` header. Unset disables the check.
    pub signature_secret: Option<String>,

    /// Client IPs allowed through. Empty allows every client.
    pub ip_allow_list: Vec<String>,

    /// HS256 secret for identity tokens.
    pub jwt_secret: String,

    /// Lifetime of issued tokens in seconds.
    pub token_ttl_secs: u64,

    /// Identity placed into issued tokens.
    pub issued_user_id: String,
    pub issued_name: String,
    pub issued_permissions: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_prefix: Some("API_KEY_".to_string()),
            // WARNING: This is a placeholder! Change this in production.
            signature_secret: Some("CHANGE_ME_IN_PRODUCTION".to_string()),
            ip_allow_list: vec!["127.0.0.1".to_string(), "::1".to_string()],
            jwt_secret: "CHANGE_ME_IN_PRODUCTION".to_string(),
            token_ttl_secs: 3600,
            issued_user_id: "10001".to_string(),
            issued_name: "gateway-user".to_string(),
            issued_permissions: Vec::new(),
        }
    }
}

/// Route configuration mapping a path pattern to a service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging.
    pub id: String,

    /// Exact path, `*` wildcard, or `/**` prefix pattern.
    pub path_pattern: String,

    /// Service the route resolves to.
    pub service_id: String,

    /// Disabled routes never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Instances of one service in the static registry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub service_id: String,

    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// A single service instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,

    /// Weight for weighted strategies (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable metrics endpoint.
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

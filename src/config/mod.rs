//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → dynamic.rs diffs limits/strategy into change items
//!     → items applied live; services section triggers a registry change
//! ```
//!
//! # Design Decisions
//! - Listener, pool and timeout settings are fixed at startup
//! - Per-service limits and the balancer strategy change field by field
//! - All fields have defaults to allow minimal configs

pub mod dynamic;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use dynamic::{diff_configs, ChangeItem, DynamicConfig};
pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{GatewayConfig, PoolMode, RouteConfig, ServiceConfig};

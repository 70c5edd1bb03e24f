//! API gateway library.
//!
//! Every request runs through an ordered plugin chain:
//! authentication, rate limiting, route resolution, load balancing and
//! forwarding over pooled backend connections.

pub mod config;
pub mod forward;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod plugin;
pub mod pool;
pub mod routing;
pub mod security;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::{Gateway, Shutdown};

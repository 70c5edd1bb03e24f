//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request path
//!     → router.rs (route lookup on the current table snapshot)
//!     → matcher.rs (exact / wildcard / prefix patterns)
//!     → Return: service id (route match or first path segment)
//!
//! Table rebuild (startup and every registry change):
//!     registry.rs (routes + instances)
//!     → RouteTable::build
//!     → atomic swap in RouteTableHandle
//! ```
//!
//! # Design Decisions
//! - Tables are rebuilt wholesale, never patched
//! - No regex in hot path
//! - Deterministic: same input always matches same route

pub mod matcher;
pub mod registry;
pub mod router;

pub use registry::{RegistryError, RouteStore, ServiceRegistry, StaticRegistry};
pub use router::{RouteTable, RouteTableHandle};

//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → auth.rs (API key, signature, IP allow-list, identity token, permission)
//!     → rate_limit.rs (per service+user limit, algorithm per limit_config.rs)
//!     → store.rs (bucket/window state, shared across processes with Redis)
//!     → Pass to routing
//! ```
//!
//! # Design Decisions
//! - Fail closed: a failed check or an unreachable counter store rejects the request
//! - No trust in client input: identity comes only from a verified token

pub mod auth;
pub mod limit_config;
pub mod rate_limit;
pub mod store;

pub use auth::{AuthError, AuthOutcome, Authenticator, Claims, IdentityProvider, JwtIdentity};
pub use limit_config::{LimitConfig, LimitConfigStore, LimitKind};
pub use rate_limit::{RateLimitService, RateLimiter};
pub use store::{CounterStore, MemoryStore, StoreError};

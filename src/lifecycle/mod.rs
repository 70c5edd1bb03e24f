//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → Registry → Route table → Dynamic state → Store → Pool
//!         → Plugin chain → Background tasks → Serve
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Stop accepting → Stop background tasks → Close pool
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: nothing accepts traffic before the chain is complete
//! - One broadcast shutdown signal shared by every long-running task

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{Gateway, StartupError};

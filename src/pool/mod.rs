//! Backend connection pooling.
//!
//! # Data Flow
//! ```text
//! Forwarder
//!     → manager.rs (slot → idle → connect)
//!     → connection.rs (dispatch onto the connection's exchange queue)
//!     → ResponseSink (correlator) receives each outcome in FIFO order
//!     → manager.rs (return_connection → keep-alive slot + expiry timer)
//! ```
//!
//! # Connection States
//! ```text
//! Idle → Active → KeepAlive → Idle
//!          │          │
//!          └──────────┴────→ Closed
//! ```

pub mod connection;
pub mod connector;
pub mod keep_alive;
pub mod manager;

pub use connection::{
    BackendResponse, ConnState, ConnectionId, Destination, PendingRequest, PoolError,
    PooledConnection, RequestId, ResponseSink,
};
pub use connector::{BackendIo, Connector, TcpConnector};
pub use keep_alive::KeepAliveManager;
pub use manager::{ConnectionPool, PoolSettings, PoolStats};

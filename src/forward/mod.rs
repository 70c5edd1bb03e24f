//! Backend forwarding and response correlation.
//!
//! The forwarder writes a request onto a pooled connection and returns; the
//! response arrives later on that connection's dispatch task and is routed
//! to the waiting client by request id.

pub mod correlator;
pub mod forwarder;

pub use correlator::ResponseCorrelator;
pub use forwarder::Forwarder;

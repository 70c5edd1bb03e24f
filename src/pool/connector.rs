//! Outbound transport.
//!
//! The pool asks a [`Connector`] for a byte stream and runs the HTTP/1.1
//! handshake on top of it. Production uses TCP; tests plug in in-memory
//! streams.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::pool::connection::{Destination, PoolError};

/// Byte stream to a backend.
pub trait BackendIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> BackendIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, destination: &Destination) -> Result<Box<dyn BackendIo>, PoolError>;
}

/// Plain TCP with a connect deadline.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, destination: &Destination) -> Result<Box<dyn BackendIo>, PoolError> {
        let addr = (destination.host.as_str(), destination.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PoolError::ConnectTimeout(destination.clone()))?
            .map_err(|source| PoolError::Connect {
                destination: destination.clone(),
                source,
            })?;
        stream.set_nodelay(true).map_err(|source| PoolError::Connect {
            destination: destination.clone(),
            source,
        })?;
        Ok(Box::new(stream))
    }
}

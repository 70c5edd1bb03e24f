//! Pooled backend connection and its state machine.
//!
//! # Responsibilities
//! - Track connection state (Idle → Active → KeepAlive → Idle | Closed)
//! - Generate unique connection IDs for tracing
//! - Serialize exchanges over one HTTP/1.1 connection
//! - Keep the FIFO queue of requests waiting for a response
//!
//! # Design Decisions
//! - One dispatch task per connection owns the hyper `SendRequest`; requests
//!   reach it over a channel, so callers never hold the sender
//! - A request is enqueued as pending under the same lock that hands it to
//!   the dispatch task, so pending order equals wire order
//! - Each response completes the oldest pending request
//! - Closing is sticky; a closed connection never reopens

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, Response};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Correlation id of one forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Pool-level failure.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to connect to {destination}: {source}")]
    Connect {
        destination: Destination,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(Destination),

    #[error("HTTP handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("backend exchange failed: {0}")]
    Exchange(#[source] hyper::Error),

    #[error("backend did not answer within {0:?}")]
    ResponseTimeout(Duration),

    #[error("backend connection closed")]
    Closed,
}

/// Fully buffered backend response.
pub type BackendResponse = Response<Bytes>;

/// Receives the outcome of every exchange dispatched on a connection.
pub trait ResponseSink: Send + Sync {
    fn deliver(&self, request_id: RequestId, result: Result<BackendResponse, PoolError>);
}

/// Connection lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle = 0,
    Active = 1,
    KeepAlive = 2,
    Closed = 3,
}

impl From<u8> for ConnState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnState::Idle,
            1 => ConnState::Active,
            2 => ConnState::KeepAlive,
            _ => ConnState::Closed,
        }
    }
}

/// A request waiting for its response on a connection.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub client: SocketAddr,
    pub enqueued_at: Instant,
}

pub(crate) struct Exchange {
    request_id: RequestId,
    request: Request<Full<Bytes>>,
    sink: Arc<dyn ResponseSink>,
}

/// An outbound HTTP/1.1 connection owned by the pool.
pub struct PooledConnection {
    id: ConnectionId,
    destination: Destination,
    state: AtomicU8,
    last_active: Mutex<Instant>,
    pending: Mutex<VecDeque<PendingRequest>>,
    exchanges: mpsc::UnboundedSender<Exchange>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl PooledConnection {
    /// Create the connection record. The caller spawns the dispatch task
    /// with the returned receiver.
    pub(crate) fn new(
        destination: Destination,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Exchange>) {
        let (exchanges, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            destination,
            state: AtomicU8::new(ConnState::Active as u8),
            last_active: Mutex::new(Instant::now()),
            pending: Mutex::new(VecDeque::new()),
            exchanges,
            closed,
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Acquire))
    }

    /// Move to `state` unless already closed.
    pub(crate) fn set_state(&self, state: ConnState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnState::Closed as u8).then_some(state as u8)
            });
    }

    pub fn is_open(&self) -> bool {
        self.state() != ConnState::Closed
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        let previous = self.state.swap(ConnState::Closed as u8, Ordering::AcqRel);
        if previous != ConnState::Closed as u8 {
            self.closed.send_replace(true);
            tracing::debug!(connection_id = %self.id, destination = %self.destination, "Backend connection closed");
        }
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn pop_pending(&self) -> Option<PendingRequest> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    /// Queue a request on this connection. The outcome arrives at `sink`.
    pub fn dispatch(
        &self,
        request_id: RequestId,
        client: SocketAddr,
        request: Request<Full<Bytes>>,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<(), PoolError> {
        if !self.is_open() {
            return Err(PoolError::Closed);
        }
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.exchanges
            .send(Exchange {
                request_id,
                request,
                sink,
            })
            .map_err(|_| PoolError::Closed)?;
        pending.push_back(PendingRequest {
            request_id,
            client,
            enqueued_at: Instant::now(),
        });
        drop(pending);
        self.touch();
        Ok(())
    }
}

/// Wait until the connection is closed or its record is gone.
pub(crate) async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Dispatch task: runs exchanges one at a time and completes the oldest
/// pending request with each outcome.
pub(crate) async fn run_exchanges(
    mut sender: SendRequest<Full<Bytes>>,
    mut exchanges: mpsc::UnboundedReceiver<Exchange>,
    conn: Weak<PooledConnection>,
    closed: watch::Receiver<bool>,
    response_timeout: Duration,
) {
    loop {
        let exchange = tokio::select! {
            biased;
            _ = wait_closed(closed.clone()) => break,
            next = exchanges.recv() => match next {
                Some(exchange) => exchange,
                None => break,
            },
        };

        let Exchange {
            request_id,
            request,
            sink,
        } = exchange;
        let result = tokio::time::timeout(response_timeout, exchange_once(&mut sender, request))
            .await
            .unwrap_or(Err(PoolError::ResponseTimeout(response_timeout)));

        let Some(conn) = conn.upgrade() else {
            sink.deliver(request_id, result);
            break;
        };

        let failed = result.is_err();
        if failed {
            // The exchange state of an HTTP/1.1 connection is unknown after a failure.
            conn.close();
        } else if tokio::time::timeout(response_timeout, sender.ready()).await.map_or(true, |r| r.is_err()) {
            // The backend asked to close or went away after responding.
            conn.close();
        } else {
            conn.touch();
        }

        let completed = match conn.pop_pending() {
            Some(pending) => {
                debug_assert_eq!(pending.request_id, request_id);
                pending.request_id
            }
            None => request_id,
        };
        sink.deliver(completed, result);

        if failed || !conn.is_open() {
            break;
        }
    }

    exchanges.close();
    let conn = conn.upgrade();
    if let Some(conn) = &conn {
        conn.close();
    }
    while let Ok(Exchange {
        request_id, sink, ..
    }) = exchanges.try_recv()
    {
        let completed = conn
            .as_ref()
            .and_then(|c| c.pop_pending())
            .map_or(request_id, |p| p.request_id);
        sink.deliver(completed, Err(PoolError::Closed));
    }
}

async fn exchange_once(
    sender: &mut SendRequest<Full<Bytes>>,
    request: Request<Full<Bytes>>,
) -> Result<BackendResponse, PoolError> {
    sender.ready().await.map_err(PoolError::Exchange)?;
    let response = sender.send_request(request).await.map_err(PoolError::Exchange)?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await.map_err(PoolError::Exchange)?.to_bytes();
    Ok(Response::from_parts(parts, body))
}

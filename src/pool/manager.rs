//! Backend connection pool.
//!
//! # Data Flow
//! ```text
//! get_connection(dest)
//!     → keep-alive slot (shared, refreshed)
//!     → idle pool (exclusive, FIFO)
//!     → connect + HTTP/1.1 handshake
//!
//! return_connection(conn)
//!     → closed?        forget
//!     → per-request?   close
//!     → keep-alive slot, or idle when the slot is held by another connection
//!
//! slot timer fires
//!     → still busy?    re-arm
//!     → idle pool
//! ```
//!
//! # Design Decisions
//! - A connection lives in at most one of {keep-alive slot, idle pool}
//! - Every connection has a driver task; when the peer closes, the driver
//!   removes the connection from whichever structure holds it
//! - Tasks hold `Weak` references so a dropped pool stops everything

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;

use crate::config::schema::{GatewayConfig, PoolMode};
use crate::observability::metrics;
use crate::pool::connection::{
    run_exchanges, wait_closed, ConnState, ConnectionId, Destination, PoolError, PooledConnection,
};
use crate::pool::connector::Connector;
use crate::pool::keep_alive::{Expiry, KeepAliveManager, Registration};

/// Pool tuning, resolved from configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub mode: PoolMode,
    pub keep_alive: Duration,
    pub max_idle_per_destination: usize,
    pub response_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            mode: config.pool.mode,
            keep_alive: Duration::from_secs(config.pool.keep_alive_secs),
            max_idle_per_destination: config.pool.max_idle_per_destination,
            response_timeout: Duration::from_secs(config.timeouts.response_secs),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub keep_alive: usize,
    pub pending: usize,
    pub created: u64,
    pub reused: u64,
}

pub struct ConnectionPool {
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    idle: DashMap<Destination, VecDeque<Arc<PooledConnection>>>,
    keep_alive: KeepAliveManager,
    created: AtomicU64,
    reused: AtomicU64,
    shutting_down: AtomicBool,
    self_ref: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            keep_alive: KeepAliveManager::new(settings.keep_alive),
            settings,
            connector,
            idle: DashMap::new(),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// A connection to `destination`: the keep-alive slot, an idle
    /// connection, or a fresh one. Connect failures are returned, never
    /// retried.
    pub async fn get_connection(
        &self,
        destination: &Destination,
    ) -> Result<Arc<PooledConnection>, PoolError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        if self.settings.mode == PoolMode::KeepAlive {
            if let Some(conn) = self.keep_alive.get(destination) {
                tracing::debug!(connection_id = %conn.id(), destination = %destination, "Reusing keep-alive connection");
                self.mark_reused();
                return Ok(conn);
            }

            if let Some(conn) = self.pop_idle(destination) {
                tracing::debug!(connection_id = %conn.id(), destination = %destination, "Reusing idle connection");
                self.mark_reused();
                return Ok(conn);
            }
        }

        self.connect(destination).await
    }

    /// Hand a connection back after its exchange completed.
    pub fn return_connection(&self, conn: Arc<PooledConnection>) {
        if !conn.is_open() {
            self.forget(&conn);
            return;
        }
        if self.settings.mode == PoolMode::PerRequest || self.shutting_down.load(Ordering::Acquire) {
            conn.close();
            self.forget(&conn);
            return;
        }

        let registration = self.keep_alive.register(conn.clone(), || {
            self.spawn_expiry_timer(conn.destination().clone(), conn.id())
        });
        match registration {
            Registration::Registered => {
                tracing::debug!(connection_id = %conn.id(), destination = %conn.destination(), "Connection kept alive");
            }
            Registration::AlreadyRegistered => {}
            Registration::Occupied => self.park_idle(conn),
        }
        self.publish_gauges();
    }

    /// Remove a connection from every pool structure.
    pub fn forget(&self, conn: &PooledConnection) {
        let destination = conn.destination();
        self.keep_alive.remove(destination, conn.id());
        if let Some(mut queue) = self.idle.get_mut(destination) {
            queue.retain(|c| c.id() != conn.id());
        }
        self.idle.remove_if(destination, |_, queue| queue.is_empty());
        self.publish_gauges();
    }

    /// Open connections until `destination` has `count` idle ones.
    /// Returns how many were opened.
    pub async fn prewarm(&self, destination: &Destination, count: usize) -> usize {
        if self.settings.mode == PoolMode::PerRequest {
            return 0;
        }
        let mut opened = 0;
        while self.idle_len(destination) < count {
            match self.connect(destination).await {
                Ok(conn) => {
                    self.park_idle(conn);
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!(destination = %destination, error = %e, "Prewarm connect failed");
                    break;
                }
            }
        }
        opened
    }

    /// Drop closed connections. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = self.keep_alive.sweep_invalid();
        self.idle.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|c| c.is_open());
            removed += before - queue.len();
            !queue.is_empty()
        });
        self.publish_gauges();
        removed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.iter().map(|q| q.len()).sum(),
            keep_alive: self.keep_alive.len(),
            pending: self.keep_alive.pending_len(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }

    /// Close every pooled connection and refuse new ones.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut closed = 0;
        for conn in self.keep_alive.drain() {
            conn.close();
            closed += 1;
        }
        let destinations: Vec<Destination> = self.idle.iter().map(|e| e.key().clone()).collect();
        for destination in destinations {
            if let Some((_, queue)) = self.idle.remove(&destination) {
                for conn in queue {
                    conn.close();
                    closed += 1;
                }
            }
        }
        self.publish_gauges();
        tracing::info!(closed, "Connection pool shut down");
    }

    fn idle_len(&self, destination: &Destination) -> usize {
        self.idle.get(destination).map_or(0, |q| q.len())
    }

    fn pop_idle(&self, destination: &Destination) -> Option<Arc<PooledConnection>> {
        let mut queue = self.idle.get_mut(destination)?;
        while let Some(conn) = queue.pop_front() {
            if conn.is_open() {
                conn.set_state(ConnState::Active);
                conn.touch();
                return Some(conn);
            }
        }
        None
    }

    fn park_idle(&self, conn: Arc<PooledConnection>) {
        if !conn.is_open() || self.shutting_down.load(Ordering::Acquire) {
            conn.close();
            return;
        }
        let mut queue = self.idle.entry(conn.destination().clone()).or_default();
        if queue.len() >= self.settings.max_idle_per_destination {
            drop(queue);
            tracing::debug!(connection_id = %conn.id(), destination = %conn.destination(), "Idle pool full, closing connection");
            conn.close();
            return;
        }
        conn.set_state(ConnState::Idle);
        queue.push_back(conn);
        drop(queue);
        self.publish_gauges();
    }

    async fn connect(&self, destination: &Destination) -> Result<Arc<PooledConnection>, PoolError> {
        let result = self.establish(destination).await;
        match &result {
            Ok(conn) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                metrics::record_backend_connection("created");
                tracing::debug!(connection_id = %conn.id(), destination = %destination, "Backend connection established");
            }
            Err(e) => {
                metrics::record_backend_connection("failed");
                tracing::error!(destination = %destination, error = %e, "Backend connect failed");
            }
        }
        result
    }

    async fn establish(&self, destination: &Destination) -> Result<Arc<PooledConnection>, PoolError> {
        let io = self.connector.connect(destination).await?;
        let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(PoolError::Handshake)?;

        let (conn, exchanges) = PooledConnection::new(destination.clone());
        tokio::spawn(drive_connection(
            connection,
            Arc::downgrade(&conn),
            self.self_ref.clone(),
            conn.closed_signal(),
        ));
        tokio::spawn(run_exchanges(
            sender,
            exchanges,
            Arc::downgrade(&conn),
            conn.closed_signal(),
            self.settings.response_timeout,
        ));
        Ok(conn)
    }

    fn mark_reused(&self) {
        self.reused.fetch_add(1, Ordering::Relaxed);
        metrics::record_backend_connection("reused");
    }

    fn spawn_expiry_timer(&self, destination: Destination, id: ConnectionId) -> JoinHandle<()> {
        let pool = self.self_ref.clone();
        let mut wait = self.settings.keep_alive;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(wait).await;
                let Some(pool) = pool.upgrade() else { return };
                match pool.keep_alive.expire(&destination, id) {
                    Expiry::Rearm(remaining) => wait = remaining,
                    Expiry::Expired(conn) => {
                        tracing::debug!(connection_id = %id, destination = %destination, "Keep-alive expired, moving to idle");
                        pool.park_idle(conn);
                        return;
                    }
                    Expiry::Gone => return,
                }
            }
        })
    }

    fn publish_gauges(&self) {
        let idle = self.idle.iter().map(|q| q.len()).sum();
        metrics::set_pool_gauges(idle, self.keep_alive.len());
    }
}

/// Poll the hyper connection until the peer or the pool closes it, then
/// unregister it.
async fn drive_connection<C>(
    connection: C,
    conn: Weak<PooledConnection>,
    pool: Weak<ConnectionPool>,
    closed: tokio::sync::watch::Receiver<bool>,
) where
    C: Future<Output = Result<(), hyper::Error>> + Send,
{
    tokio::select! {
        result = connection => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "Backend connection error");
            }
        }
        _ = wait_closed(closed) => {}
    }

    if let Some(conn) = conn.upgrade() {
        conn.close();
        if let Some(pool) = pool.upgrade() {
            pool.forget(&conn);
        }
    }
}

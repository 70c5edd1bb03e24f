//! Response correlation.
//!
//! # Responsibilities
//! - Map request ids to the waiting client
//! - Release everything a request holds when its outcome arrives
//! - Drop entries whose outcome never arrived
//!
//! # Design Decisions
//! - Removing the map entry is the single release point: whoever removes it
//!   (delivery, forward failure, sweep) releases the lease and the backend
//!   connection, and nobody else can
//! - Resources are released before the client is written to, so a failing
//!   client write cannot leak them

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::IntoResponse;
use dashmap::DashMap;

use crate::http::response::{from_backend, GatewayError};
use crate::load_balancer::{ConnectionLease, ServiceInstance};
use crate::observability::metrics;
use crate::plugin::context::ClientHandle;
use crate::pool::{BackendResponse, ConnectionPool, PoolError, PooledConnection, RequestId, ResponseSink};

struct InFlight {
    client: ClientHandle,
    service_id: String,
    instance: ServiceInstance,
    lease: Option<ConnectionLease>,
    connection: Option<Arc<PooledConnection>>,
    started: Instant,
}

pub struct ResponseCorrelator {
    in_flight: DashMap<RequestId, InFlight>,
    pool: Arc<ConnectionPool>,
}

impl ResponseCorrelator {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            in_flight: DashMap::new(),
            pool,
        }
    }

    /// Record that `request_id` is being forwarded on behalf of `client`.
    pub fn register(
        &self,
        request_id: RequestId,
        client: ClientHandle,
        service_id: String,
        instance: ServiceInstance,
        lease: Option<ConnectionLease>,
    ) {
        self.in_flight.insert(
            request_id,
            InFlight {
                client,
                service_id,
                instance,
                lease,
                connection: None,
                started: Instant::now(),
            },
        );
        metrics::set_in_flight(self.in_flight.len());
    }

    /// Bind the backend connection carrying `request_id`. Returns false if
    /// the entry is already gone.
    pub fn attach(&self, request_id: RequestId, connection: Arc<PooledConnection>) -> bool {
        match self.in_flight.get_mut(&request_id) {
            Some(mut entry) => {
                entry.connection = Some(connection);
                true
            }
            None => false,
        }
    }

    /// Finish `request_id` with an error before any backend response.
    pub fn fail(&self, request_id: RequestId, error: GatewayError) {
        let Some(entry) = self.take(request_id) else {
            return;
        };
        tracing::error!(
            request_id = %request_id,
            service_id = %entry.service_id,
            instance = %entry.instance,
            error = %error,
            "Forward failed"
        );
        let (client, service_id) = self.release(entry);
        if client.send(error.into_response(), &service_id).is_err() {
            tracing::warn!(request_id = %request_id, "Client disconnected, error response discarded");
        }
    }

    /// Drop entries in flight for at least `max_age`, closing their connections.
    /// Returns how many were removed.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let stale: Vec<RequestId> = self
            .in_flight
            .iter()
            .filter(|e| e.started.elapsed() >= max_age)
            .map(|e| *e.key())
            .collect();

        let mut removed = 0;
        for request_id in stale {
            let Some(entry) = self.take(request_id) else {
                continue;
            };
            tracing::warn!(
                request_id = %request_id,
                service_id = %entry.service_id,
                age_ms = entry.started.elapsed().as_millis() as u64,
                "Dropping stale in-flight request"
            );
            if let Some(conn) = &entry.connection {
                // The exchange state is unknown; the connection cannot be reused.
                conn.close();
            }
            let (client, service_id) = self.release(entry);
            let _ = client.send(GatewayError::Timeout.into_response(), &service_id);
            removed += 1;
        }
        removed
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn take(&self, request_id: RequestId) -> Option<InFlight> {
        let entry = self.in_flight.remove(&request_id).map(|(_, entry)| entry);
        metrics::set_in_flight(self.in_flight.len());
        entry
    }

    /// Release the lease and connection held by `entry`.
    fn release(&self, entry: InFlight) -> (ClientHandle, String) {
        let InFlight {
            client,
            service_id,
            lease,
            connection,
            ..
        } = entry;
        drop(lease);
        if let Some(conn) = connection {
            self.pool.return_connection(conn);
        }
        (client, service_id)
    }
}

impl ResponseSink for ResponseCorrelator {
    fn deliver(&self, request_id: RequestId, result: Result<BackendResponse, PoolError>) {
        let Some(entry) = self.take(request_id) else {
            tracing::debug!(request_id = %request_id, "No in-flight request, response discarded");
            return;
        };
        let elapsed = entry.started.elapsed();
        let instance = entry.instance.clone();

        let response = match result {
            Ok(response) => {
                tracing::debug!(
                    request_id = %request_id,
                    instance = %instance,
                    status = %response.status(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Backend response received"
                );
                from_backend(response)
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, instance = %instance, error = %e, "Backend exchange failed");
                GatewayError::from(e).into_response()
            }
        };

        let (client, service_id) = self.release(entry);
        if client.send(response, &service_id).is_err() {
            tracing::warn!(request_id = %request_id, service_id = %service_id, "Client disconnected, response discarded");
        }
    }
}

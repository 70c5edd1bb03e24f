//! Per-request state carried through the plugin chain.
//!
//! A [`RequestContext`] is owned by one chain execution. The client side
//! of the exchange is a [`ClientHandle`]: whoever answers the request takes
//! it out of the context, so a request is answered at most once.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::http::request::Parts;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::http::response::GatewayError;
use crate::load_balancer::{ConnectionLease, ServiceInstance};
use crate::observability::metrics;
use crate::pool::RequestId;
use crate::security::Claims;

/// Write side of a client connection.
#[derive(Debug)]
pub struct ClientHandle {
    tx: oneshot::Sender<Response>,
    addr: SocketAddr,
    keep_alive: bool,
    received_at: Instant,
}

impl ClientHandle {
    pub fn new(addr: SocketAddr, keep_alive: bool) -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            tx,
            addr,
            keep_alive,
            received_at: Instant::now(),
        };
        (handle, rx)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// True once the client connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Write the response, closing the connection afterwards unless the
    /// client asked for keep-alive. Returns the response if the client is gone.
    pub fn send(self, mut response: Response, service_id: &str) -> Result<(), Response> {
        metrics::record_request(response.status().as_u16(), service_id, self.received_at.elapsed());
        if !self.keep_alive {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        self.tx.send(response)
    }
}

/// State shared by the stages handling one request.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub parts: Parts,
    pub body: Bytes,
    pub client_addr: SocketAddr,
    pub service_id: Option<String>,
    pub instance: Option<ServiceInstance>,
    pub lease: Option<ConnectionLease>,
    pub claims: Option<Claims>,
    client: Option<ClientHandle>,
}

impl RequestContext {
    pub fn new(parts: Parts, body: Bytes, client: ClientHandle) -> Self {
        Self {
            request_id: RequestId::new(),
            parts,
            body,
            client_addr: client.addr(),
            service_id: None,
            instance: None,
            lease: None,
            claims: None,
            client: Some(client),
        }
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_addr.ip()
    }

    /// Whether a response was already written or handed off.
    pub fn is_answered(&self) -> bool {
        self.client.is_none()
    }

    /// Hand the client over to whoever completes the request later.
    pub fn take_client(&mut self) -> Option<ClientHandle> {
        self.client.take()
    }

    /// Answer the request now.
    pub fn respond(&mut self, response: Response) {
        let Some(client) = self.client.take() else {
            tracing::warn!(request_id = %self.request_id, "Request already answered");
            return;
        };
        // Releases the least-connections count if the request never got forwarded.
        self.lease.take();
        let service_id = self.service_id.as_deref().unwrap_or("none");
        if client.send(response, service_id).is_err() {
            tracing::debug!(request_id = %self.request_id, "Client gone before response");
        }
    }

    /// Answer with an error response.
    pub fn reject(&mut self, error: GatewayError) {
        tracing::warn!(
            request_id = %self.request_id,
            client = %self.client_addr,
            path = %self.path(),
            status = %error.status(),
            error = %error,
            "Request rejected"
        );
        self.respond(error.into_response());
    }
}

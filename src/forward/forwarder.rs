//! Request forwarding.
//!
//! # Data Flow
//! ```text
//! RequestContext (service, instance, lease, client)
//!     → register request id with the correlator (client + lease move there)
//!     → rewrite request (origin-form target, Host, Connection, X-REQUEST-ID)
//!     → pool.get_connection      (failure → 503 via correlator)
//!     → connection.dispatch      (failure → connection returned, 502)
//!     → correlator.deliver later, on the connection's dispatch task
//! ```

use std::sync::Arc;

use axum::http::{header, HeaderValue, Request, Version};
use bytes::Bytes;
use http_body_util::Full;

use crate::config::schema::PoolMode;
use crate::forward::correlator::ResponseCorrelator;
use crate::http::request::{origin_form, X_REQUEST_ID};
use crate::http::response::{strip_hop_by_hop, GatewayError};
use crate::load_balancer::ServiceInstance;
use crate::plugin::context::RequestContext;
use crate::pool::{ConnectionPool, Destination, RequestId, ResponseSink};

pub struct Forwarder {
    pool: Arc<ConnectionPool>,
    correlator: Arc<ResponseCorrelator>,
}

impl Forwarder {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        let correlator = Arc::new(ResponseCorrelator::new(pool.clone()));
        Self { pool, correlator }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn correlator(&self) -> &Arc<ResponseCorrelator> {
        &self.correlator
    }

    /// Send the request in `ctx` to its chosen instance. The response, or the
    /// failure, reaches the client through the correlator.
    pub async fn forward(&self, ctx: &mut RequestContext) {
        let (Some(service_id), Some(instance)) = (ctx.service_id.clone(), ctx.instance.clone()) else {
            ctx.reject(GatewayError::Unavailable("No instance selected".into()));
            return;
        };

        let request_id = ctx.request_id;
        let request = match build_request(ctx, &instance, request_id, self.pool.settings().mode) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "Failed to build backend request");
                ctx.reject(GatewayError::BadGateway("Bad Gateway".into()));
                return;
            }
        };
        let Some(client) = ctx.take_client() else {
            return;
        };
        self.correlator
            .register(request_id, client, service_id.clone(), instance.clone(), ctx.lease.take());

        tracing::debug!(
            request_id = %request_id,
            service_id = %service_id,
            instance = %instance,
            path = %ctx.path(),
            "Forwarding request"
        );

        let destination = Destination::new(instance.host.clone(), instance.port);
        let conn = match self.pool.get_connection(&destination).await {
            Ok(conn) => conn,
            Err(e) => {
                self.correlator.fail(request_id, e.into());
                return;
            }
        };
        if !self.correlator.attach(request_id, conn.clone()) {
            self.pool.return_connection(conn);
            return;
        }

        let sink: Arc<dyn ResponseSink> = self.correlator.clone();
        if let Err(e) = conn.dispatch(request_id, ctx.client_addr, request, sink) {
            self.correlator.fail(request_id, e.into());
        }
    }
}

fn build_request(
    ctx: &RequestContext,
    instance: &ServiceInstance,
    request_id: RequestId,
    mode: PoolMode,
) -> Result<Request<Full<Bytes>>, axum::http::Error> {
    let mut headers = ctx.parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);
    headers.insert(header::HOST, HeaderValue::from_str(&instance.address())?);
    headers.insert(
        header::CONNECTION,
        HeaderValue::from_static(match mode {
            PoolMode::KeepAlive => "keep-alive",
            PoolMode::PerRequest => "close",
        }),
    );
    headers.insert(X_REQUEST_ID, HeaderValue::from_str(&request_id.to_string())?);

    let mut request = Request::builder()
        .method(ctx.parts.method.clone())
        .uri(origin_form(&ctx.parts.uri))
        .version(Version::HTTP_11)
        .body(Full::new(ctx.body.clone()))?;
    *request.headers_mut() = headers;
    Ok(request)
}

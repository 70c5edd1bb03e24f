//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router with the catch-all gateway handler
//! - Wire up middleware (tracing, timeout, body limit)
//! - Buffer each request and run it through the plugin chain
//! - Wait for whoever answers the request
//!
//! # Design Decisions
//! - The chain runs on its own task; a client that disconnects mid-request
//!   drops only the waiting handler, and the chain still releases what the
//!   request holds
//! - The request body is fully buffered before the chain runs

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::GatewayConfig;
use crate::http::request::wants_keep_alive;
use crate::http::response::GatewayError;
use crate::plugin::{ClientHandle, PluginChain, RequestContext};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<PluginChain>,
    pub max_body_size: usize,
}

/// HTTP front end of the gateway.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(config: &GatewayConfig, chain: Arc<PluginChain>) -> Self {
        let state = AppState {
            chain,
            max_body_size: config.listener.max_body_size,
        };
        Self {
            router: Self::build_router(config, state),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &GatewayConfig, state: AppState) -> Router {
        let max_body_size = state.max_body_size;
        Router::new()
            .route("/{*path}", any(gateway_handler))
            .route("/", any(gateway_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(RequestBodyLimitLayer::new(max_body_size))
                    .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs))),
            )
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Buffer the request, run the chain, and wait for the answer.
async fn gateway_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(client = %addr, error = %e, "Failed to read request body");
            return GatewayError::PayloadTooLarge.into_response();
        }
    };

    let keep_alive = wants_keep_alive(parts.version, &parts.headers);
    let (client, answer) = ClientHandle::new(addr, keep_alive);
    let ctx = RequestContext::new(parts, body, client);
    tracing::debug!(
        request_id = %ctx.request_id,
        client = %addr,
        method = %ctx.parts.method,
        path = %ctx.path(),
        "Request received"
    );

    let chain = state.chain.clone();
    tokio::spawn(async move { chain.execute(ctx).await });

    match answer.await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(client = %addr, "Request dropped without a response");
            GatewayError::BadGateway("Bad Gateway".into()).into_response()
        }
    }
}

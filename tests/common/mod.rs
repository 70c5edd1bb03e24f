//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use api_gateway::config::schema::{InstanceConfig, ServiceConfig};
use api_gateway::forward::Forwarder;
use api_gateway::lifecycle::{Gateway, Shutdown};
use api_gateway::load_balancer::LoadBalancerContext;
use api_gateway::GatewayConfig;
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

pub const JWT_SECRET: &str = "integration-secret";

/// A backend that echoes what it received.
///
/// The body is `"<path> <x-request-id>"`; the `Host` header it saw is
/// returned in `x-seen-host`.
pub struct MockBackend {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl MockBackend {
    pub async fn start(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                        tokio::time::sleep(delay).await;
                        let request_id = req
                            .headers()
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string();
                        let host = req
                            .headers()
                            .get("host")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-")
                            .to_string();
                        let body = format!("{} {}", req.uri().path(), request_id);
                        let response = Response::builder()
                            .header("x-seen-host", host)
                            .body(Full::new(Bytes::from(body)))
                            .unwrap();
                        Ok::<_, Infallible>(response)
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, connections }
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Address nothing is listening on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn service(service_id: &str, instances: &[SocketAddr]) -> ServiceConfig {
    ServiceConfig {
        service_id: service_id.to_string(),
        instances: instances
            .iter()
            .map(|addr| InstanceConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                weight: 1,
                metadata: HashMap::new(),
            })
            .collect(),
    }
}

/// Configuration with only the token check enabled.
pub fn config(services: Vec<ServiceConfig>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.auth.api_key_prefix = None;
    config.auth.signature_secret = None;
    config.auth.ip_allow_list.clear();
    config.auth.jwt_secret = JWT_SECRET.to_string();
    config.auth.issued_permissions = services.iter().map(|s| s.service_id.clone()).collect();
    config.auth.issued_permissions.push("ghost-service".to_string());
    config.timeouts.connect_secs = 1;
    config.timeouts.response_secs = 5;
    config.services = services;
    config
}

/// A gateway serving on an ephemeral local port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: Arc<Shutdown>,
    pub balancer: Arc<LoadBalancerContext>,
    pub forwarder: Arc<Forwarder>,
}

impl TestGateway {
    pub async fn start(config: GatewayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gateway = Gateway::build(config).await.unwrap();
        let shutdown = gateway.shutdown().clone();
        let balancer = gateway.balancer().clone();
        let forwarder = gateway.forwarder().clone();
        tokio::spawn(async move {
            let _ = gateway.run(listener).await;
        });
        Self {
            addr,
            shutdown,
            balancer,
            forwarder,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Ask for a token: a request without one is answered with a new token.
    pub async fn token(&self, client: &reqwest::Client, path: &str) -> String {
        let response = client.get(self.url(path)).send().await.unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        body["jwt"].as_str().unwrap().to_string()
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

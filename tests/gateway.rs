mod common;

use std::time::Duration;

use api_gateway::load_balancer::{ServiceInstance, Strategy};
use api_gateway::security::{LimitConfig, LimitKind};
use common::{closed_port, config, service, MockBackend, TestGateway};

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn request_without_token_gets_one_and_is_not_forwarded() {
    let backend = MockBackend::start(Duration::ZERO).await;
    let gateway = TestGateway::start(config(vec![service("order-service", &[backend.addr])])).await;
    let client = client();

    let token = gateway.token(&client, "/order-service/items").await;
    assert_eq!(token.split('.').count(), 3);
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn forwards_with_request_id_and_backend_host() {
    let backend = MockBackend::start(Duration::ZERO).await;
    let gateway = TestGateway::start(config(vec![service("order-service", &[backend.addr])])).await;
    let client = client();
    let token = gateway.token(&client, "/order-service").await;

    let response = client
        .get(gateway.url("/order-service/items?page=2"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["x-seen-host"].to_str().unwrap(),
        backend.addr.to_string()
    );

    let body = response.text().await.unwrap();
    let (path, request_id) = body.split_once(' ').unwrap();
    assert_eq!(path, "/order-service/items");
    assert!(uuid::Uuid::parse_str(request_id).is_ok());
}

#[tokio::test]
async fn invalid_token_is_401() {
    let backend = MockBackend::start(Duration::ZERO).await;
    let gateway = TestGateway::start(config(vec![service("order-service", &[backend.addr])])).await;

    let response = client()
        .get(gateway.url("/order-service/items"))
        .bearer_auth("not.a.token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(response.text().await.unwrap(), "Invalid JWT");
    assert_eq!(backend.connections(), 0);
}

#[tokio::test]
async fn unknown_service_is_404() {
    let backend = MockBackend::start(Duration::ZERO).await;
    let gateway = TestGateway::start(config(vec![service("order-service", &[backend.addr])])).await;
    let client = client();
    let token = gateway.token(&client, "/order-service").await;

    let response = client
        .get(gateway.url("/ghost-service/items"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "ServiceID not found");
}

#[tokio::test]
async fn unreachable_backend_is_503() {
    let down = closed_port().await;
    let gateway = TestGateway::start(config(vec![service("down-service", &[down])])).await;
    let client = client();
    let token = gateway.token(&client, "/down-service").await;

    let response = client
        .get(gateway.url("/down-service/items"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(gateway.forwarder.correlator().in_flight(), 0);
}

#[tokio::test]
async fn service_over_threshold_is_429() {
    let backend = MockBackend::start(Duration::ZERO).await;
    let mut config = config(vec![service("order-service", &[backend.addr])]);
    config.rate_limit.strategy.insert(
        "order-service".to_string(),
        LimitConfig {
            kind: LimitKind::SlidingWindow,
            window: 60,
            threshold: 2,
            ..LimitConfig::default()
        },
    );
    let gateway = TestGateway::start(config).await;
    let client = client();
    let token = gateway.token(&client, "/order-service").await;

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = client
            .get(gateway.url("/order-service/items"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        statuses.push(response.status().as_u16());
    }
    assert_eq!(statuses, [200, 200, 429]);
}

#[tokio::test]
async fn sequential_requests_reuse_one_backend_connection() {
    let backend = MockBackend::start(Duration::ZERO).await;
    let gateway = TestGateway::start(config(vec![service("order-service", &[backend.addr])])).await;
    let client = client();
    let token = gateway.token(&client, "/order-service").await;

    for i in 0..5 {
        let response = client
            .get(gateway.url(&format!("/order-service/items/{i}")))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().starts_with(&format!("/order-service/items/{i} ")));
    }
    assert_eq!(backend.connections(), 1);

    let stats = gateway.forwarder.pool().stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 4);
}

#[tokio::test]
async fn disconnected_client_still_releases_its_lease() {
    let backend = MockBackend::start(Duration::from_millis(500)).await;
    let mut config = config(vec![service("order-service", &[backend.addr])]);
    config.load_balancer.strategy = Some(Strategy::LeastConnections);
    let gateway = TestGateway::start(config).await;
    let client = client();
    let token = gateway.token(&client, "/order-service").await;

    let impatient = client
        .get(gateway.url("/order-service/slow"))
        .bearer_auth(&token)
        .timeout(Duration::from_millis(100))
        .send()
        .await;
    assert!(impatient.is_err());

    let instance = ServiceInstance::new(backend.addr.ip().to_string(), backend.addr.port());
    let counters = gateway.balancer.least_connections();
    assert_eq!(counters.active("order-service", &instance), 1);
    assert_eq!(gateway.forwarder.correlator().in_flight(), 1);

    tokio::time::timeout(Duration::from_secs(3), async {
        while gateway.forwarder.correlator().in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(counters.active("order-service", &instance), 0);
}

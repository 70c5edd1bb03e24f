//! Rate limiting stage.
//!
//! Keys the limiter by service and the verified user. A store failure
//! rejects the request rather than letting it through unmetered.

use async_trait::async_trait;

use crate::http::response::GatewayError;
use crate::observability::metrics;
use crate::plugin::{Next, Plugin, RequestContext};
use crate::security::RateLimitService;

pub struct RateLimitPlugin {
    enabled: bool,
    limiter: RateLimitService,
}

impl RateLimitPlugin {
    pub fn new(enabled: bool, limiter: RateLimitService) -> Self {
        Self { enabled, limiter }
    }
}

#[async_trait]
impl Plugin for RateLimitPlugin {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn order(&self) -> i32 {
        20
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn execute(&self, ctx: &mut RequestContext, next: Next<'_>) {
        let (Some(service_id), Some(claims)) = (ctx.service_id.clone(), ctx.claims.as_ref()) else {
            ctx.reject(GatewayError::Validation("Missing service id or identity".into()));
            return;
        };
        let user_id = claims.user_id.clone();

        match self.limiter.check(&service_id, &user_id).await {
            Ok(true) => next.run(ctx).await,
            Ok(false) => {
                metrics::record_rate_limited(&service_id);
                ctx.reject(GatewayError::RateLimited);
            }
            Err(e) => {
                tracing::error!(service_id = %service_id, user_id = %user_id, error = %e, "Rate limit store failed");
                ctx.reject(GatewayError::Unavailable("Rate limiter unavailable".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::{context, Respond};
    use crate::plugin::PluginChain;
    use crate::security::store::{ManualClock, MemoryStore};
    use crate::security::{Claims, LimitConfig, LimitConfigStore, LimitKind};
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;
    use std::sync::Arc;

    fn chain(limits: Arc<LimitConfigStore>) -> PluginChain {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = RateLimitService::with_clock(limits, store, clock);
        PluginChain::new(vec![Arc::new(RateLimitPlugin::new(true, limiter)), Arc::new(Respond)])
    }

    async fn run(chain: &PluginChain, with_identity: bool) -> StatusCode {
        let request = Request::get("/order-service/x").body(Bytes::new()).unwrap();
        let (mut ctx, rx) = context(request);
        ctx.service_id = Some("order-service".into());
        if with_identity {
            ctx.claims = Some(Claims {
                user_id: "10001".into(),
                name: "u".into(),
                permission: vec!["order-service".into()],
                exp: 0,
            });
        }
        chain.execute(ctx).await;
        rx.await.unwrap().status()
    }

    #[tokio::test]
    async fn rejects_over_threshold() {
        let limits = Arc::new(LimitConfigStore::new());
        limits.set(
            "order-service",
            LimitConfig {
                kind: LimitKind::SlidingWindow,
                window: 60,
                threshold: 2,
                ..LimitConfig::default()
            },
        );
        let chain = chain(limits);

        assert_eq!(run(&chain, true).await, StatusCode::OK);
        assert_eq!(run(&chain, true).await, StatusCode::OK);
        assert_eq!(run(&chain, true).await, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn missing_identity_is_400() {
        let chain = chain(Arc::new(LimitConfigStore::new()));
        assert_eq!(run(&chain, false).await, StatusCode::BAD_REQUEST);
    }
}

//! Request processing pipeline.
//!
//! # Data Flow
//! ```text
//! RequestContext
//!     → auth.rs         (10) credentials, identity, permission
//!     → rate_limit.rs   (20) per service and user
//!     → route.rs        (30) path → service id
//!     → load_balance.rs (40) service id → instance
//!     → forward.rs      (50) hand off to the forwarder
//! ```
//!
//! # Design Decisions
//! - Stages run in ascending order; a disabled stage is skipped by the chain
//! - A stage halts the request by answering it and not calling `next`
//! - Stages hold no per-request state; everything lives in the context

use std::sync::Arc;

use async_trait::async_trait;

pub mod auth;
pub mod context;
pub mod forward;
pub mod load_balance;
pub mod rate_limit;
pub mod route;

pub use auth::AuthPlugin;
pub use context::{ClientHandle, RequestContext};
pub use forward::ForwardPlugin;
pub use load_balance::LoadBalancePlugin;
pub use rate_limit::RateLimitPlugin;
pub use route::RoutePlugin;

use crate::http::response::GatewayError;

/// One pipeline stage.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Position in the chain; lower runs first.
    fn order(&self) -> i32;

    fn enabled(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut RequestContext, next: Next<'_>);
}

/// The rest of the chain after the current stage.
pub struct Next<'a> {
    plugins: &'a [Arc<dyn Plugin>],
}

impl<'a> Next<'a> {
    /// Run the next enabled stage, if any.
    pub async fn run(self, ctx: &mut RequestContext) {
        let mut rest = self.plugins;
        while let Some((plugin, tail)) = rest.split_first() {
            if plugin.enabled() {
                tracing::trace!(request_id = %ctx.request_id, plugin = plugin.name(), "Executing plugin");
                plugin.execute(ctx, Next { plugins: tail }).await;
                return;
            }
            rest = tail;
        }
    }
}

/// Stages sorted by order.
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginChain {
    pub fn new(mut plugins: Vec<Arc<dyn Plugin>>) -> Self {
        plugins.sort_by_key(|p| p.order());
        Self { plugins }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Drive one request through every stage.
    pub async fn execute(&self, mut ctx: RequestContext) {
        Next {
            plugins: &self.plugins,
        }
        .run(&mut ctx)
        .await;

        if !ctx.is_answered() {
            // Every stage passed the request on but nobody answered it.
            ctx.reject(GatewayError::BadGateway("Request was not handled".into()));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use axum::response::IntoResponse;
    use bytes::Bytes;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        order: i32,
        enabled: bool,
        halt: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        async fn execute(&self, ctx: &mut RequestContext, next: Next<'_>) {
            self.log.lock().unwrap().push(self.name);
            if self.halt {
                ctx.respond(StatusCode::IM_A_TEAPOT.into_response());
                return;
            }
            next.run(ctx).await;
        }
    }

    fn recorder(
        name: &'static str,
        order: i32,
        enabled: bool,
        halt: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn Plugin> {
        Arc::new(Recorder {
            name,
            order,
            enabled,
            halt,
            log: log.clone(),
        })
    }

    fn context() -> (RequestContext, tokio::sync::oneshot::Receiver<axum::response::Response>) {
        let (parts, _) = Request::get("/svc/x").body(()).unwrap().into_parts();
        let (client, rx) = ClientHandle::new("127.0.0.1:1234".parse().unwrap(), true);
        (RequestContext::new(parts, Bytes::new(), client), rx)
    }

    #[tokio::test]
    async fn runs_in_order_and_skips_disabled() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(vec![
            recorder("c", 30, true, true, &log),
            recorder("a", 10, true, false, &log),
            recorder("b", 20, false, false, &log),
        ]);
        assert_eq!(chain.names(), ["a", "b", "c"]);

        let (ctx, rx) = context();
        chain.execute(ctx).await;
        assert_eq!(*log.lock().unwrap(), ["a", "c"]);
        assert_eq!(rx.await.unwrap().status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn halting_stage_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(vec![
            recorder("a", 10, true, true, &log),
            recorder("b", 20, true, false, &log),
        ]);
        let (ctx, rx) = context();
        chain.execute(ctx).await;
        assert_eq!(*log.lock().unwrap(), ["a"]);
        assert_eq!(rx.await.unwrap().status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn unanswered_request_gets_an_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(vec![recorder("a", 10, true, false, &log)]);
        let (ctx, rx) = context();
        chain.execute(ctx).await;
        assert_eq!(rx.await.unwrap().status(), StatusCode::BAD_GATEWAY);
    }
}

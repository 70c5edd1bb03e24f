//! Instance selection stage.

use std::sync::Arc;

use async_trait::async_trait;

use crate::http::response::GatewayError;
use crate::load_balancer::LoadBalancerContext;
use crate::plugin::{Next, Plugin, RequestContext};
use crate::routing::RouteTableHandle;

pub struct LoadBalancePlugin {
    balancer: Arc<LoadBalancerContext>,
    routes: Arc<RouteTableHandle>,
}

impl LoadBalancePlugin {
    pub fn new(balancer: Arc<LoadBalancerContext>, routes: Arc<RouteTableHandle>) -> Self {
        Self { balancer, routes }
    }
}

#[async_trait]
impl Plugin for LoadBalancePlugin {
    fn name(&self) -> &'static str {
        "load_balance"
    }

    fn order(&self) -> i32 {
        40
    }

    async fn execute(&self, ctx: &mut RequestContext, next: Next<'_>) {
        let Some(service_id) = ctx.service_id.clone() else {
            ctx.reject(GatewayError::Validation("Missing service id".into()));
            return;
        };
        let instances = self.routes.load().instances(&service_id);

        match self.balancer.choose(&service_id, &instances, ctx.client_ip()) {
            Some(selection) => {
                ctx.instance = Some(selection.instance);
                ctx.lease = selection.lease;
                next.run(ctx).await;
            }
            None => ctx.reject(GatewayError::Unavailable("No available instance".into())),
        }
    }
}

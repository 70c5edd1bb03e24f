//! Routing stage: resolves the service id and checks the service is known.

use std::sync::Arc;

use async_trait::async_trait;

use crate::http::response::GatewayError;
use crate::plugin::{Next, Plugin, RequestContext};
use crate::routing::RouteTableHandle;

pub struct RoutePlugin {
    routes: Arc<RouteTableHandle>,
}

impl RoutePlugin {
    pub fn new(routes: Arc<RouteTableHandle>) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl Plugin for RoutePlugin {
    fn name(&self) -> &'static str {
        "route"
    }

    fn order(&self) -> i32 {
        30
    }

    async fn execute(&self, ctx: &mut RequestContext, next: Next<'_>) {
        let table = self.routes.load();
        let service_id = ctx
            .service_id
            .clone()
            .or_else(|| table.resolve_service(ctx.path()));

        match service_id {
            Some(service_id) if table.contains_service(&service_id) => {
                ctx.service_id = Some(service_id);
                next.run(ctx).await;
            }
            _ => ctx.reject(GatewayError::NotFound("ServiceID not found".into())),
        }
    }
}

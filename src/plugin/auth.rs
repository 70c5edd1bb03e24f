//! Authentication stage.
//!
//! Runs the credential checks for the request's service. A request without
//! an identity token is answered with a freshly issued token and is not
//! forwarded.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::schema::AuthConfig;
use crate::http::response::{token_issued, GatewayError};
use crate::plugin::{Next, Plugin, RequestContext};
use crate::routing::RouteTableHandle;
use crate::security::{AuthOutcome, Authenticator, IdentityProvider};

pub struct AuthPlugin {
    enabled: bool,
    authenticator: Authenticator,
    routes: Arc<RouteTableHandle>,
}

impl AuthPlugin {
    pub fn new(
        config: &AuthConfig,
        identity: Arc<dyn IdentityProvider>,
        routes: Arc<RouteTableHandle>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            authenticator: Authenticator::new(config, identity),
            routes,
        }
    }
}

#[async_trait]
impl Plugin for AuthPlugin {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn order(&self) -> i32 {
        10
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn execute(&self, ctx: &mut RequestContext, next: Next<'_>) {
        let resolved = ctx
            .service_id
            .clone()
            .or_else(|| self.routes.load().resolve_service(ctx.path()));
        let Some(service_id) = resolved else {
            ctx.reject(GatewayError::Validation("Missing service id".into()));
            return;
        };
        ctx.service_id = Some(service_id.clone());

        match self.authenticator.authenticate(
            &ctx.parts.headers,
            &ctx.body,
            ctx.client_ip(),
            &service_id,
        ) {
            Ok(AuthOutcome::Verified(claims)) => {
                tracing::debug!(request_id = %ctx.request_id, user_id = %claims.user_id, service_id = %service_id, "Authenticated");
                ctx.claims = Some(claims);
                next.run(ctx).await;
            }
            Ok(AuthOutcome::Issued(token)) => {
                tracing::info!(request_id = %ctx.request_id, client = %ctx.client_addr, "Issued identity token");
                ctx.respond(token_issued(&token));
            }
            Err(e) => ctx.reject(e.into()),
        }
    }
}

//! Forwarding stage: hands the request to the forwarder. The response is
//! written later by the correlator.

use std::sync::Arc;

use async_trait::async_trait;

use crate::forward::Forwarder;
use crate::plugin::{Next, Plugin, RequestContext};

pub struct ForwardPlugin {
    forwarder: Arc<Forwarder>,
}

impl ForwardPlugin {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self { forwarder }
    }
}

#[async_trait]
impl Plugin for ForwardPlugin {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn order(&self) -> i32 {
        50
    }

    async fn execute(&self, ctx: &mut RequestContext, _next: Next<'_>) {
        // Terminal: the request now belongs to the correlator.
        self.forwarder.forward(ctx).await;
    }
}

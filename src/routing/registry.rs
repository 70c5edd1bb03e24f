//! Service registry and route storage collaborators.
//!
//! # Responsibilities
//! - List the instances of a service
//! - Provide the persisted route definitions
//! - Announce changes so the route table is rebuilt
//!
//! `StaticRegistry` serves both from the configuration file; a config reload
//! replaces its contents and fires a change notification.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::schema::{GatewayConfig, RouteConfig};
use crate::load_balancer::ServiceInstance;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Source of service instances.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Services the registry knows about.
    async fn services(&self) -> Result<Vec<String>, RegistryError>;

    async fn list_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>, RegistryError>;
}

/// Source of route definitions.
#[async_trait]
pub trait RouteStore: Send + Sync {
    async fn load_routes(&self) -> Result<Vec<RouteConfig>, RegistryError>;
}

#[derive(Debug, Default)]
struct Snapshot {
    routes: Vec<RouteConfig>,
    services: HashMap<String, Vec<ServiceInstance>>,
}

impl Snapshot {
    fn from_config(config: &GatewayConfig) -> Self {
        let services = config
            .services
            .iter()
            .map(|service| {
                let instances = service.instances.iter().map(ServiceInstance::from).collect();
                (service.service_id.clone(), instances)
            })
            .collect();
        Self {
            routes: config.routes.clone(),
            services,
        }
    }
}

/// Registry backed by the `routes` and `services` config sections.
#[derive(Debug)]
pub struct StaticRegistry {
    snapshot: ArcSwap<Snapshot>,
    changes: mpsc::UnboundedSender<()>,
}

impl StaticRegistry {
    /// Returns the registry and the receiver of its change notifications.
    pub fn new(config: &GatewayConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (changes, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            snapshot: ArcSwap::from_pointee(Snapshot::from_config(config)),
            changes,
        });
        (registry, rx)
    }

    /// Replace routes and instances and notify listeners.
    pub fn update(&self, config: &GatewayConfig) {
        self.snapshot.store(Arc::new(Snapshot::from_config(config)));
        self.notify();
    }

    /// Fire a change notification without altering contents.
    pub fn notify(&self) {
        // Nobody listening is fine.
        let _ = self.changes.send(());
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn services(&self) -> Result<Vec<String>, RegistryError> {
        let mut ids: Vec<String> = self.snapshot.load().services.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_instances(&self, service_id: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(self
            .snapshot
            .load()
            .services
            .get(service_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl RouteStore for StaticRegistry {
    async fn load_routes(&self) -> Result<Vec<RouteConfig>, RegistryError> {
        Ok(self.snapshot.load().routes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{InstanceConfig, ServiceConfig};

    fn config(port: u16) -> GatewayConfig {
        GatewayConfig {
            services: vec![ServiceConfig {
                service_id: "user-service".into(),
                instances: vec![InstanceConfig {
                    host: "127.0.0.1".into(),
                    port,
                    weight: 2,
                    metadata: HashMap::new(),
                }],
            }],
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn update_replaces_and_notifies() {
        let (registry, mut rx) = StaticRegistry::new(&config(8081));
        assert_eq!(registry.list_instances("user-service").await.unwrap()[0].port, 8081);
        assert!(registry.list_instances("nope").await.unwrap().is_empty());

        registry.update(&config(9091));
        rx.recv().await.unwrap();
        let instances = registry.list_instances("user-service").await.unwrap();
        assert_eq!(instances[0].port, 9091);
        assert_eq!(instances[0].weight(), 2);
    }
}

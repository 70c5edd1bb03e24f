//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes and the instance list of every service
//! - Resolve a request path to a service id
//! - Rebuild the whole table from the collaborators on change
//!
//! # Design Decisions
//! - A table is immutable once built; readers hold an `Arc` snapshot
//! - Rebuilds swap the table atomically, never mutate it in place
//! - Exact routes beat wildcard routes beat prefix routes; within a class
//!   the first configured route wins
//! - A path no route claims resolves to its first segment

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::schema::RouteConfig;
use crate::load_balancer::ServiceInstance;
use crate::routing::matcher::{PathPattern, PatternClass};
use crate::routing::registry::{RegistryError, RouteStore, ServiceRegistry};

/// A compiled route.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub pattern: PathPattern,
    pub service_id: String,
}

/// Immutable routing snapshot.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    instances: HashMap<String, Arc<[ServiceInstance]>>,
}

impl RouteTable {
    /// Compile enabled routes and attach instance lists.
    pub fn new(routes: &[RouteConfig], instances: HashMap<String, Vec<ServiceInstance>>) -> Self {
        let routes = routes
            .iter()
            .filter(|r| r.enabled)
            .map(|r| Route {
                id: r.id.clone(),
                pattern: PathPattern::parse(&r.path_pattern),
                service_id: r.service_id.clone(),
            })
            .collect();
        let instances: HashMap<String, Arc<[ServiceInstance]>> = instances
            .into_iter()
            .map(|(service, list)| (service, Arc::from(list)))
            .collect();
        Self { routes, instances }
    }

    /// Build a table from the route store and registry.
    pub async fn build(
        routes: &dyn RouteStore,
        registry: &dyn ServiceRegistry,
    ) -> Result<Self, RegistryError> {
        let routes = routes.load_routes().await?;

        let mut service_ids = registry.services().await?;
        service_ids.extend(routes.iter().filter(|r| r.enabled).map(|r| r.service_id.clone()));
        service_ids.sort();
        service_ids.dedup();

        let mut instances = HashMap::with_capacity(service_ids.len());
        for service_id in service_ids {
            let list = registry.list_instances(&service_id).await?;
            instances.insert(service_id, list);
        }
        Ok(Self::new(&routes, instances))
    }

    /// Matching route for `path`, by class precedence.
    pub fn find_route(&self, path: &str) -> Option<&Route> {
        [PatternClass::Exact, PatternClass::Wildcard, PatternClass::Prefix]
            .into_iter()
            .find_map(|class| {
                self.routes
                    .iter()
                    .filter(|r| r.pattern.class() == class)
                    .find(|r| r.pattern.matches(path))
            })
    }

    /// Service id for `path`: the matching route's, or the first path segment.
    pub fn resolve_service(&self, path: &str) -> Option<String> {
        if let Some(route) = self.find_route(path) {
            tracing::debug!(route = %route.id, pattern = %route.pattern, path = %path, "Route matched");
            return Some(route.service_id.clone());
        }
        first_segment(path).map(str::to_string)
    }

    pub fn contains_service(&self, service_id: &str) -> bool {
        self.instances.contains_key(service_id)
    }

    /// Instance list of a service; empty when unknown.
    pub fn instances(&self, service_id: &str) -> Arc<[ServiceInstance]> {
        self.instances
            .get(service_id)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Every distinct instance in the table.
    pub fn destinations(&self) -> Vec<ServiceInstance> {
        let mut all: Vec<ServiceInstance> = self
            .instances
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect();
        all.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        all.dedup_by(|a, b| a.host == b.host && a.port == b.port);
        all
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn service_count(&self) -> usize {
        self.instances.len()
    }
}

/// First non-empty segment of a path.
pub fn first_segment(path: &str) -> Option<&str> {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
}

/// Shared, atomically replaceable route table.
#[derive(Debug, Default)]
pub struct RouteTableHandle {
    current: ArcSwap<RouteTable>,
}

impl RouteTableHandle {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    pub fn replace(&self, table: RouteTable) {
        tracing::info!(
            routes = table.route_count(),
            services = table.service_count(),
            "Route table rebuilt"
        );
        self.current.store(Arc::new(table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{GatewayConfig, InstanceConfig, ServiceConfig};
    use crate::routing::registry::StaticRegistry;

    fn route(id: &str, pattern: &str, service: &str) -> RouteConfig {
        RouteConfig {
            id: id.into(),
            path_pattern: pattern.into(),
            service_id: service.into(),
            enabled: true,
        }
    }

    #[test]
    fn class_precedence_beats_order() {
        let table = RouteTable::new(
            &[
                route("prefix", "/api/users/**", "prefix-svc"),
                route("wild", "/api/*/me", "wild-svc"),
                route("exact", "/api/users/me", "exact-svc"),
            ],
            HashMap::new(),
        );
        assert_eq!(table.resolve_service("/api/users/me").as_deref(), Some("exact-svc"));
        assert_eq!(table.resolve_service("/api/orders/me").as_deref(), Some("wild-svc"));
        assert_eq!(table.resolve_service("/api/users/42").as_deref(), Some("prefix-svc"));
    }

    #[test]
    fn first_match_within_class() {
        let table = RouteTable::new(
            &[route("a", "/api/**", "a"), route("b", "/api/users/**", "b")],
            HashMap::new(),
        );
        assert_eq!(table.resolve_service("/api/users/1").as_deref(), Some("a"));
    }

    #[test]
    fn falls_back_to_first_segment() {
        let mut disabled = route("off", "/order-service/**", "other");
        disabled.enabled = false;
        let table = RouteTable::new(&[disabled], HashMap::new());
        assert_eq!(table.resolve_service("/order-service/test1?x=1").as_deref(), Some("order-service"));
        assert_eq!(table.resolve_service("/"), None);
        assert_eq!(table.resolve_service(""), None);
    }

    #[tokio::test]
    async fn builds_from_collaborators() {
        let config = GatewayConfig {
            routes: vec![route("users", "/api/users/**", "user-service")],
            services: vec![ServiceConfig {
                service_id: "order-service".into(),
                instances: vec![InstanceConfig {
                    host: "127.0.0.1".into(),
                    port: 8081,
                    weight: 1,
                    metadata: HashMap::new(),
                }],
            }],
            ..GatewayConfig::default()
        };
        let (registry, _rx) = StaticRegistry::new(&config);
        let table = RouteTable::build(registry.as_ref(), registry.as_ref()).await.unwrap();

        assert!(table.contains_service("order-service"));
        // Routed services are known even without instances.
        assert!(table.contains_service("user-service"));
        assert!(table.instances("user-service").is_empty());
        assert_eq!(table.instances("order-service").len(), 1);
        assert_eq!(table.destinations().len(), 1);
    }
}

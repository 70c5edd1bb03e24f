//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Assemble the plugin chain
//! - Start background tasks (route rebuilds, pool maintenance, config reload)
//! - Serve until shutdown, then close the pool
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Background tasks stop on the shared shutdown signal
//! - A route table rebuild that fails keeps the previous table

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::dynamic::initial_changes;
use crate::config::schema::StoreKind;
use crate::config::watcher::ConfigWatcher;
use crate::config::{diff_configs, DynamicConfig, GatewayConfig};
use crate::forward::Forwarder;
use crate::http::HttpServer;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::shutdown_signal;
use crate::load_balancer::LoadBalancerContext;
use crate::plugin::{
    AuthPlugin, ForwardPlugin, LoadBalancePlugin, Plugin, PluginChain, RateLimitPlugin, RoutePlugin,
};
use crate::pool::{ConnectionPool, Connector, Destination, PoolSettings, TcpConnector};
use crate::routing::{RegistryError, RouteTable, RouteTableHandle, StaticRegistry};
use crate::security::{
    CounterStore, JwtIdentity, LimitConfigStore, MemoryStore, RateLimitService, StoreError,
};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("counter store: {0}")]
    Store(#[from] StoreError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("redis counter store requires the `redis` feature")]
    RedisDisabled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully wired gateway, ready to serve.
pub struct Gateway {
    config: GatewayConfig,
    config_path: Option<PathBuf>,
    routes: Arc<RouteTableHandle>,
    registry: Arc<StaticRegistry>,
    registry_changes: Option<mpsc::UnboundedReceiver<()>>,
    balancer: Arc<LoadBalancerContext>,
    limits: Arc<LimitConfigStore>,
    store: Arc<dyn CounterStore>,
    dynamic: DynamicConfig,
    forwarder: Arc<Forwarder>,
    chain: Arc<PluginChain>,
    shutdown: Arc<Shutdown>,
}

impl Gateway {
    pub async fn build(config: GatewayConfig) -> Result<Self, StartupError> {
        let connector = Arc::new(TcpConnector::new(Duration::from_secs(config.timeouts.connect_secs)));
        Self::with_connector(config, connector).await
    }

    pub async fn with_connector(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, StartupError> {
        let (registry, registry_changes) = StaticRegistry::new(&config);
        let table = RouteTable::build(registry.as_ref(), registry.as_ref()).await?;
        tracing::info!(
            routes = table.route_count(),
            services = table.service_count(),
            "Route table built"
        );
        let routes = Arc::new(RouteTableHandle::new(table));

        let balancer = Arc::new(LoadBalancerContext::new(config.load_balancer.strategy));
        let limits = Arc::new(LimitConfigStore::new());
        let dynamic = DynamicConfig::new(limits.clone(), balancer.clone());
        dynamic.apply(&initial_changes(&config));

        let store = counter_store(&config).await?;
        let pool = ConnectionPool::new(PoolSettings::from_config(&config), connector);
        let forwarder = Arc::new(Forwarder::new(pool));

        let identity = Arc::new(JwtIdentity::new(&config.auth));
        let plugins: Vec<Arc<dyn Plugin>> = vec![
            Arc::new(AuthPlugin::new(&config.auth, identity, routes.clone())),
            Arc::new(RateLimitPlugin::new(
                config.rate_limit.enabled,
                RateLimitService::new(limits.clone(), store.clone()),
            )),
            Arc::new(RoutePlugin::new(routes.clone())),
            Arc::new(LoadBalancePlugin::new(balancer.clone(), routes.clone())),
            Arc::new(ForwardPlugin::new(forwarder.clone())),
        ];
        let chain = Arc::new(PluginChain::new(plugins));
        tracing::info!(plugins = ?chain.names(), strategy = %balancer.strategy(), "Plugin chain assembled");

        Ok(Self {
            config,
            config_path: None,
            routes,
            registry,
            registry_changes: Some(registry_changes),
            balancer,
            limits,
            store,
            dynamic,
            forwarder,
            chain,
            shutdown: Arc::new(Shutdown::new()),
        })
    }

    /// Reload configuration from `path` when it changes.
    pub fn watch_config(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn chain(&self) -> &Arc<PluginChain> {
        &self.chain
    }

    pub fn routes(&self) -> &Arc<RouteTableHandle> {
        &self.routes
    }

    pub fn registry(&self) -> &Arc<StaticRegistry> {
        &self.registry
    }

    pub fn balancer(&self) -> &Arc<LoadBalancerContext> {
        &self.balancer
    }

    pub fn limits(&self) -> &Arc<LimitConfigStore> {
        &self.limits
    }

    pub fn counter_store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.forwarder.pool()
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub fn shutdown(&self) -> &Arc<Shutdown> {
        &self.shutdown
    }

    /// Serve on `listener` until SIGINT/SIGTERM or [`Shutdown::trigger`].
    pub async fn run(mut self, listener: TcpListener) -> Result<(), StartupError> {
        let tasks = self.spawn_background();

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.trigger();
        });

        let server = HttpServer::new(&self.config, self.chain.clone());
        let result = server.run(listener, self.shutdown.wait()).await;

        self.shutdown.trigger();
        join_all(tasks).await;
        self.pool().shutdown();
        tracing::info!(in_flight = self.forwarder.correlator().in_flight(), "Gateway stopped");
        result.map_err(StartupError::from)
    }

    /// Start route rebuilds, pool maintenance and config reload.
    pub fn spawn_background(&mut self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.spawn_maintenance()];
        if let Some(changes) = self.registry_changes.take() {
            tasks.push(self.spawn_route_rebuilds(changes));
        }
        if let Some(path) = self.config_path.clone() {
            tasks.push(self.spawn_config_reload(path));
        }
        tasks
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let forwarder = self.forwarder.clone();
        let store = self.store.clone();
        let period = Duration::from_secs(self.config.pool.maintenance_interval_secs.max(1));
        // Anything older than a full connect plus exchange is never coming back.
        let stale_after = Duration::from_secs(
            (self.config.timeouts.connect_secs + self.config.timeouts.response_secs) * 2,
        );
        let stop = self.shutdown.wait();

        tokio::spawn(async move {
            tokio::pin!(stop);
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {}
                }
                maintain(&forwarder, store.as_ref(), stale_after).await;
            }
        })
    }

    fn spawn_route_rebuilds(&self, mut changes: mpsc::UnboundedReceiver<()>) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let routes = self.routes.clone();
        let pool = self.pool().clone();
        let min_idle = self.config.pool.min_idle;
        let stop = self.shutdown.wait();

        tokio::spawn(async move {
            tokio::pin!(stop);
            prewarm(&pool, &routes.load(), min_idle).await;
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    change = changes.recv() => if change.is_none() { break },
                }
                // Coalesce bursts of notifications into one rebuild.
                while changes.try_recv().is_ok() {}

                match RouteTable::build(registry.as_ref(), registry.as_ref()).await {
                    Ok(table) => {
                        routes.replace(table);
                        prewarm(&pool, &routes.load(), min_idle).await;
                    }
                    Err(e) => tracing::error!(error = %e, "Route table rebuild failed, keeping previous table"),
                }
            }
        })
    }

    fn spawn_config_reload(&self, path: PathBuf) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let dynamic = self.dynamic.clone();
        let mut current = self.config.clone();
        let stop = self.shutdown.wait();

        tokio::spawn(async move {
            tokio::pin!(stop);
            let (watcher, mut updates) = ConfigWatcher::new(&path);
            // Dropping the watcher stops notifications; keep it for the task's lifetime.
            let _watcher = match watcher.run() {
                Ok(watcher) => watcher,
                Err(e) => {
                    tracing::error!(path = ?path, error = %e, "Config watcher failed to start");
                    return;
                }
            };
            loop {
                let next = tokio::select! {
                    _ = &mut stop => break,
                    next = updates.recv() => next,
                };
                let Some(next) = next else { break };

                let changes = diff_configs(&current, &next);
                let applied = dynamic.apply(&changes);
                registry.update(&next);
                tracing::info!(changes = changes.len(), applied, "Configuration reloaded");
                current = next;
            }
        })
    }
}

/// One maintenance pass: sweep the pool and stale requests, purge expired
/// limiter keys.
async fn maintain(forwarder: &Forwarder, store: &dyn CounterStore, stale_after: Duration) {
    let swept = forwarder.pool().sweep();
    let stale = forwarder.correlator().sweep_stale(stale_after);
    store.purge_expired().await;
    let stats = forwarder.pool().stats();
    tracing::debug!(
        idle = stats.idle,
        keep_alive = stats.keep_alive,
        pending = stats.pending,
        created = stats.created,
        reused = stats.reused,
        in_flight = forwarder.correlator().in_flight(),
        swept,
        stale,
        "Pool maintenance"
    );
}

async fn counter_store(config: &GatewayConfig) -> Result<Arc<dyn CounterStore>, StartupError> {
    match config.rate_limit.store.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "redis")]
        StoreKind::Redis => {
            let store = crate::security::store::RedisStore::connect(&config.rate_limit.store.url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreKind::Redis => Err(StartupError::RedisDisabled),
    }
}

async fn prewarm(pool: &ConnectionPool, table: &RouteTable, min_idle: usize) {
    if min_idle == 0 {
        return;
    }
    for instance in table.destinations() {
        let destination = Destination::new(instance.host, instance.port);
        let opened = pool.prewarm(&destination, min_idle).await;
        if opened > 0 {
            tracing::debug!(destination = %destination, opened, "Prewarmed connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{InstanceConfig, ServiceConfig};
    use crate::load_balancer::Strategy;
    use crate::security::{LimitConfig, LimitKind};
    use std::collections::HashMap;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.load_balancer.strategy = Some(Strategy::RoundRobin);
        config.rate_limit.strategy.insert(
            "order-service".into(),
            LimitConfig {
                kind: LimitKind::SlidingWindow,
                ..LimitConfig::default()
            },
        );
        config.services.push(ServiceConfig {
            service_id: "order-service".into(),
            instances: vec![InstanceConfig {
                host: "127.0.0.1".into(),
                port: 8081,
                weight: 1,
                metadata: HashMap::new(),
            }],
        });
        config
    }

    #[tokio::test]
    async fn build_seeds_dynamic_state() {
        let gateway = Gateway::build(config()).await.unwrap();
        assert_eq!(gateway.balancer().strategy(), Strategy::RoundRobin);
        assert_eq!(gateway.limits().get("order-service").kind, LimitKind::SlidingWindow);
        assert!(gateway.routes().load().contains_service("order-service"));
        assert_eq!(gateway.chain().names(), ["auth", "rate_limit", "route", "load_balance", "forward"]);
    }

    #[tokio::test]
    async fn registry_change_rebuilds_routes() {
        let mut gateway = Gateway::build(config()).await.unwrap();
        let tasks = gateway.spawn_background();

        let mut next = config();
        next.services[0].service_id = "user-service".into();
        gateway.registry().update(&next);

        let routes = gateway.routes().clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while !routes.load().contains_service("user-service") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!gateway.routes().load().contains_service("order-service"));

        gateway.shutdown().trigger();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn maintenance_purges_idle_limiter_keys() {
        use crate::security::store::{BucketSpec, ManualClock};

        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());
        let spec = BucketSpec {
            rate: 1,
            capacity: 5,
            ttl: Duration::from_secs(120),
        };
        for user in ["u1", "u2", "u3"] {
            store.take_token(&format!("order-service:{user}"), spec, 0).await.unwrap();
        }
        let pool = ConnectionPool::new(
            PoolSettings::default(),
            Arc::new(TcpConnector::new(Duration::from_secs(1))),
        );
        let forwarder = Forwarder::new(pool);

        maintain(&forwarder, &store, Duration::from_secs(60)).await;
        assert_eq!(store.len(), 3);

        clock.advance(Duration::from_secs(121));
        maintain(&forwarder, &store, Duration::from_secs(60)).await;
        assert!(store.is_empty());
    }
}

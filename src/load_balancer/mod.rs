//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Service resolved → instance list from the route table
//!     → LoadBalancerContext (active strategy, switchable at runtime)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (plain and weighted rotation)
//!         - random.rs (uniform and weighted draws)
//!         - ip_hash.rs (client IP affinity)
//!         - least_conn.rs (fewest in-flight requests, with a lease)
//!     → Selection (instance + optional lease) stored in the request context
//! ```
//!
//! # Design Decisions
//! - One instance of every strategy lives for the whole process, so
//!   switching strategies keeps each one's counters
//! - Balancers never see an empty list from the pipeline; they return
//!   `None` for it anyway
//! - Only least connections hands out a lease; the lease travels with the
//!   request and is released exactly once when the exchange ends

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod instance;
pub mod ip_hash;
pub mod least_conn;
pub mod random;
pub mod round_robin;

pub use instance::ServiceInstance;
pub use least_conn::{ConnectionLease, LeastConnections};

/// A load balancing algorithm.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Select an instance for one request of `service_id`.
    fn choose(
        &self,
        service_id: &str,
        instances: &[ServiceInstance],
        client_ip: IpAddr,
    ) -> Option<Selection>;
}

/// Outcome of a balancing decision.
#[derive(Debug)]
pub struct Selection {
    pub instance: ServiceInstance,
    /// Present for least connections; dropping it releases the count.
    pub lease: Option<ConnectionLease>,
}

impl Selection {
    pub fn of(instance: &ServiceInstance) -> Self {
        Self {
            instance: instance.clone(),
            lease: None,
        }
    }
}

/// The closed set of strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Strategy {
    RoundRobin = 0,
    WeightedRoundRobin = 1,
    Random = 2,
    WeightedRandom = 3,
    #[default]
    IpHash = 4,
    LeastConnections = 5,
}

impl Strategy {
    pub const ALL: [Strategy; 6] = [
        Strategy::RoundRobin,
        Strategy::WeightedRoundRobin,
        Strategy::Random,
        Strategy::WeightedRandom,
        Strategy::IpHash,
        Strategy::LeastConnections,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::Random => "random",
            Strategy::WeightedRandom => "weighted_random",
            Strategy::IpHash => "ip_hash",
            Strategy::LeastConnections => "least_connections",
        }
    }

    fn from_u8(value: u8) -> Self {
        Strategy::ALL
            .into_iter()
            .find(|s| *s as u8 == value)
            .unwrap_or_default()
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown load balancing strategy `{0}`")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    /// Accepts the snake_case names as well as `ROUND_ROBIN` / `RoundRobin` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "roundrobin" => Ok(Strategy::RoundRobin),
            "weightedroundrobin" => Ok(Strategy::WeightedRoundRobin),
            "random" => Ok(Strategy::Random),
            "weightedrandom" => Ok(Strategy::WeightedRandom),
            "iphash" => Ok(Strategy::IpHash),
            "leastconnections" | "leastconnection" => Ok(Strategy::LeastConnections),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

/// Holds every strategy and the currently active one.
#[derive(Debug)]
pub struct LoadBalancerContext {
    active: AtomicU8,
    round_robin: round_robin::RoundRobin,
    weighted_round_robin: round_robin::WeightedRoundRobin,
    random: random::Random,
    weighted_random: random::WeightedRandom,
    ip_hash: ip_hash::IpHash,
    least_connections: LeastConnections,
}

impl LoadBalancerContext {
    /// `None` selects IP hash.
    pub fn new(strategy: Option<Strategy>) -> Self {
        Self {
            active: AtomicU8::new(strategy.unwrap_or_default() as u8),
            round_robin: Default::default(),
            weighted_round_robin: Default::default(),
            random: random::Random,
            weighted_random: random::WeightedRandom,
            ip_hash: ip_hash::IpHash,
            least_connections: LeastConnections::new(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        Strategy::from_u8(self.active.load(Ordering::Acquire))
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        let previous = Strategy::from_u8(self.active.swap(strategy as u8, Ordering::AcqRel));
        if previous != strategy {
            tracing::info!(from = %previous, to = %strategy, "Load balancing strategy switched");
        }
    }

    /// Choose with the active strategy.
    pub fn choose(
        &self,
        service_id: &str,
        instances: &[ServiceInstance],
        client_ip: IpAddr,
    ) -> Option<Selection> {
        let strategy = self.strategy();
        let selection = self.balancer(strategy).choose(service_id, instances, client_ip);
        if let Some(selection) = &selection {
            tracing::debug!(
                service_id = %service_id,
                strategy = %strategy,
                instance = %selection.instance,
                "Instance selected"
            );
        }
        selection
    }

    pub fn least_connections(&self) -> &LeastConnections {
        &self.least_connections
    }

    fn balancer(&self, strategy: Strategy) -> &dyn LoadBalancer {
        match strategy {
            Strategy::RoundRobin => &self.round_robin,
            Strategy::WeightedRoundRobin => &self.weighted_round_robin,
            Strategy::Random => &self.random,
            Strategy::WeightedRandom => &self.weighted_random,
            Strategy::IpHash => &self.ip_hash,
            Strategy::LeastConnections => &self.least_connections,
        }
    }
}

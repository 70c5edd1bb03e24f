//! Round-robin load balancing strategies.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::load_balancer::{instance::ServiceInstance, LoadBalancer, Selection};

/// Per-service wrapping counters.
#[derive(Debug, Default)]
struct Counters(DashMap<String, AtomicUsize>);

impl Counters {
    fn next(&self, service_id: &str) -> usize {
        if let Some(counter) = self.0.get(service_id) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.0
            .entry(service_id.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }
}

/// Round-robin selector.
/// Stores a counter per service to rotate through its instances.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counters: Counters,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn choose(
        &self,
        service_id: &str,
        instances: &[ServiceInstance],
        _client_ip: IpAddr,
    ) -> Option<Selection> {
        if instances.is_empty() {
            return None;
        }
        let index = self.counters.next(service_id) % instances.len();
        Some(Selection::of(&instances[index]))
    }
}

/// Weighted round-robin selector.
///
/// The counter is taken modulo the total weight and the instance list is
/// walked subtracting weights, so an instance of weight `w` is chosen `w`
/// times per cycle. A list whose weights sum to zero is rotated plainly.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    counters: Counters,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn choose(
        &self,
        service_id: &str,
        instances: &[ServiceInstance],
        _client_ip: IpAddr,
    ) -> Option<Selection> {
        if instances.is_empty() {
            return None;
        }

        let total: u64 = instances.iter().map(ServiceInstance::weight).sum();
        let tick = self.counters.next(service_id) as u64;
        if total == 0 {
            return Some(Selection::of(&instances[(tick % instances.len() as u64) as usize]));
        }

        let mut cursor = tick % total;
        for instance in instances {
            let weight = instance.weight();
            if cursor < weight {
                return Some(Selection::of(instance));
            }
            cursor -= weight;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn ports(lb: &dyn LoadBalancer, instances: &[ServiceInstance], n: usize) -> Vec<u16> {
        (0..n)
            .map(|_| lb.choose("svc", instances, ip()).unwrap().instance.port)
            .collect()
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let instances = vec![
            ServiceInstance::new("127.0.0.1", 8080),
            ServiceInstance::new("127.0.0.1", 8081),
            ServiceInstance::new("127.0.0.1", 8082),
        ];

        assert_eq!(ports(&lb, &instances, 4), vec![8080, 8081, 8082, 8080]);
    }

    #[test]
    fn services_rotate_independently() {
        let lb = RoundRobin::new();
        let instances = vec![ServiceInstance::new("a", 1), ServiceInstance::new("b", 2)];
        assert_eq!(lb.choose("x", &instances, ip()).unwrap().instance.port, 1);
        assert_eq!(lb.choose("y", &instances, ip()).unwrap().instance.port, 1);
        assert_eq!(lb.choose("x", &instances, ip()).unwrap().instance.port, 2);
    }

    #[test]
    fn weighted_round_robin_follows_weights() {
        let lb = WeightedRoundRobin::new();
        let instances = vec![
            ServiceInstance::new("a", 1).with_weight(3),
            ServiceInstance::new("b", 2).with_weight(1),
        ];
        assert_eq!(ports(&lb, &instances, 8), vec![1, 1, 1, 2, 1, 1, 1, 2]);
    }

    #[test]
    fn zero_weights_rotate_plainly() {
        let lb = WeightedRoundRobin::new();
        let instances = vec![
            ServiceInstance::new("a", 1).with_weight(0),
            ServiceInstance::new("b", 2).with_weight(0),
        ];
        assert_eq!(ports(&lb, &instances, 3), vec![1, 2, 1]);
    }

    #[test]
    fn empty_list_selects_nothing() {
        assert!(RoundRobin::new().choose("svc", &[], ip()).is_none());
        assert!(WeightedRoundRobin::new().choose("svc", &[], ip()).is_none());
    }
}

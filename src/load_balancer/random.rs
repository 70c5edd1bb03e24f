//! Random load balancing strategies.

use std::net::IpAddr;

use rand::Rng;

use crate::load_balancer::{instance::ServiceInstance, LoadBalancer, Selection};

/// Uniform random selector.
#[derive(Debug, Default)]
pub struct Random;

impl LoadBalancer for Random {
    fn choose(
        &self,
        _service_id: &str,
        instances: &[ServiceInstance],
        _client_ip: IpAddr,
    ) -> Option<Selection> {
        if instances.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..instances.len());
        Some(Selection::of(&instances[index]))
    }
}

/// Weighted random selector: a draw over `[0, total weight)` walked
/// against the cumulative weights.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl LoadBalancer for WeightedRandom {
    fn choose(
        &self,
        service_id: &str,
        instances: &[ServiceInstance],
        client_ip: IpAddr,
    ) -> Option<Selection> {
        let total: u64 = instances.iter().map(ServiceInstance::weight).sum();
        if total == 0 {
            return Random.choose(service_id, instances, client_ip);
        }

        let mut draw = rand::thread_rng().gen_range(0..total);
        for instance in instances {
            let weight = instance.weight();
            if draw < weight {
                return Some(Selection::of(instance));
            }
            draw -= weight;
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

    #[test]
    fn random_stays_in_bounds() {
        let instances = vec![ServiceInstance::new("a", 1), ServiceInstance::new("b", 2)];
        for _ in 0..100 {
            let port = Random.choose("svc", &instances, ip()).unwrap().instance.port;
            assert!(port == 1 || port == 2);
        }
        assert!(Random.choose("svc", &[], ip()).is_none());
    }

    #[test]
    fn weighted_random_skips_zero_weight() {
        let instances = vec![
            ServiceInstance::new("a", 1).with_weight(0),
            ServiceInstance::new("b", 2).with_weight(5),
        ];
        for _ in 0..100 {
            assert_eq!(WeightedRandom.choose("svc", &instances, ip()).unwrap().instance.port, 2);
        }
    }

    #[test]
    fn weighted_random_roughly_follows_weights() {
        let instances = vec![
            ServiceInstance::new("a", 1).with_weight(9),
            ServiceInstance::new("b", 2).with_weight(1),
        ];
        let heavy = (0..2000)
            .filter(|_| WeightedRandom.choose("svc", &instances, ip()).unwrap().instance.port == 1)
            .count();
        assert!(heavy > 1500, "heavy instance chosen {heavy} times");
    }
}

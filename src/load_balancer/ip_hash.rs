//! Client IP hash strategy.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use crate::load_balancer::{instance::ServiceInstance, LoadBalancer, Selection};

/// Maps a client IP to a fixed instance while the list is unchanged.
#[derive(Debug, Default)]
pub struct IpHash;

impl LoadBalancer for IpHash {
    fn choose(
        &self,
        _service_id: &str,
        instances: &[ServiceInstance],
        client_ip: IpAddr,
    ) -> Option<Selection> {
        if instances.is_empty() {
            return None;
        }
        // DefaultHasher::new() uses fixed keys, so the mapping is stable
        // across processes of the same build.
        let mut hasher = DefaultHasher::new();
        client_ip.to_canonical().hash(&mut hasher);
        let index = (hasher.finish() % instances.len() as u64) as usize;
        Some(Selection::of(&instances[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_client_same_instance() {
        let instances: Vec<_> = (0..5).map(|p| ServiceInstance::new("h", 8000 + p)).collect();
        let client: IpAddr = "192.168.1.100".parse().unwrap();
        let first = IpHash.choose("svc", &instances, client).unwrap().instance;
        for _ in 0..10 {
            assert_eq!(IpHash.choose("svc", &instances, client).unwrap().instance, first);
        }
    }

    #[test]
    fn clients_spread_over_instances() {
        let instances: Vec<_> = (0..4).map(|p| ServiceInstance::new("h", 8000 + p)).collect();
        let chosen: std::collections::HashSet<u16> = (0..=255u8)
            .map(|last| IpAddr::from([10, 0, 0, last]))
            .map(|ip| IpHash.choose("svc", &instances, ip).unwrap().instance.port)
            .collect();
        assert!(chosen.len() > 1);
    }
}

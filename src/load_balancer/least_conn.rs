//! Least Connections load balancing strategy.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::load_balancer::{instance::ServiceInstance, LoadBalancer, Selection};

type InstanceCounters = Mutex<HashMap<String, Arc<AtomicUsize>>>;

/// Least connections selector.
///
/// Keeps a live in-flight counter per service and instance (`host:port`).
/// The chosen instance's counter is incremented as part of the selection and
/// the returned [`ConnectionLease`] decrements it when dropped.
#[derive(Debug, Default)]
pub struct LeastConnections {
    services: DashMap<String, Arc<InstanceCounters>>,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for one instance of a service.
    pub fn active(&self, service_id: &str, instance: &ServiceInstance) -> usize {
        self.services
            .get(service_id)
            .and_then(|counters| {
                let counters = counters.lock().unwrap_or_else(PoisonError::into_inner);
                counters
                    .get(&instance.address())
                    .map(|c| c.load(Ordering::Acquire))
            })
            .unwrap_or(0)
    }

    fn counters(&self, service_id: &str) -> Arc<InstanceCounters> {
        self.services
            .entry(service_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

impl LoadBalancer for LeastConnections {
    fn choose(
        &self,
        service_id: &str,
        instances: &[ServiceInstance],
        _client_ip: IpAddr,
    ) -> Option<Selection> {
        if instances.is_empty() {
            return None;
        }

        let counters = self.counters(service_id);
        // Pick and increment under the service lock so two concurrent
        // selections cannot both see the same minimum.
        let mut counters = counters.lock().unwrap_or_else(PoisonError::into_inner);

        // In case of tie, the first one is selected (stability)
        let (instance, counter) = instances
            .iter()
            .map(|instance| {
                let counter = counters.entry(instance.address()).or_default().clone();
                (instance, counter)
            })
            .min_by_key(|(_, counter)| counter.load(Ordering::Acquire))?;

        counter.fetch_add(1, Ordering::AcqRel);
        Some(Selection {
            instance: instance.clone(),
            lease: Some(ConnectionLease { counter }),
        })
    }
}

/// A RAII guard for one in-flight request on an instance.
///
/// Dropping the lease decrements the counter exactly once; the counter never
/// goes below zero.
#[derive(Debug)]
pub struct ConnectionLease {
    counter: Arc<AtomicUsize>,
}

impl ConnectionLease {
    /// Release explicitly. Equivalent to dropping the lease.
    pub fn release(self) {}
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let mut prev = self.counter.load(Ordering::Acquire);
        while prev > 0 {
            match self.counter.compare_exchange_weak(
                prev,
                prev - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(x) => prev = x,
            }
        }
    }
}

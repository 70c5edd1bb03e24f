//! Keep-alive slots.
//!
//! # Responsibilities
//! - Hold at most one keep-alive connection per destination
//! - Own the expiry timer of each slot
//! - Decide on expiry whether the slot moves to idle or waits longer
//!
//! # Design Decisions
//! - The manager is passive: the pool spawns timers and acts on the
//!   [`Expiry`] verdict, so this type never touches the idle pool
//! - Decisions for one destination happen under its map entry lock, so a
//!   reuse and an expiry for the same slot never interleave
//! - A slot connection stays in the slot while it is reused; concurrent
//!   requests share it through its pending queue

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::pool::connection::{ConnState, ConnectionId, Destination, PooledConnection};

struct Slot {
    conn: Arc<PooledConnection>,
    timer: JoinHandle<()>,
}

/// Result of offering a connection to the keep-alive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The connection now holds the slot.
    Registered,
    /// The connection already held the slot; its activity was refreshed.
    AlreadyRegistered,
    /// Another open connection holds the slot.
    Occupied,
}

/// Verdict of a fired expiry timer.
#[derive(Debug)]
pub enum Expiry {
    /// Slot released; the connection should go to the idle pool.
    Expired(Arc<PooledConnection>),
    /// Still in use; wait this long and ask again.
    Rearm(Duration),
    /// The slot no longer holds this connection.
    Gone,
}

pub struct KeepAliveManager {
    slots: DashMap<Destination, Slot>,
    keep_alive: Duration,
}

impl KeepAliveManager {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            keep_alive,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// The slot connection for `destination`, if still open.
    pub fn get(&self, destination: &Destination) -> Option<Arc<PooledConnection>> {
        match self.slots.entry(destination.clone()) {
            Entry::Occupied(entry) if entry.get().conn.is_open() => {
                let conn = entry.get().conn.clone();
                conn.touch();
                Some(conn)
            }
            Entry::Occupied(entry) => {
                let slot = entry.remove();
                slot.timer.abort();
                None
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Offer `conn` to its destination's slot. `spawn_timer` is only called
    /// when the connection takes the slot.
    pub fn register(
        &self,
        conn: Arc<PooledConnection>,
        spawn_timer: impl FnOnce() -> JoinHandle<()>,
    ) -> Registration {
        match self.slots.entry(conn.destination().clone()) {
            Entry::Occupied(mut entry) => {
                let current = &entry.get().conn;
                if current.id() == conn.id() {
                    current.touch();
                    Registration::AlreadyRegistered
                } else if current.is_open() {
                    Registration::Occupied
                } else {
                    conn.set_state(ConnState::KeepAlive);
                    conn.touch();
                    let previous = entry.insert(Slot {
                        conn,
                        timer: spawn_timer(),
                    });
                    previous.timer.abort();
                    Registration::Registered
                }
            }
            Entry::Vacant(entry) => {
                conn.set_state(ConnState::KeepAlive);
                conn.touch();
                entry.insert(Slot {
                    conn,
                    timer: spawn_timer(),
                });
                Registration::Registered
            }
        }
    }

    /// Called by the slot's timer.
    pub fn expire(&self, destination: &Destination, id: ConnectionId) -> Expiry {
        let Entry::Occupied(entry) = self.slots.entry(destination.clone()) else {
            return Expiry::Gone;
        };
        let conn = &entry.get().conn;
        if conn.id() != id {
            return Expiry::Gone;
        }
        if !conn.is_open() {
            entry.remove();
            return Expiry::Gone;
        }
        if conn.pending_len() > 0 {
            return Expiry::Rearm(self.keep_alive);
        }
        let idle_for = conn.last_active().elapsed();
        if idle_for < self.keep_alive {
            return Expiry::Rearm(self.keep_alive - idle_for);
        }
        // The timer handle is dropped, not aborted: the caller is that timer.
        let slot = entry.remove();
        Expiry::Expired(slot.conn)
    }

    /// Drop `id` from its slot, cancelling the timer.
    pub fn remove(&self, destination: &Destination, id: ConnectionId) -> Option<Arc<PooledConnection>> {
        let (_, slot) = self
            .slots
            .remove_if(destination, |_, slot| slot.conn.id() == id)?;
        slot.timer.abort();
        Some(slot.conn)
    }

    /// Remove slots whose connection is closed. Returns how many.
    pub fn sweep_invalid(&self) -> usize {
        let mut removed = 0;
        self.slots.retain(|_, slot| {
            let keep = slot.conn.is_open();
            if !keep {
                slot.timer.abort();
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Empty every slot and return the connections.
    pub fn drain(&self) -> Vec<Arc<PooledConnection>> {
        let destinations: Vec<Destination> = self.slots.iter().map(|e| e.key().clone()).collect();
        destinations
            .iter()
            .filter_map(|dest| self.slots.remove(dest))
            .map(|(_, slot)| {
                slot.timer.abort();
                slot.conn
            })
            .collect()
    }

    /// Pending requests across all slot connections.
    pub fn pending_len(&self) -> usize {
        self.slots.iter().map(|e| e.conn.pending_len()).sum()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(port: u16) -> Arc<PooledConnection> {
        PooledConnection::new(Destination::new("127.0.0.1", port)).0
    }

    fn noop_timer() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn second_registration_is_noop() {
        let manager = KeepAliveManager::new(Duration::from_secs(60));
        let c = conn(1);
        assert_eq!(manager.register(c.clone(), noop_timer), Registration::Registered);
        assert_eq!(c.state(), ConnState::KeepAlive);

        let mut spawned = false;
        let again = manager.register(c.clone(), || {
            spawned = true;
            noop_timer()
        });
        assert_eq!(again, Registration::AlreadyRegistered);
        assert!(!spawned);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn open_slot_is_not_displaced() {
        let manager = KeepAliveManager::new(Duration::from_secs(60));
        let first = conn(1);
        let second = conn(1);
        manager.register(first.clone(), noop_timer);
        assert_eq!(manager.register(second.clone(), noop_timer), Registration::Occupied);
        assert_eq!(manager.get(first.destination()).unwrap().id(), first.id());

        first.close();
        assert_eq!(manager.register(second.clone(), noop_timer), Registration::Registered);
        assert_eq!(manager.get(second.destination()).unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn closed_slot_is_not_served() {
        let manager = KeepAliveManager::new(Duration::from_secs(60));
        let c = conn(1);
        manager.register(c.clone(), noop_timer);
        c.close();
        assert!(manager.get(c.destination()).is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_waits_for_inactivity() {
        let manager = KeepAliveManager::new(Duration::from_secs(60));
        let c = conn(1);
        manager.register(c.clone(), noop_timer);

        tokio::time::advance(Duration::from_secs(40)).await;
        manager.get(c.destination());
        tokio::time::advance(Duration::from_secs(20)).await;
        match manager.expire(c.destination(), c.id()) {
            Expiry::Rearm(remaining) => assert_eq!(remaining, Duration::from_secs(40)),
            other => panic!("expected rearm, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(matches!(manager.expire(c.destination(), c.id()), Expiry::Expired(_)));
        assert!(manager.is_empty());
        assert!(matches!(manager.expire(c.destination(), c.id()), Expiry::Gone));
    }

    #[tokio::test]
    async fn sweep_and_drain() {
        let manager = KeepAliveManager::new(Duration::from_secs(60));
        let a = conn(1);
        let b = conn(2);
        manager.register(a.clone(), noop_timer);
        manager.register(b.clone(), noop_timer);
        a.close();

        assert_eq!(manager.sweep_invalid(), 1);
        assert!(manager.remove(a.destination(), a.id()).is_none());
        let drained = manager.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id(), b.id());
        assert!(manager.is_empty());
    }
}

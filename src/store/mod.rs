//! Coordination stores
//!
//! The five authoritative structures the engine coordinates through:
//! occupation (who stands on a node), reservations (end-node / pickup /
//! parking locks), the path cache with its traffic model, and the two task
//! queues. All are in-process lease-KV maps; their APIs keep
//! set-if-absent-with-expiry and sorted-set-FIFO semantics so a networked
//! substrate can replace them behind the same types.

pub mod occupancy;
pub mod path_cache;
pub mod reservation;
pub mod task_queue;

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Entry with an optional expiry deadline
#[derive(Debug, Clone)]
struct LeaseEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> LeaseEntry<V> {
    fn expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Instant::now() >= at)
    }
}

/// Lock-free map with per-entry leases. Expired entries are treated as
/// absent and dropped lazily on access or during `purge_expired`.
#[derive(Debug, Default)]
pub(crate) struct LeaseMap<K: Eq + Hash + Clone, V: Clone> {
    inner: DashMap<K, LeaseEntry<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LeaseMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Set-if-absent-with-expiry. Returns the holder's value when the key
    /// is already live.
    pub fn insert_if_absent(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(), V> {
        let entry = LeaseEntry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        match self.inner.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut held) => {
                if held.get().expired() {
                    held.insert(entry);
                    Ok(())
                } else {
                    Err(held.get().value.clone())
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Unconditional write
    pub fn put(&self, key: K, value: V, ttl: Option<Duration>) {
        self.inner.insert(
            key,
            LeaseEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    /// Live value for a key
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let entry = self.inner.get(key)?;
            if !entry.expired() {
                return Some(entry.value.clone());
            }
            // Guard must drop before the removal below takes the shard's
            // write lock.
        }
        self.inner.remove_if(key, |_, e| e.expired());
        None
    }

    /// Remove a key, returning its live value
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner
            .remove(key)
            .and_then(|(_, e)| (!e.expired()).then_some(e.value))
    }

    /// Remove a key only when the predicate holds for its live value
    pub fn remove_if<F: FnOnce(&V) -> bool>(&self, key: &K, pred: F) -> bool {
        let mut fired = false;
        self.inner.remove_if(key, |_, e| {
            if e.expired() {
                return true;
            }
            fired = pred(&e.value);
            fired
        });
        fired
    }

    /// Snapshot of all live entries
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.inner
            .iter()
            .filter(|e| !e.value().expired())
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect()
    }

    /// Drop every entry whose lease ran out. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, e| !e.expired());
        before - self.inner.len()
    }

    /// Remove all entries matching a predicate on live values
    pub fn retain<F: FnMut(&K, &V) -> bool>(&self, mut keep: F) {
        self.inner
            .retain(|k, e| !e.expired() && keep(k, &e.value));
    }

    /// Live entry count
    pub fn len(&self) -> usize {
        self.inner.iter().filter(|e| !e.value().expired()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_if_absent_holds_until_expiry() {
        let map: LeaseMap<&str, u32> = LeaseMap::new();
        assert!(map
            .insert_if_absent("k", 1, Some(Duration::from_millis(20)))
            .is_ok());
        assert_eq!(map.insert_if_absent("k", 2, None), Err(1));

        std::thread::sleep(Duration::from_millis(25));
        assert!(map.insert_if_absent("k", 2, None).is_ok());
        assert_eq!(map.get(&"k"), Some(2));
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let map: LeaseMap<&str, u32> = LeaseMap::new();
        map.put("k", 1, Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(map.get(&"k"), None);
    }

    #[test]
    fn purge_drops_only_expired() {
        let map: LeaseMap<&str, u32> = LeaseMap::new();
        map.put("a", 1, Some(Duration::from_millis(10)));
        map.put("b", 2, None);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(map.purge_expired(), 1);
        assert_eq!(map.get(&"b"), Some(2));
    }

    #[test]
    fn remove_if_checks_live_value() {
        let map: LeaseMap<&str, u32> = LeaseMap::new();
        map.put("k", 1, None);
        assert!(!map.remove_if(&"k", |v| *v == 2));
        assert!(map.remove_if(&"k", |v| *v == 1));
        assert_eq!(map.get(&"k"), None);
    }
}

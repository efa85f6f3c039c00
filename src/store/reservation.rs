//! Reservation store
//!
//! Scheduler-side lock layer, logically distinct from occupation: end-node
//! selection, pickup locks and parking claims. Acquire has
//! set-if-absent-with-expiry semantics and, unlike occupation, never
//! refreshes on re-acquire.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::LeaseMap;
use crate::types::{NodeId, TaskId, VehicleId};

/// End-node allocation lock key
pub fn end_node_lock(cell: &NodeId) -> String {
    format!("endnode:lock:{}", cell)
}

/// Pickup lock key
pub fn pickup_lock(qr: &NodeId) -> String {
    format!("pickup:lock:{}", qr)
}

/// Parking claim key
pub fn parking_lock(qr: &NodeId) -> String {
    format!("parking:{}:lock", qr)
}

/// A held reservation
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// Holding vehicle
    pub owner_vehicle: VehicleId,
    /// Task the reservation serves, when known
    pub owner_task: Option<TaskId>,
    /// Acquisition time
    pub created_at: DateTime<Utc>,
}

/// Lease-based lock store
pub struct ReservationStore {
    locks: LeaseMap<String, Reservation>,
}

impl ReservationStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            locks: LeaseMap::new(),
        }
    }

    /// Try to take a lock. Returns `false` when another owner holds it;
    /// contention is a control signal, not an error. Re-acquiring an owned
    /// key does not extend its lease.
    pub fn acquire(
        &self,
        key: &str,
        vehicle: &VehicleId,
        task: Option<TaskId>,
        ttl: Duration,
    ) -> bool {
        self.locks
            .insert_if_absent(
                key.to_string(),
                Reservation {
                    owner_vehicle: vehicle.clone(),
                    owner_task: task,
                    created_at: Utc::now(),
                },
                Some(ttl),
            )
            .is_ok()
    }

    /// Release a lock unconditionally
    pub fn release(&self, key: &str) {
        self.locks.remove(&key.to_string());
    }

    /// Holder of a lock
    pub fn owner(&self, key: &str) -> Option<Reservation> {
        self.locks.get(&key.to_string())
    }

    /// Release every lock held by a vehicle
    pub fn clear_vehicle(&self, vehicle: &VehicleId) {
        self.locks
            .retain(|_, reservation| reservation.owner_vehicle != *vehicle);
    }

    /// Keys currently held by a vehicle
    pub fn keys_of(&self, vehicle: &VehicleId) -> Vec<String> {
        self.locks
            .snapshot()
            .into_iter()
            .filter(|(_, r)| r.owner_vehicle == *vehicle)
            .map(|(k, _)| k)
            .collect()
    }
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

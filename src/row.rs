//! Row direction locks and batch row coordination
//!
//! A horizontal aisle is one-way while vehicles are inside it: the first
//! arrival fixes the direction, same-direction vehicles join, opposing
//! requests are refused. Batch coordination steers every staged task of a
//! pickup batch into the same target row so concurrent shuttles converge on
//! one aisle instead of scattering.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::concurrency::{spawn_periodic, CancelToken};
use crate::store::LeaseMap;
use crate::types::{Direction, FloorId, RowDirection, VehicleId};

/// A live one-way lock on `(floor, row)`
#[derive(Debug, Clone)]
pub struct RowLock {
    /// Locked direction
    pub direction: RowDirection,
    /// Vehicles currently inside the row
    pub members: HashSet<VehicleId>,
    locked_at: Instant,
    last_activity: Instant,
}

/// Direction lock store plus batch row assignments
pub struct RowCoordinator {
    locks: DashMap<(FloorId, i32), RowLock>,
    batch_rows: LeaseMap<String, i32>,
    idle_expiry: Duration,
    stale_expiry: Duration,
    batch_ttl: Duration,
}

impl RowCoordinator {
    /// Coordinator with the configured expiries
    pub fn new(idle_expiry: Duration, stale_expiry: Duration, batch_ttl: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            batch_rows: LeaseMap::new(),
            idle_expiry,
            stale_expiry,
            batch_ttl,
        }
    }

    /// Request to enter a row in a direction. The first vehicle creates the
    /// lock; matching directions join; opposing directions are refused.
    pub fn request(
        &self,
        floor: FloorId,
        row: i32,
        direction: RowDirection,
        vehicle: &VehicleId,
    ) -> bool {
        let mut entry = self.locks.entry((floor, row)).or_insert_with(|| {
            debug!(floor, row, ?direction, vehicle = %vehicle, "row lock created");
            RowLock {
                direction,
                members: HashSet::new(),
                locked_at: Instant::now(),
                last_activity: Instant::now(),
            }
        });
        if entry.direction != direction {
            // An idle lock may flip direction instead of refusing.
            if entry.members.is_empty() && entry.last_activity.elapsed() >= self.idle_expiry {
                entry.direction = direction;
                entry.locked_at = Instant::now();
            } else {
                warn!(floor, row, vehicle = %vehicle, "opposing row direction refused");
                return false;
            }
        }
        entry.members.insert(vehicle.clone());
        entry.last_activity = Instant::now();
        true
    }

    /// Leave a row. The lock disappears with its last member.
    pub fn release(&self, floor: FloorId, row: i32, vehicle: &VehicleId) {
        let empty = {
            match self.locks.get_mut(&(floor, row)) {
                Some(mut lock) => {
                    lock.members.remove(vehicle);
                    lock.last_activity = Instant::now();
                    lock.members.is_empty()
                }
                None => false,
            }
        };
        if empty {
            self.locks.remove(&(floor, row));
            debug!(floor, row, "row lock released");
        }
    }

    /// Remove a vehicle from every row it is registered in
    pub fn clear_vehicle(&self, vehicle: &VehicleId) {
        let keys: Vec<(FloorId, i32)> = self
            .locks
            .iter()
            .filter(|e| e.value().members.contains(vehicle))
            .map(|e| *e.key())
            .collect();
        for (floor, row) in keys {
            self.release(floor, row, vehicle);
        }
    }

    /// Locked direction of a row, if any
    pub fn direction_of(&self, floor: FloorId, row: i32) -> Option<RowDirection> {
        self.locks.get(&(floor, row)).map(|l| l.direction)
    }

    /// One-way gate for the pathfinder: may a vehicle travel `direction`
    /// inside this row right now?
    pub fn permits(&self, floor: FloorId, row: i32, direction: Direction) -> bool {
        match self.locks.get(&(floor, row)) {
            Some(lock) => lock.direction.travel() == direction,
            None => true,
        }
    }

    /// Live lock snapshot of a row
    pub fn lock(&self, floor: FloorId, row: i32) -> Option<RowLock> {
        self.locks.get(&(floor, row)).map(|l| l.clone())
    }

    /// Row every task of a pickup batch converges on. Returns the existing
    /// assignment or persists the given row for the batch TTL.
    pub fn assign_row_for_batch(&self, batch_id: &str, row: i32) -> i32 {
        match self
            .batch_rows
            .insert_if_absent(batch_id.to_string(), row, Some(self.batch_ttl))
        {
            Ok(()) => {
                info!(batch = batch_id, row, "batch row assigned");
                row
            }
            Err(existing) => existing,
        }
    }

    /// Existing batch assignment, if any
    pub fn batch_row(&self, batch_id: &str) -> Option<i32> {
        self.batch_rows.get(&batch_id.to_string())
    }

    /// Drop idle-expired and stale locks
    pub fn sweep(&self) -> usize {
        let idle = self.idle_expiry;
        let stale = self.stale_expiry;
        let before = self.locks.len();
        self.locks.retain(|_, lock| {
            let stale_hit = lock.locked_at.elapsed() >= stale;
            let idle_hit = lock.members.is_empty() && lock.last_activity.elapsed() >= idle;
            !(stale_hit || idle_hit)
        });
        self.batch_rows.purge_expired();
        before - self.locks.len()
    }

    /// Spawn the sweeper loop
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        token: CancelToken,
    ) -> JoinHandle<()> {
        let rows = self;
        spawn_periodic("row-sweeper", interval, token, move || {
            let rows = Arc::clone(&rows);
            async move {
                let dropped = rows.sweep();
                if dropped > 0 {
                    warn!(dropped, "stale row locks swept");
                }
                Ok(())
            }
        })
    }
}

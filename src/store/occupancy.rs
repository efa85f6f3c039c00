//! Node occupation store
//!
//! The sole source of truth for "is a node physically occupied right now".
//! Ownership is leased: a vehicle that stalls beyond the lease silently
//! relinquishes the node. A late release after a new owner took the node is
//! refused and logged as drift.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use super::LeaseMap;
use crate::error::{WcsError, WcsResult};
use crate::types::{NodeId, VehicleId};

/// Current-owner map with lease semantics
pub struct OccupancyStore {
    owners: LeaseMap<NodeId, VehicleId>,
    lease: Duration,
}

impl OccupancyStore {
    /// Store with the given lease applied to every `block`
    pub fn new(lease: Duration) -> Self {
        Self {
            owners: LeaseMap::new(),
            lease,
        }
    }

    /// Claim a node. Re-claiming an owned node refreshes the lease;
    /// claiming another vehicle's node fails with `LockHeld`.
    pub fn block(&self, node: &NodeId, owner: &VehicleId) -> WcsResult<()> {
        match self
            .owners
            .insert_if_absent(node.clone(), owner.clone(), Some(self.lease))
        {
            Ok(()) => Ok(()),
            Err(holder) if holder == *owner => {
                self.owners
                    .put(node.clone(), owner.clone(), Some(self.lease));
                Ok(())
            }
            Err(holder) => Err(WcsError::LockHeld {
                key: node.to_string(),
                owner: holder.to_string(),
            }),
        }
    }

    /// Release a node. Only the owner may release; a mismatch is refused
    /// and logged, preserving the new owner.
    pub fn unblock(&self, node: &NodeId, owner: &VehicleId) -> bool {
        let released = self.owners.remove_if(node, |holder| holder == owner);
        if !released {
            if let Some(holder) = self.owners.get(node) {
                warn!(
                    node = %node,
                    requested_by = %owner,
                    held_by = %holder,
                    "late unblock refused, owner mismatch"
                );
            }
        }
        released
    }

    /// Atomic move hand-off: claim `to` first, then release `from`. When
    /// the claim fails, `from` is left untouched.
    pub fn handle_move(
        &self,
        vehicle: &VehicleId,
        from: Option<&NodeId>,
        to: &NodeId,
    ) -> WcsResult<()> {
        self.block(to, vehicle)?;
        if let Some(from) = from {
            if from != to {
                self.unblock(from, vehicle);
            }
        }
        debug!(vehicle = %vehicle, to = %to, "occupation hand-off");
        Ok(())
    }

    /// Release every node owned by a vehicle
    pub fn clear_vehicle(&self, vehicle: &VehicleId) {
        self.owners.retain(|_, owner| owner != vehicle);
    }

    /// Owner of a node, if any
    pub fn owner(&self, node: &NodeId) -> Option<VehicleId> {
        self.owners.get(node)
    }

    /// Snapshot for pathfinder avoidance
    pub fn snapshot(&self) -> HashMap<NodeId, VehicleId> {
        self.owners.snapshot().into_iter().collect()
    }

    /// Nodes owned by one vehicle
    pub fn nodes_of(&self, vehicle: &VehicleId) -> Vec<NodeId> {
        self.owners
            .snapshot()
            .into_iter()
            .filter(|(_, owner)| owner == vehicle)
            .map(|(node, _)| node)
            .collect()
    }
}

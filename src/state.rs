//! Vehicle state cache
//!
//! Eventually consistent view of the fleet, fed by periodic info snapshots
//! and semantic events. Writes for one vehicle are funneled through its
//! dispatcher or poller task, so entries see a single writer.

use dashmap::DashMap;

use crate::events::VehicleInfo;
use crate::types::{FloorId, NodeId, TaskId, Vehicle, VehicleId, VehicleKind, VehicleStatus};

/// In-process fleet state
pub struct VehicleStateCache {
    vehicles: DashMap<VehicleId, Vehicle>,
    /// Poller write-through, keyed `(<amr>, <kind>)`
    amr_data: DashMap<(String, String), serde_json::Value>,
    /// Observed `has_box` overrides; map data itself stays immutable
    node_boxes: DashMap<NodeId, bool>,
}

impl VehicleStateCache {
    /// Empty cache
    pub fn new() -> Self {
        Self {
            vehicles: DashMap::new(),
            amr_data: DashMap::new(),
            node_boxes: DashMap::new(),
        }
    }

    /// Seed a vehicle record if absent
    pub fn ensure(&self, id: &VehicleId, kind: VehicleKind, floor: FloorId) {
        self.vehicles.entry(id.clone()).or_insert_with(|| Vehicle {
            id: id.clone(),
            kind,
            node: None,
            floor,
            carrying: false,
            status: VehicleStatus::Idle,
            active_task: None,
        });
    }

    /// Apply a periodic info snapshot
    pub fn apply_info(&self, kind: VehicleKind, info: &VehicleInfo) {
        let mut entry = self
            .vehicles
            .entry(info.vehicle.clone())
            .or_insert_with(|| Vehicle {
                id: info.vehicle.clone(),
                kind,
                node: None,
                floor: info.floor,
                carrying: false,
                status: VehicleStatus::Idle,
                active_task: None,
            });
        entry.node = info.node.clone();
        entry.floor = info.floor;
        entry.status = info.status;
        entry.carrying = info.carrying;
    }

    /// A vehicle record
    pub fn get(&self, id: &VehicleId) -> Option<Vehicle> {
        self.vehicles.get(id).map(|v| v.clone())
    }

    /// Update position
    pub fn set_node(&self, id: &VehicleId, node: NodeId) {
        if let Some(mut v) = self.vehicles.get_mut(id) {
            v.node = Some(node);
        }
    }

    /// Update position and floor together (lifter transfer)
    pub fn set_location(&self, id: &VehicleId, node: NodeId, floor: FloorId) {
        if let Some(mut v) = self.vehicles.get_mut(id) {
            v.node = Some(node);
            v.floor = floor;
        }
    }

    /// Update status
    pub fn set_status(&self, id: &VehicleId, status: VehicleStatus) {
        if let Some(mut v) = self.vehicles.get_mut(id) {
            v.status = status;
        }
    }

    /// Update carrying bit
    pub fn set_carrying(&self, id: &VehicleId, carrying: bool) {
        if let Some(mut v) = self.vehicles.get_mut(id) {
            v.carrying = carrying;
        }
    }

    /// Bind or clear the active task
    pub fn set_active_task(&self, id: &VehicleId, task: Option<TaskId>) {
        if let Some(mut v) = self.vehicles.get_mut(id) {
            v.active_task = task;
        }
    }

    /// Snapshot of the whole fleet
    pub fn all(&self) -> Vec<Vehicle> {
        self.vehicles.iter().map(|v| v.clone()).collect()
    }

    /// Idle shuttles available for dispatch
    pub fn idle_shuttles(&self) -> Vec<Vehicle> {
        self.vehicles
            .iter()
            .filter(|v| {
                v.kind == VehicleKind::Shuttle
                    && v.status == VehicleStatus::Idle
                    && v.active_task.is_none()
            })
            .map(|v| v.clone())
            .collect()
    }

    /// Record an observed pallet presence change on a node
    pub fn set_node_has_box(&self, node: &NodeId, has_box: bool) {
        self.node_boxes.insert(node.clone(), has_box);
    }

    /// Observed pallet presence, falling back to the map's load-time flag
    pub fn node_has_box(&self, node: &NodeId, map_default: bool) -> bool {
        self.node_boxes
            .get(node)
            .map(|b| *b)
            .unwrap_or(map_default)
    }

    /// Poller write-through for one AMR datum
    pub fn set_amr_data(&self, amr: &str, kind: &str, value: serde_json::Value) {
        self.amr_data.insert((amr.to_string(), kind.to_string()), value);
    }

    /// All cached data of one AMR, keyed by kind. `None` when the AMR has
    /// never reported.
    pub fn amr_snapshot(&self, amr: &str) -> Option<serde_json::Value> {
        let mut map = serde_json::Map::new();
        for entry in self.amr_data.iter() {
            let (id, kind) = entry.key();
            if id == amr {
                map.insert(kind.clone(), entry.value().clone());
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(map))
        }
    }
}

impl Default for VehicleStateCache {
    fn default() -> Self {
        Self::new()
    }
}

//! Mission coordination
//!
//! Builds the next mission segment for a vehicle: same-floor segments run
//! straight to the target with the pickup/drop action on the final edge;
//! cross-floor segments run to the lifter entry node and interlock with the
//! lifter queue (lookahead), truncating short of the entry when the cabin
//! is elsewhere or in motion.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::TrafficConfig;
use crate::error::{WcsError, WcsResult};
use crate::events::{MissionEnvelope, OnArrival};
use crate::graph::topo::{find_shuttle_path, ShuttleSearchRequest};
use crate::graph::WarehouseMap;
use crate::lifter::LifterCoordinator;
use crate::priority;
use crate::row::RowCoordinator;
use crate::state::VehicleStateCache;
use crate::store::occupancy::OccupancyStore;
use crate::store::path_cache::PathCache;
use crate::types::{
    FloorId, LifterStatus, NodeId, StepAction, Task, VehicleId, VehiclePath,
};

/// What a segment is for; decides the final action and arrival tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPurpose {
    /// Drive to the pickup node and lift the pallet
    Pickup,
    /// Carry the pallet to the committed end node
    Delivery,
}

/// Next-segment builder
pub struct MissionCoordinator {
    map: Arc<WarehouseMap>,
    occupancy: Arc<OccupancyStore>,
    path_cache: Arc<PathCache>,
    rows: Arc<RowCoordinator>,
    lifter: Arc<LifterCoordinator>,
    state: Arc<VehicleStateCache>,
    traffic_cfg: TrafficConfig,
}

impl MissionCoordinator {
    /// Coordinator over the shared stores
    pub fn new(
        map: Arc<WarehouseMap>,
        occupancy: Arc<OccupancyStore>,
        path_cache: Arc<PathCache>,
        rows: Arc<RowCoordinator>,
        lifter: Arc<LifterCoordinator>,
        state: Arc<VehicleStateCache>,
        traffic_cfg: TrafficConfig,
    ) -> Self {
        Self {
            map,
            occupancy,
            path_cache,
            rows,
            lifter,
            state,
            traffic_cfg,
        }
    }

    /// Build the next segment toward the task's current objective
    pub async fn next_segment(
        &self,
        vehicle: &VehicleId,
        task: &Task,
        purpose: SegmentPurpose,
        segment: u32,
    ) -> WcsResult<MissionEnvelope> {
        let (final_node, final_floor) = match purpose {
            SegmentPurpose::Pickup => (task.pickup_node.clone(), task.pickup_floor),
            SegmentPurpose::Delivery => {
                let node = task
                    .end_node
                    .clone()
                    .ok_or_else(|| WcsError::Validation("task has no end node".into()))?;
                let floor = task
                    .end_floor
                    .ok_or_else(|| WcsError::Validation("task has no end floor".into()))?;
                (node, floor)
            }
        };

        let v = self
            .state
            .get(vehicle)
            .ok_or_else(|| WcsError::VehicleNotFound(vehicle.to_string()))?;
        let current = v
            .node
            .clone()
            .ok_or_else(|| WcsError::Validation(format!("{} is not localized", vehicle)))?;
        let current_floor = v.floor;
        let cross_floor = current_floor != final_floor;

        let (target, on_arrival, last_action) = if cross_floor {
            let entry = self.lifter_entry(current_floor)?;
            (entry, OnArrival::ArrivedAtLifter, StepAction::StopAtNode)
        } else {
            let action = match purpose {
                SegmentPurpose::Pickup => StepAction::PickUp,
                SegmentPurpose::Delivery => StepAction::DropOff,
            };
            let arrival = match purpose {
                SegmentPurpose::Pickup => OnArrival::PickupComplete,
                SegmentPurpose::Delivery => OnArrival::TaskComplete,
            };
            (final_node.clone(), arrival, action)
        };

        let graph = self.map.floor(current_floor)?;
        let mut avoid: HashSet<NodeId> =
            self.occupancy.snapshot().into_keys().collect();
        avoid.remove(&current);
        avoid.remove(&target);

        let traffic = self.path_cache.traffic_view(&self.traffic_cfg);
        let permit = |row: i32, d: crate::types::Direction| {
            self.rows.permits(current_floor, row, d)
        };
        let request = ShuttleSearchRequest {
            vehicle,
            carrying: v.carrying,
            avoid,
            occupied: self.occupancy.snapshot(),
            traffic: &traffic,
            cfg: &self.traffic_cfg,
            row_permit: Some(&permit),
            last_action,
        };

        let mut path =
            find_shuttle_path(graph, &current, &target, &request).ok_or(WcsError::NoPath {
                from: current.to_string(),
                to: target.to_string(),
                floor: current_floor,
            })?;
        let mut arrival = on_arrival;
        let score = priority::score(v.carrying, &task.id);

        if cross_floor {
            if let Some(truncated) = self
                .lifter_lookahead(vehicle, &target, &path, score)
                .await?
            {
                path = truncated;
                arrival = OnArrival::WaitingForLifter;
            }
        }

        self.path_cache
            .save_path(vehicle, path.clone(), v.carrying, score, None);

        let simulation = path.node_ids();
        debug!(
            vehicle = %vehicle,
            task = %task.id,
            steps = path.total_step,
            ?arrival,
            "segment built"
        );

        Ok(MissionEnvelope {
            vehicle: vehicle.clone(),
            task_id: task.id,
            path,
            on_arrival: arrival,
            segment,
            final_target_node: final_node,
            final_target_floor: final_floor,
            pickup_node_qr: Some(task.pickup_node.clone()),
            end_node_qr: task.end_node.clone(),
            item_info: task.item_info.clone(),
            is_carrying: v.carrying,
            running_path_simulation: simulation,
        })
    }

    /// Lifter-entry node on a floor: the configured well-known id, with a
    /// catalog lookup as fallback.
    pub fn lifter_entry(&self, floor: FloorId) -> WcsResult<NodeId> {
        if let Some(entry) = self.lifter.tower().entry_node(floor) {
            return Ok(entry);
        }
        self.map
            .floor(floor)?
            .nodes()
            .find(|n| n.cell_type.as_deref() == Some("lifter_entry"))
            .map(|n| n.id.clone())
            .ok_or_else(|| {
                WcsError::Validation(format!("no lifter entry node on floor {}", floor))
            })
    }

    /// Lifter-exit node on a floor, for the continuation segment
    pub fn lifter_exit(&self, floor: FloorId) -> WcsResult<NodeId> {
        self.lifter
            .tower()
            .exit_node(floor)
            .ok_or_else(|| WcsError::Validation(format!("no lifter exit node on floor {}", floor)))
    }

    /// Cross-floor lookahead: when the cabin is away or moving, request it
    /// and truncate the path to stop one node short of the entry. Returns
    /// the truncated path, or `None` when the cabin already waits here.
    async fn lifter_lookahead(
        &self,
        vehicle: &VehicleId,
        entry: &NodeId,
        path: &VehiclePath,
        score: i64,
    ) -> WcsResult<Option<VehiclePath>> {
        let v = self
            .state
            .get(vehicle)
            .ok_or_else(|| WcsError::VehicleNotFound(vehicle.to_string()))?;
        let status = self.lifter.status().await?;
        let ready =
            status.status == LifterStatus::Idle && status.current_floor == v.floor;
        if ready {
            return Ok(None);
        }

        self.lifter.request_lifter(v.floor, vehicle, score);
        info!(vehicle = %vehicle, floor = v.floor, "lifter away, mission truncated");

        let entry_index = path.steps.iter().position(|s| s.node == *entry);
        let truncated = match entry_index {
            Some(0) | None => VehiclePath::empty(),
            Some(k) => {
                let mut steps: Vec<_> = path.steps[..k].to_vec();
                if let Some(last) = steps.last_mut() {
                    last.action = StepAction::StopAtNode;
                }
                VehiclePath::new(steps)
            }
        };
        Ok(Some(truncated))
    }
}

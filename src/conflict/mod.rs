//! Conflict resolution
//!
//! Entered when a shuttle reports `waiting`. Strategies are tried in
//! order: priority yield, tier-validated reroute, backtrack to a parking
//! node, backtrack and hold, wait in place with escalating tolerance. Wait
//! time widens the accepted reroute cost; at the hard cap the reroute goes
//! through at any cost.

pub mod deadlock;
pub mod parking;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::config::{ConflictConfig, TrafficConfig};
use crate::error::{WcsError, WcsResult};
use crate::events::{CommandAction, EgressCommand, EventBus, VehicleCommand};
use crate::graph::topo::{
    build_path, find_constrained_path, find_shuttle_path, ShuttleSearchRequest,
};
use crate::graph::{astar, WarehouseMap};
use crate::priority::{self, Contender};
use crate::row::RowCoordinator;
use crate::state::VehicleStateCache;
use crate::store::occupancy::OccupancyStore;
use crate::store::path_cache::PathCache;
use crate::store::reservation::ReservationStore;
use crate::store::task_queue::ShuttleTaskQueue;
use crate::types::{Direction, NodeId, StepAction, VehicleId, VehiclePath};

/// How a waiting report was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// This vehicle outranks the blocker; the blocker was told to yield
    YieldRequested {
        /// Vehicle asked to clear the way
        blocker: VehicleId,
    },
    /// A replacement path was published
    Rerouted {
        /// Steps of the new path
        path_len: usize,
        /// Whether the any-cost emergency gate was used
        emergency: bool,
    },
    /// Backtrack to a reserved parking node
    BacktrackToParking {
        /// Reserved node
        parking: NodeId,
    },
    /// Backtrack to a safe node and hold
    BacktrackAndWait {
        /// Hold position
        node: NodeId,
    },
    /// Keep waiting; re-check after the returned delay
    Waiting {
        /// Seconds already waited
        waited_secs: u64,
        /// Delay until the next attempt
        next_check: Duration,
    },
    /// All strategies exhausted
    Failed,
}

#[derive(Debug, Clone)]
struct WaitState {
    since: Instant,
    retries: u32,
}

/// Multi-tier conflict resolver
pub struct ConflictResolver {
    map: Arc<WarehouseMap>,
    occupancy: Arc<OccupancyStore>,
    reservations: Arc<ReservationStore>,
    path_cache: Arc<PathCache>,
    rows: Arc<RowCoordinator>,
    state: Arc<VehicleStateCache>,
    tasks: Arc<ShuttleTaskQueue>,
    bus: EventBus,
    cfg: ConflictConfig,
    traffic_cfg: TrafficConfig,
    waits: DashMap<VehicleId, WaitState>,
}

impl ConflictResolver {
    /// Resolver over the shared stores
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        map: Arc<WarehouseMap>,
        occupancy: Arc<OccupancyStore>,
        reservations: Arc<ReservationStore>,
        path_cache: Arc<PathCache>,
        rows: Arc<RowCoordinator>,
        state: Arc<VehicleStateCache>,
        tasks: Arc<ShuttleTaskQueue>,
        bus: EventBus,
        cfg: ConflictConfig,
        traffic_cfg: TrafficConfig,
    ) -> Self {
        Self {
            map,
            occupancy,
            reservations,
            path_cache,
            rows,
            state,
            tasks,
            bus,
            cfg,
            traffic_cfg,
            waits: DashMap::new(),
        }
    }

    /// Record when a vehicle started waiting. Idempotent; the first mark
    /// wins so escalation accumulates across repeated reports.
    pub fn mark_waiting(&self, vehicle: &VehicleId, since: Instant) {
        self.waits
            .entry(vehicle.clone())
            .or_insert(WaitState { since, retries: 0 });
    }

    /// Forget a vehicle's wait state (it resumed or finished)
    pub fn clear_waiting(&self, vehicle: &VehicleId) {
        self.waits.remove(vehicle);
    }

    /// Seconds a vehicle has been waiting
    pub fn waited(&self, vehicle: &VehicleId) -> Duration {
        self.waits
            .get(vehicle)
            .map(|w| w.since.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Resolve one waiting report
    pub async fn handle_waiting(
        &self,
        vehicle: &VehicleId,
        waiting_at: &NodeId,
        target_node: &NodeId,
        blocked_by: &VehicleId,
    ) -> WcsResult<Resolution> {
        self.mark_waiting(vehicle, Instant::now());
        let waited = self.waited(vehicle);
        let retries = self.waits.get(vehicle).map(|w| w.retries).unwrap_or(0);

        // 1. Priority: an outranked blocker is told to clear the way while
        //    this vehicle holds course.
        if let Some(blocker) = self.yield_check(vehicle, blocked_by) {
            self.bus.publish(EgressCommand::Command(VehicleCommand {
                vehicle: blocker.clone(),
                action: CommandAction::Yield,
                path: None,
                reason: format!("yield to {}", vehicle),
            }));
            info!(vehicle = %vehicle, blocker = %blocker, "yield requested");
            return Ok(Resolution::YieldRequested { blocker });
        }

        // 2. Reroute around the blocker, validated against the tier gates.
        let emergency = waited.as_secs() >= self.cfg.emergency_wait_secs;
        if let Some(resolution) = self
            .try_reroute(vehicle, waiting_at, target_node, blocked_by, waited, retries, emergency)
            .await?
        {
            return Ok(resolution);
        }

        // 3. Backtrack along the original path toward a parking node or a
        //    safe hold position.
        if let Some(resolution) = self.try_backtrack(vehicle, waiting_at, target_node)? {
            return Ok(resolution);
        }

        // 4. Wait in place with escalating tolerance.
        if emergency {
            warn!(vehicle = %vehicle, "conflict unresolvable, no emergency path");
            return Ok(Resolution::Failed);
        }
        let next_check = if waited.as_secs() < self.cfg.initial_wait_secs {
            Duration::from_secs(self.cfg.initial_wait_secs)
        } else {
            Duration::from_secs(self.cfg.retry_interval_secs)
        };
        debug!(vehicle = %vehicle, waited = waited.as_secs(), "waiting in place");
        Ok(Resolution::Waiting {
            waited_secs: waited.as_secs(),
            next_check,
        })
    }

    /// Returns the blocker when this vehicle outranks it
    fn yield_check(&self, vehicle: &VehicleId, blocked_by: &VehicleId) -> Option<VehicleId> {
        let mine = self.contender(vehicle)?;
        let theirs = self.contender(blocked_by)?;
        let verdict = priority::compare(&mine, &theirs);
        (verdict.winner == *vehicle).then(|| blocked_by.clone())
    }

    fn contender(&self, vehicle: &VehicleId) -> Option<Contender> {
        let v = self.state.get(vehicle)?;
        let task = self.tasks.active_task_of(vehicle)?;
        Some(Contender {
            vehicle: vehicle.clone(),
            carrying: v.carrying,
            task: task.id,
        })
    }

    /// Accepted path length for the current tier, in percent of the
    /// original length
    fn allowed_pct(&self, carrying: bool, retries: u32, waited: Duration) -> u32 {
        let base = if carrying {
            self.cfg.t1_carrying_pct
        } else {
            self.cfg.t1_empty_pct
        };
        let retry_bonus = retries * self.cfg.retry_step_pct;
        let wait_steps = (waited.as_secs() / self.cfg.wait_step_secs) as u32;
        let wait_bonus = wait_steps * self.cfg.wait_step_pct;
        (base + retry_bonus + wait_bonus).min(self.cfg.max_pct)
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_reroute(
        &self,
        vehicle: &VehicleId,
        waiting_at: &NodeId,
        target_node: &NodeId,
        blocked_by: &VehicleId,
        waited: Duration,
        retries: u32,
        emergency: bool,
    ) -> WcsResult<Option<Resolution>> {
        let v = self
            .state
            .get(vehicle)
            .ok_or_else(|| WcsError::VehicleNotFound(vehicle.to_string()))?;
        let original = match self.path_cache.get_path(vehicle) {
            Some(p) => p,
            None => return Ok(None),
        };
        let destination = match original.path.steps.last() {
            Some(step) => step.node.clone(),
            None => return Ok(None),
        };
        let last_action = original
            .path
            .steps
            .last()
            .map(|s| s.action)
            .unwrap_or(StepAction::NoAction);
        let graph = self.map.floor(v.floor)?;

        let mut avoid: HashSet<NodeId> = HashSet::new();
        avoid.insert(target_node.clone());
        if let Some(blocker_path) = self.path_cache.get_path(blocked_by) {
            avoid.extend(blocker_path.path.node_ids());
        }
        avoid.remove(waiting_at);
        avoid.remove(&destination);

        let traffic = self.path_cache.traffic_view(&self.traffic_cfg);
        let permit =
            |row: i32, d: Direction| self.rows.permits(v.floor, row, d);
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

        let reroute = if emergency {
            // Any path is acceptable past the hard wait cap.
            find_shuttle_path(graph, waiting_at, &destination, &request)
        } else {
            find_constrained_path(graph, waiting_at, &destination, &request)
        };
        // Every attempt counts toward the retry tier, widening the next
        // gate even when this one fails.
        if let Some(mut wait) = self.waits.get_mut(vehicle) {
            wait.retries += 1;
        }
        let reroute = match reroute {
            Some(p) => p,
            None => return Ok(None),
        };

        if !emergency {
            let allowed = self.allowed_pct(v.carrying, retries, waited);
            let limit = (original.path.total_step as u64) * u64::from(allowed) / 100;
            if reroute.total_step as u64 > limit {
                debug!(
                    vehicle = %vehicle,
                    new_len = reroute.total_step,
                    allowed_pct = allowed,
                    "reroute over tier limit"
                );
                return Ok(None);
            }
        }

        self.path_cache.save_path(
            vehicle,
            reroute.clone(),
            v.carrying,
            original.metadata.priority,
            None,
        );
        let path_len = reroute.total_step;
        self.bus.publish(EgressCommand::Command(VehicleCommand {
            vehicle: vehicle.clone(),
            action: CommandAction::Reroute,
            path: Some(reroute),
            reason: if emergency {
                "emergency reroute, wait cap reached".into()
            } else {
                format!("reroute around {}", blocked_by)
            },
        }));
        info!(vehicle = %vehicle, path_len, emergency, "reroute published");
        Ok(Some(Resolution::Rerouted {
            path_len,
            emergency,
        }))
    }

    fn try_backtrack(
        &self,
        vehicle: &VehicleId,
        waiting_at: &NodeId,
        target_node: &NodeId,
    ) -> WcsResult<Option<Resolution>> {
        let v = self
            .state
            .get(vehicle)
            .ok_or_else(|| WcsError::VehicleNotFound(vehicle.to_string()))?;
        let original = match self.path_cache.get_path(vehicle) {
            Some(p) => p,
            None => return Ok(None),
        };
        let graph = self.map.floor(v.floor)?;
        let nodes = original.path.node_ids();
        let here = match nodes.iter().position(|n| n == waiting_at) {
            Some(i) => i,
            None => return Ok(None),
        };

        // Walk backward, at most max_backtrack_steps candidates.
        let candidates = nodes[..here]
            .iter()
            .rev()
            .take(self.cfg.max_backtrack_steps);
        for candidate in candidates {
            let occupied_by_other = self
                .occupancy
                .owner(candidate)
                .map_or(false, |owner| owner != *vehicle);
            if occupied_by_other || candidate == target_node {
                continue;
            }

            if let Some(parking) = parking::find_parking_node(
                graph,
                &self.path_cache,
                &self.reservations,
                candidate,
                target_node,
                vehicle,
                self.cfg.parking_max_distance,
                Duration::from_secs(self.cfg.parking_ttl_secs),
            ) {
                let path = self.backtrack_route(graph, &nodes, here, candidate, Some(&parking));
                self.bus.publish(EgressCommand::Command(VehicleCommand {
                    vehicle: vehicle.clone(),
                    action: CommandAction::BacktrackToParking,
                    path,
                    reason: format!("parking at {}", parking),
                }));
                info!(vehicle = %vehicle, parking = %parking, "backtrack to parking");
                return Ok(Some(Resolution::BacktrackToParking { parking }));
            }

            let safe = !self.path_cache.is_node_in_any_path(candidate, Some(vehicle));
            if safe {
                let path = self.backtrack_route(graph, &nodes, here, candidate, None);
                self.bus.publish(EgressCommand::Command(VehicleCommand {
                    vehicle: vehicle.clone(),
                    action: CommandAction::BacktrackAndWait,
                    path,
                    reason: format!("hold at {}", candidate),
                }));
                info!(vehicle = %vehicle, node = %candidate, "backtrack and wait");
                return Ok(Some(Resolution::BacktrackAndWait {
                    node: candidate.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// Reverse walk from the waiting position back to the candidate,
    /// optionally extended to the reserved parking node.
    fn backtrack_route(
        &self,
        graph: &crate::graph::FloorGraph,
        nodes: &[NodeId],
        here: usize,
        candidate: &NodeId,
        parking: Option<&NodeId>,
    ) -> Option<VehiclePath> {
        let back_to = nodes[..=here]
            .iter()
            .position(|n| n == candidate)?;
        let mut route: Vec<NodeId> = nodes[back_to..=here].iter().rev().cloned().collect();
        if let Some(parking) = parking {
            if parking != candidate {
                let spur = astar::find_path(graph, candidate, parking)?;
                route.extend(spur.into_iter().skip(1));
            }
        }
        Some(build_path(graph, &route, StepAction::StopAtNode))
    }
}

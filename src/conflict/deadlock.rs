//! Deadlock detection
//!
//! Builds a wait-for graph from the fleet snapshot: every moving vehicle
//! with an active path waits on the owners of the nodes along that path. A
//! cycle means circular waiting; the lowest-priority member is
//! force-released (reservations and occupation cleared, path dropped,
//! yield issued) so the cycle breaks on the next dispatch round.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::concurrency::{spawn_periodic, CancelToken};
use crate::error::WcsResult;
use crate::events::{CommandAction, EgressCommand, EventBus, VehicleCommand};
use crate::priority;
use crate::state::VehicleStateCache;
use crate::store::occupancy::OccupancyStore;
use crate::store::path_cache::PathCache;
use crate::store::reservation::ReservationStore;
use crate::store::task_queue::ShuttleTaskQueue;
use crate::types::{VehicleId, VehicleStatus};

/// Find one cycle in a wait-for graph, if any. Vehicles are visited in
/// sorted order so detection is deterministic.
pub fn detect_cycle(
    waits: &HashMap<VehicleId, HashSet<VehicleId>>,
) -> Option<Vec<VehicleId>> {
    let mut done: HashSet<VehicleId> = HashSet::new();
    let mut roots: Vec<&VehicleId> = waits.keys().collect();
    roots.sort();

    for root in roots {
        if done.contains(root) {
            continue;
        }
        let mut stack: Vec<VehicleId> = Vec::new();
        let mut on_stack: HashSet<VehicleId> = HashSet::new();
        if let Some(cycle) = dfs(root, waits, &mut stack, &mut on_stack, &mut done) {
            return Some(cycle);
        }
    }
    None
}

fn dfs(
    node: &VehicleId,
    waits: &HashMap<VehicleId, HashSet<VehicleId>>,
    stack: &mut Vec<VehicleId>,
    on_stack: &mut HashSet<VehicleId>,
    done: &mut HashSet<VehicleId>,
) -> Option<Vec<VehicleId>> {
    stack.push(node.clone());
    on_stack.insert(node.clone());

    if let Some(nexts) = waits.get(node) {
        let mut ordered: Vec<&VehicleId> = nexts.iter().collect();
        ordered.sort();
        for next in ordered {
            if on_stack.contains(next) {
                let from = stack.iter().position(|v| v == next).unwrap_or(0);
                return Some(stack[from..].to_vec());
            }
            if !done.contains(next) {
                if let Some(cycle) = dfs(next, waits, stack, on_stack, done) {
                    return Some(cycle);
                }
            }
        }
    }

    stack.pop();
    on_stack.remove(node);
    done.insert(node.clone());
    None
}

/// Periodic deadlock detector
pub struct DeadlockDetector {
    state: Arc<VehicleStateCache>,
    path_cache: Arc<PathCache>,
    occupancy: Arc<OccupancyStore>,
    reservations: Arc<ReservationStore>,
    tasks: Arc<ShuttleTaskQueue>,
    bus: EventBus,
}

impl DeadlockDetector {
    /// Detector over the shared stores
    pub fn new(
        state: Arc<VehicleStateCache>,
        path_cache: Arc<PathCache>,
        occupancy: Arc<OccupancyStore>,
        reservations: Arc<ReservationStore>,
        tasks: Arc<ShuttleTaskQueue>,
        bus: EventBus,
    ) -> Self {
        Self {
            state,
            path_cache,
            occupancy,
            reservations,
            tasks,
            bus,
        }
    }

    /// Build the wait-for graph from the current snapshots
    fn wait_for_graph(&self) -> HashMap<VehicleId, HashSet<VehicleId>> {
        let owners = self.occupancy.snapshot();
        let mut waits: HashMap<VehicleId, HashSet<VehicleId>> = HashMap::new();

        for vehicle in self.state.all() {
            if vehicle.status != VehicleStatus::Moving
                && vehicle.status != VehicleStatus::Waiting
            {
                continue;
            }
            let active = match self.path_cache.get_path(&vehicle.id) {
                Some(p) => p,
                None => continue,
            };
            let edges: HashSet<VehicleId> = active
                .path
                .node_ids()
                .iter()
                .filter_map(|node| owners.get(node))
                .filter(|owner| **owner != vehicle.id)
                .cloned()
                .collect();
            if !edges.is_empty() {
                waits.insert(vehicle.id.clone(), edges);
            }
        }
        waits
    }

    /// One detection pass. Returns the force-released vehicle, if a cycle
    /// was found; an acyclic graph never triggers a yield. The victim
    /// loses its reservations and its occupation, so the other members
    /// can actually take the contested nodes, not just see an acyclic
    /// graph.
    pub async fn run_once(&self) -> WcsResult<Option<VehicleId>> {
        let waits = self.wait_for_graph();
        let cycle = match detect_cycle(&waits) {
            Some(c) => c,
            None => return Ok(None),
        };
        warn!(members = ?cycle, "circular wait detected");

        let victim = cycle
            .iter()
            .min_by_key(|vehicle| {
                let carrying = self
                    .state
                    .get(vehicle)
                    .map(|v| v.carrying)
                    .unwrap_or(false);
                let score = self
                    .tasks
                    .active_task_of(vehicle)
                    .map(|t| priority::score(carrying, &t.id))
                    .unwrap_or(i64::MIN);
                (score, (*vehicle).clone())
            })
            .cloned()
            .ok_or_else(|| crate::error::WcsError::Internal("empty cycle".into()))?;

        self.reservations.clear_vehicle(&victim);
        self.occupancy.clear_vehicle(&victim);
        self.path_cache.delete_path(&victim);
        self.bus.publish(EgressCommand::Command(VehicleCommand {
            vehicle: victim.clone(),
            action: CommandAction::Yield,
            path: None,
            reason: "circular wait broken".into(),
        }));
        info!(vehicle = %victim, "deadlock broken, reservations released");
        Ok(Some(victim))
    }

    /// Spawn the 30 s detection loop
    pub fn spawn(self: Arc<Self>, interval: Duration, token: CancelToken) -> JoinHandle<()> {
        let detector = self;
        spawn_periodic("deadlock-detector", interval, token, move || {
            let detector = Arc::clone(&detector);
            async move {
                detector.run_once().await?;
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &str)]) -> HashMap<VehicleId, HashSet<VehicleId>> {
        let mut waits: HashMap<VehicleId, HashSet<VehicleId>> = HashMap::new();
        for (from, to) in pairs {
            waits
                .entry(VehicleId::from(*from))
                .or_default()
                .insert(VehicleId::from(*to));
        }
        waits
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let waits = edges(&[("S1", "S2"), ("S2", "S3")]);
        assert!(detect_cycle(&waits).is_none());
    }

    #[test]
    fn three_cycle_is_found() {
        let waits = edges(&[("S1", "S2"), ("S2", "S3"), ("S3", "S1")]);
        let cycle = detect_cycle(&waits).unwrap();
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn self_wait_is_a_cycle() {
        let waits = edges(&[("S1", "S1")]);
        let cycle = detect_cycle(&waits).unwrap();
        assert_eq!(cycle, vec![VehicleId::from("S1")]);
    }

    #[test]
    fn branch_into_cycle_reports_only_the_cycle() {
        let waits = edges(&[("S0", "S1"), ("S1", "S2"), ("S2", "S1")]);
        let cycle = detect_cycle(&waits).unwrap();
        assert_eq!(cycle.len(), 2);
        assert!(cycle.contains(&VehicleId::from("S1")));
        assert!(cycle.contains(&VehicleId::from("S2")));
    }
}

//! Parking node search
//!
//! Finds a reservable node near a backtrack candidate where a losing
//! vehicle can stand clear of traffic: unblocked, boxless, carrying a
//! direction tag, outside every active path and the conflict node, within
//! the Manhattan radius. Candidates are tried closest-first; the first
//! successful reservation wins.

use std::time::Duration;

use crate::graph::FloorGraph;
use crate::store::path_cache::PathCache;
use crate::store::reservation::{parking_lock, ReservationStore};
use crate::types::{NodeId, VehicleId};

/// Search for a parking node and reserve it. Returns the reserved node.
#[allow(clippy::too_many_arguments)]
pub fn find_parking_node(
    graph: &FloorGraph,
    path_cache: &PathCache,
    reservations: &ReservationStore,
    near: &NodeId,
    conflict: &NodeId,
    vehicle: &VehicleId,
    max_distance: i32,
    ttl: Duration,
) -> Option<NodeId> {
    let near_node = graph.node(near)?;
    let active = path_cache.nodes_in_paths(Some(vehicle));

    let mut candidates: Vec<(i32, i32, i32, NodeId)> = graph
        .nodes()
        .filter(|n| {
            !n.blocked
                && !n.has_box
                && !n.direction_type.is_empty()
                && n.id != *conflict
                && n.manhattan(near_node) <= max_distance
                && !active.contains(&n.id)
        })
        .map(|n| (n.manhattan(near_node), n.col, n.row, n.id.clone()))
        .collect();
    candidates.sort();

    for (_, _, _, node) in candidates {
        if reservations.acquire(&parking_lock(&node), vehicle, None, ttl) {
            return Some(node);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{grid_floor, grid_id};
    use crate::types::VehiclePath;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn closest_free_node_is_reserved() {
        let graph = grid_floor("n", 5, 5, 1);
        let cache = PathCache::new(Duration::from_secs(600));
        let reservations = ReservationStore::new();
        let vehicle = VehicleId::from("S1");

        let parked = find_parking_node(
            &graph,
            &cache,
            &reservations,
            &grid_id("n", 2, 2),
            &grid_id("n", 3, 2),
            &vehicle,
            3,
            TTL,
        )
        .unwrap();
        // The near node itself is free and at distance zero.
        assert_eq!(parked, grid_id("n", 2, 2));
        assert!(reservations.owner(&parking_lock(&parked)).is_some());
    }

    #[test]
    fn conflict_node_and_active_paths_are_excluded() {
        let graph = grid_floor("n", 3, 1, 1);
        let cache = PathCache::new(Duration::from_secs(600));
        let reservations = ReservationStore::new();
        let vehicle = VehicleId::from("S1");

        // Another vehicle's path covers the near node.
        cache.save_path(
            &VehicleId::from("S2"),
            VehiclePath::new(vec![crate::types::PathStep {
                node: grid_id("n", 0, 0),
                direction: crate::types::Direction::Right,
                action: crate::types::StepAction::NoAction,
            }]),
            false,
            0,
            None,
        );

        let parked = find_parking_node(
            &graph,
            &cache,
            &reservations,
            &grid_id("n", 0, 0),
            &grid_id("n", 1, 0),
            &vehicle,
            3,
            TTL,
        )
        .unwrap();
        // Near node is in an active path, the conflict node is next; the
        // far end remains.
        assert_eq!(parked, grid_id("n", 2, 0));
    }

    #[test]
    fn contended_reservations_fall_through_to_the_next_candidate() {
        let graph = grid_floor("n", 3, 1, 1);
        let cache = PathCache::new(Duration::from_secs(600));
        let reservations = ReservationStore::new();

        // S2 already parked on the nearest spot.
        assert!(reservations.acquire(
            &parking_lock(&grid_id("n", 0, 0)),
            &VehicleId::from("S2"),
            None,
            TTL,
        ));

        let parked = find_parking_node(
            &graph,
            &cache,
            &reservations,
            &grid_id("n", 0, 0),
            &grid_id("n", 2, 0),
            &VehicleId::from("S1"),
            3,
            TTL,
        )
        .unwrap();
        assert_eq!(parked, grid_id("n", 1, 0));
    }

    #[test]
    fn boxed_and_untagged_nodes_are_skipped() {
        let mut graph = grid_floor("n", 2, 1, 1);
        let mut boxed = graph.node(&grid_id("n", 0, 0)).unwrap().clone();
        boxed.has_box = true;
        graph.add_node(boxed);
        let mut untagged = graph.node(&grid_id("n", 1, 0)).unwrap().clone();
        untagged.direction_type = String::new();
        graph.add_node(untagged);

        let cache = PathCache::new(Duration::from_secs(600));
        let reservations = ReservationStore::new();
        assert!(find_parking_node(
            &graph,
            &cache,
            &reservations,
            &grid_id("n", 0, 0),
            &grid_id("n", 9, 9),
            &VehicleId::from("S1"),
            3,
            TTL,
        )
        .is_none());
    }
}

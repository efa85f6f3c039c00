//! Cross-store invariants and round-trip laws

mod common;

use common::*;
use warefleet::store::reservation::{end_node_lock, pickup_lock};
use warefleet::testing::{grid_id, grid_map};
use warefleet::types::{Task, TaskStatus, VehicleId};

#[tokio::test]
async fn no_two_vehicles_own_one_node() {
    let h = build(grid_map("n", 2, 2, 1), default_tower(), 1);
    let node = grid_id("n", 0, 0);
    h.occupancy.block(&node, &VehicleId::from("S1")).unwrap();
    assert!(h.occupancy.block(&node, &VehicleId::from("S2")).is_err());

    let snapshot = h.occupancy.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get(&node), Some(&VehicleId::from("S1")));
}

#[tokio::test]
async fn block_unblock_round_trip_is_a_noop() {
    let h = build(grid_map("n", 2, 2, 1), default_tower(), 1);
    let before = h.occupancy.snapshot();
    let node = grid_id("n", 1, 1);
    let v = VehicleId::from("S1");
    h.occupancy.block(&node, &v).unwrap();
    assert!(h.occupancy.unblock(&node, &v));
    assert_eq!(h.occupancy.snapshot(), before);
}

#[tokio::test]
async fn clear_vehicle_leaves_no_reservation_behind() {
    let h = build(grid_map("n", 2, 2, 1), default_tower(), 1);
    let v = VehicleId::from("S1");
    let ttl = std::time::Duration::from_secs(60);
    h.reservations
        .acquire(&end_node_lock(&grid_id("n", 0, 0)), &v, None, ttl);
    h.reservations
        .acquire(&pickup_lock(&grid_id("n", 1, 0)), &v, None, ttl);

    h.reservations.clear_vehicle(&v);
    assert!(h.reservations.keys_of(&v).is_empty());
}

#[tokio::test]
async fn task_lifecycle_drains_every_set() {
    let h = build(grid_map("n", 2, 2, 1), default_tower(), 1);
    let v = VehicleId::from("S1");

    let mut task = Task::staged(grid_id("n", 0, 0), 1, "EU", None, serde_json::Value::Null);
    task.end_node = Some(grid_id("n", 1, 1));
    task.end_floor = Some(1);
    let id = task.id;

    h.tasks.register(task).await.unwrap();
    let pending = h.tasks.next_pending().await.unwrap();
    assert_eq!(pending.id, id);

    h.tasks
        .update_status(id, TaskStatus::Assigned, Some(v.clone()))
        .await
        .unwrap();
    h.tasks
        .update_status(id, TaskStatus::Completed, None)
        .await
        .unwrap();

    assert!(h.tasks.next_pending().await.is_none());
    assert!(h.tasks.processing_ids().is_empty());
    assert!(h.tasks.active_task_of(&v).is_none());
}

#[tokio::test]
async fn at_most_one_vehicle_holds_a_committed_task() {
    let h = build(grid_map("n", 2, 2, 1), default_tower(), 1);
    let mut task = Task::staged(grid_id("n", 0, 0), 1, "EU", None, serde_json::Value::Null);
    task.end_node = Some(grid_id("n", 1, 1));
    task.end_floor = Some(1);
    let id = task.id;
    h.tasks.register(task).await.unwrap();

    h.tasks
        .update_status(id, TaskStatus::Assigned, Some(VehicleId::from("S1")))
        .await
        .unwrap();
    // A second assignment reparents the task rather than duplicating it.
    h.tasks
        .update_status(id, TaskStatus::Assigned, Some(VehicleId::from("S2")))
        .await
        .unwrap();

    let holders: Vec<VehicleId> = ["S1", "S2"]
        .iter()
        .map(|s| VehicleId::from(*s))
        .filter(|v| h.tasks.active_task_of(v).map(|t| t.id) == Some(id))
        .collect();
    assert_eq!(holders.len(), 1);
}

#[tokio::test]
async fn row_lock_members_empty_means_absent() {
    let h = build(grid_map("n", 2, 2, 1), default_tower(), 1);
    let v = VehicleId::from("S1");
    h.rows
        .request(1, 0, warefleet::types::RowDirection::LeftToRight, &v);
    assert!(h.rows.lock(1, 0).is_some());
    h.rows.release(1, 0, &v);
    // Emptied lock disappears with its last member.
    assert!(h.rows.lock(1, 0).is_none());
}

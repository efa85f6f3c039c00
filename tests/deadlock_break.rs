//! Deadlock detection: a three-cycle of reserved paths breaks on the
//! lowest-priority member; acyclic snapshots never trigger a yield.

mod common;

use common::*;
use warefleet::events::CommandAction;
use warefleet::store::reservation::parking_lock;
use warefleet::testing::{grid_id, grid_map};
use warefleet::types::{
    Direction, NodeId, PathStep, StepAction, Task, TaskStatus, VehicleId, VehicleKind,
    VehiclePath, VehicleStatus,
};

fn one_step(node: NodeId, direction: Direction) -> VehiclePath {
    VehiclePath::new(vec![PathStep {
        node,
        direction,
        action: StepAction::NoAction,
    }])
}

async fn moving_shuttle(h: &Harness, id: &str, at: NodeId) -> VehicleId {
    let vehicle = VehicleId::from(id);
    h.state.ensure(&vehicle, VehicleKind::Shuttle, 1);
    h.state.set_location(&vehicle, at.clone(), 1);
    h.state.set_status(&vehicle, VehicleStatus::Moving);
    h.occupancy.block(&at, &vehicle).unwrap();

    let mut task = Task::staged(at, 1, "EU", None, serde_json::Value::Null);
    task.end_node = Some(NodeId::from("end"));
    task.end_floor = Some(1);
    let task_id = task.id;
    h.tasks.register(task).await.unwrap();
    h.tasks
        .update_status(task_id, TaskStatus::Assigned, Some(vehicle.clone()))
        .await
        .unwrap();
    vehicle
}

#[tokio::test]
async fn three_cycle_breaks_on_the_lowest_priority_vehicle() {
    let h = build(grid_map("n", 3, 1, 1), default_tower(), 1);
    let mut egress = h.bus.subscribe_egress();

    // S1, S2, S3 registered in that order: S3 holds the newest task and
    // therefore the lowest FIFO priority.
    let s1 = moving_shuttle(&h, "S1", grid_id("n", 0, 0)).await;
    let s2 = moving_shuttle(&h, "S2", grid_id("n", 1, 0)).await;
    let s3 = moving_shuttle(&h, "S3", grid_id("n", 2, 0)).await;

    // Reserved paths form a cycle: S1 -> S2's node -> S3's node -> S1's.
    h.path_cache
        .save_path(&s1, one_step(grid_id("n", 1, 0), Direction::Right), false, 0, None);
    h.path_cache
        .save_path(&s2, one_step(grid_id("n", 2, 0), Direction::Right), false, 0, None);
    h.path_cache
        .save_path(&s3, one_step(grid_id("n", 0, 0), Direction::Left), false, 0, None);
    // S3 also holds a parking reservation that must be force-released.
    assert!(h
        .reservations
        .acquire(&parking_lock(&grid_id("n", 2, 0)), &s3, None, std::time::Duration::from_secs(60)));

    // Act: one detector pass.
    let victim = h.detector.run_once().await.unwrap();

    // Assert: the newest task loses; its reservations, occupation and
    // path all go away so the contested node is actually free.
    assert_eq!(victim, Some(s3.clone()));
    assert!(h.reservations.keys_of(&s3).is_empty());
    assert!(h.occupancy.nodes_of(&s3).is_empty());
    assert_eq!(h.occupancy.owner(&grid_id("n", 2, 0)), None);
    assert!(h.path_cache.get_path(&s3).is_none());
    let command = recv_command(&mut egress).await;
    assert_eq!(command.vehicle, s3);
    assert_eq!(command.action, CommandAction::Yield);

    // The next pass sees no cycle.
    assert_eq!(h.detector.run_once().await.unwrap(), None);
}

#[tokio::test]
async fn acyclic_wait_graph_never_triggers_a_yield() {
    let h = build(grid_map("n", 3, 1, 1), default_tower(), 1);

    let s1 = moving_shuttle(&h, "S1", grid_id("n", 0, 0)).await;
    let _s2 = moving_shuttle(&h, "S2", grid_id("n", 1, 0)).await;

    // S1 waits on S2; S2 waits on nobody.
    h.path_cache
        .save_path(&s1, one_step(grid_id("n", 1, 0), Direction::Right), false, 0, None);

    assert_eq!(h.detector.run_once().await.unwrap(), None);
}

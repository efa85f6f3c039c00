//! Conflict resolution: priority yield, tier-validated reroute, and the
//! 45-second emergency escalation.

mod common;

use std::time::{Duration, Instant};

use common::*;
use warefleet::conflict::Resolution;
use warefleet::events::CommandAction;
use warefleet::testing::{grid_id, grid_map};
use warefleet::types::{
    Direction, NodeId, PathStep, StepAction, Task, TaskStatus, VehicleId, VehicleKind,
    VehiclePath,
};

fn step(node: NodeId, direction: Direction) -> PathStep {
    PathStep {
        node,
        direction,
        action: StepAction::NoAction,
    }
}

async fn bind_task(h: &Harness, vehicle: &VehicleId, pickup: NodeId) -> warefleet::types::TaskId {
    let mut task = Task::staged(pickup, 1, "EU", None, serde_json::Value::Null);
    task.end_node = Some(NodeId::from("end"));
    task.end_floor = Some(1);
    let id = task.id;
    h.tasks.register(task).await.unwrap();
    h.tasks
        .update_status(id, TaskStatus::Assigned, Some(vehicle.clone()))
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn carrying_vehicle_outranks_and_the_blocker_yields() {
    // Arrange: S1 carries toward the middle node; S2 sits empty across it.
    let h = build(grid_map("n", 3, 3, 1), default_tower(), 1);
    let mut egress = h.bus.subscribe_egress();

    let s1 = VehicleId::from("S1");
    let s2 = VehicleId::from("S2");
    h.state.ensure(&s1, VehicleKind::Shuttle, 1);
    h.state.ensure(&s2, VehicleKind::Shuttle, 1);
    h.state.set_location(&s1, grid_id("n", 2, 1), 1);
    h.state.set_location(&s2, grid_id("n", 0, 1), 1);
    h.state.set_carrying(&s1, true);
    bind_task(&h, &s1, grid_id("n", 2, 1)).await;
    bind_task(&h, &s2, grid_id("n", 0, 1)).await;

    h.occupancy.block(&grid_id("n", 2, 1), &s1).unwrap();
    h.occupancy.block(&grid_id("n", 0, 1), &s2).unwrap();
    h.path_cache.save_path(
        &s1,
        VehiclePath::new(vec![
            step(grid_id("n", 1, 1), Direction::Left),
            step(grid_id("n", 0, 1), Direction::Left),
        ]),
        true,
        0,
        None,
    );
    h.path_cache.save_path(
        &s2,
        VehiclePath::new(vec![
            step(grid_id("n", 1, 1), Direction::Right),
            step(grid_id("n", 2, 1), Direction::Right),
        ]),
        false,
        0,
        None,
    );

    // Act: the carrier reports waiting.
    let resolution = h
        .conflict
        .handle_waiting(&s1, &grid_id("n", 2, 1), &grid_id("n", 1, 1), &s2)
        .await
        .unwrap();

    // Assert: the empty blocker is told to yield.
    assert_eq!(
        resolution,
        Resolution::YieldRequested { blocker: s2.clone() }
    );
    let command = recv_command(&mut egress).await;
    assert_eq!(command.vehicle, s2);
    assert_eq!(command.action, CommandAction::Yield);
}

#[tokio::test]
async fn outranked_vehicle_reroutes_within_the_empty_tier() {
    let h = build(grid_map("n", 3, 3, 1), default_tower(), 1);
    let mut egress = h.bus.subscribe_egress();

    let s1 = VehicleId::from("S1");
    let s2 = VehicleId::from("S2");
    h.state.ensure(&s1, VehicleKind::Shuttle, 1);
    h.state.ensure(&s2, VehicleKind::Shuttle, 1);
    h.state.set_location(&s1, grid_id("n", 2, 1), 1);
    h.state.set_location(&s2, grid_id("n", 0, 1), 1);
    h.state.set_carrying(&s1, true);
    bind_task(&h, &s1, grid_id("n", 2, 1)).await;
    bind_task(&h, &s2, grid_id("n", 0, 1)).await;

    h.occupancy.block(&grid_id("n", 2, 1), &s1).unwrap();
    h.occupancy.block(&grid_id("n", 0, 1), &s2).unwrap();
    h.path_cache.save_path(
        &s1,
        VehiclePath::new(vec![
            step(grid_id("n", 1, 1), Direction::Left),
            step(grid_id("n", 0, 1), Direction::Left),
        ]),
        true,
        0,
        None,
    );
    h.path_cache.save_path(
        &s2,
        VehiclePath::new(vec![
            step(grid_id("n", 1, 1), Direction::Right),
            step(grid_id("n", 2, 1), Direction::Right),
        ]),
        false,
        0,
        None,
    );

    // Act: the empty vehicle reports waiting on the carrier.
    let resolution = h
        .conflict
        .handle_waiting(&s2, &grid_id("n", 0, 1), &grid_id("n", 1, 1), &s1)
        .await
        .unwrap();

    // Assert: rerouted around the middle, within 200 % of the original
    // two-step path.
    match resolution {
        Resolution::Rerouted {
            path_len,
            emergency,
        } => {
            assert!(path_len <= 4, "reroute blew the empty tier: {}", path_len);
            assert!(!emergency);
        }
        other => panic!("expected reroute, got {:?}", other),
    }
    let command = recv_command(&mut egress).await;
    assert_eq!(command.vehicle, s2);
    assert_eq!(command.action, CommandAction::Reroute);
    let new_path = command.path.unwrap();
    assert!(!new_path.node_ids().contains(&grid_id("n", 1, 1)));
}

#[tokio::test]
async fn wait_escalates_to_an_any_cost_reroute_at_the_cap() {
    // Arrange: a single corridor; the only route runs through the blocker.
    let h = build(grid_map("n", 3, 1, 1), default_tower(), 1);
    let mut egress = h.bus.subscribe_egress();

    let s1 = VehicleId::from("S1");
    let s2 = VehicleId::from("S2");
    h.state.ensure(&s1, VehicleKind::Shuttle, 1);
    h.state.ensure(&s2, VehicleKind::Shuttle, 1);
    h.state.set_location(&s1, grid_id("n", 1, 0), 1);
    h.state.set_location(&s2, grid_id("n", 0, 0), 1);
    h.state.set_carrying(&s1, true);
    bind_task(&h, &s1, grid_id("n", 1, 0)).await;
    bind_task(&h, &s2, grid_id("n", 0, 0)).await;

    h.occupancy.block(&grid_id("n", 1, 0), &s1).unwrap();
    h.path_cache.save_path(
        &s1,
        VehiclePath::new(vec![step(grid_id("n", 1, 0), Direction::Right)]),
        true,
        0,
        None,
    );
    h.path_cache.save_path(
        &s2,
        VehiclePath::new(vec![
            step(grid_id("n", 1, 0), Direction::Right),
            step(grid_id("n", 2, 0), Direction::Right),
        ]),
        false,
        0,
        None,
    );

    // Act 1: fresh conflict; nothing works, the vehicle waits in place.
    let first = h
        .conflict
        .handle_waiting(&s2, &grid_id("n", 0, 0), &grid_id("n", 1, 0), &s1)
        .await
        .unwrap();
    match first {
        Resolution::Waiting { next_check, .. } => {
            assert_eq!(next_check, Duration::from_secs(5));
        }
        other => panic!("expected waiting, got {:?}", other),
    }

    // Act 2: past the 45 s cap the same report forces an emergency
    // reroute that accepts any path.
    h.conflict.clear_waiting(&s2);
    h.conflict.mark_waiting(
        &s2,
        Instant::now()
            .checked_sub(Duration::from_secs(46))
            .unwrap(),
    );
    let second = h
        .conflict
        .handle_waiting(&s2, &grid_id("n", 0, 0), &grid_id("n", 1, 0), &s1)
        .await
        .unwrap();

    match second {
        Resolution::Rerouted { emergency, .. } => assert!(emergency),
        other => panic!("expected emergency reroute, got {:?}", other),
    }
    let command = recv_command(&mut egress).await;
    assert_eq!(command.action, CommandAction::Reroute);
    assert_eq!(command.vehicle, s2);
}

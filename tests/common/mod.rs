//! Shared harness for the integration suites
//!
//! Builds the full engine over an in-memory PLC and a caller-supplied map,
//! with fast publish-retry timings so suites stay quick. Loops are not
//! spawned; suites drive ticks and events explicitly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use warefleet::concurrency::CancelToken;
use warefleet::config::{ConflictConfig, LifterConfig, LifterTowerConfig, TimingConfig, TrafficConfig};
use warefleet::conflict::deadlock::DeadlockDetector;
use warefleet::conflict::ConflictResolver;
use warefleet::dispatch::publisher::MissionPublisher;
use warefleet::dispatch::ShuttleDispatcher;
use warefleet::events::{
    EgressCommand, EventBus, IngressEvent, MissionEnvelope, VehicleCommand,
};
use warefleet::graph::WarehouseMap;
use warefleet::lifter::plc::{InMemoryPlc, PlcClient};
use warefleet::lifter::LifterCoordinator;
use warefleet::mission::MissionCoordinator;
use warefleet::row::RowCoordinator;
use warefleet::scheduler::StagingScheduler;
use warefleet::state::VehicleStateCache;
use warefleet::store::occupancy::OccupancyStore;
use warefleet::store::path_cache::PathCache;
use warefleet::store::reservation::ReservationStore;
use warefleet::store::task_queue::{ShuttleTaskQueue, StagingQueue};
use warefleet::types::{FloorId, NodeId, VehicleId};

pub struct Harness {
    pub bus: EventBus,
    /// Kept alive so `EventBus::ingest` has a consumer end
    pub ingress_rx: tokio::sync::mpsc::Receiver<IngressEvent>,
    pub map: Arc<WarehouseMap>,
    pub occupancy: Arc<OccupancyStore>,
    pub reservations: Arc<ReservationStore>,
    pub path_cache: Arc<PathCache>,
    pub staging: Arc<StagingQueue>,
    pub tasks: Arc<ShuttleTaskQueue>,
    pub rows: Arc<RowCoordinator>,
    pub state: Arc<VehicleStateCache>,
    pub plc: Arc<InMemoryPlc>,
    pub lifter: Arc<LifterCoordinator>,
    pub mission: Arc<MissionCoordinator>,
    pub conflict: Arc<ConflictResolver>,
    pub publisher: Arc<MissionPublisher>,
    pub dispatcher: Arc<ShuttleDispatcher>,
    pub scheduler: Arc<StagingScheduler>,
    pub detector: Arc<DeadlockDetector>,
    pub token: CancelToken,
}

pub fn default_tower() -> LifterTowerConfig {
    LifterConfig::default().primary().cloned().unwrap()
}

/// Build the engine around a map. The lifter cabin starts at `lifter_at`.
pub fn build(map: WarehouseMap, tower: LifterTowerConfig, lifter_at: FloorId) -> Harness {
    let timing = TimingConfig::default();
    let (bus, ingress_rx) = EventBus::new(256);
    let map = Arc::new(map);

    let occupancy = Arc::new(OccupancyStore::new(Duration::from_secs(
        timing.occupation_lease_secs,
    )));
    let reservations = Arc::new(ReservationStore::new());
    let path_cache = Arc::new(PathCache::new(Duration::from_secs(timing.path_ttl_secs)));
    let staging = Arc::new(StagingQueue::new());
    let tasks = Arc::new(ShuttleTaskQueue::new());
    let rows = Arc::new(RowCoordinator::new(
        Duration::from_secs(timing.row_lock_idle_secs),
        Duration::from_secs(timing.row_lock_stale_secs),
        Duration::from_secs(timing.batch_row_ttl_secs),
    ));
    let state = Arc::new(VehicleStateCache::new());

    let floors: Vec<FloorId> = tower.floors.iter().map(|f| f.floor).collect();
    let plc = Arc::new(InMemoryPlc::new(&tower.id, floors, lifter_at));
    let lifter = Arc::new(LifterCoordinator::new(
        tower,
        Arc::clone(&plc) as Arc<dyn PlcClient>,
        bus.clone(),
        Duration::from_secs(60),
        Duration::from_secs(5),
    ));

    let mission = Arc::new(MissionCoordinator::new(
        Arc::clone(&map),
        Arc::clone(&occupancy),
        Arc::clone(&path_cache),
        Arc::clone(&rows),
        Arc::clone(&lifter),
        Arc::clone(&state),
        TrafficConfig::default(),
    ));
    let conflict = Arc::new(ConflictResolver::new(
        Arc::clone(&map),
        Arc::clone(&occupancy),
        Arc::clone(&reservations),
        Arc::clone(&path_cache),
        Arc::clone(&rows),
        Arc::clone(&state),
        Arc::clone(&tasks),
        bus.clone(),
        ConflictConfig::default(),
        TrafficConfig::default(),
    ));
    let publisher = Arc::new(MissionPublisher::new(
        bus.clone(),
        Duration::from_millis(25),
        Duration::from_secs(2),
    ));
    let dispatcher = ShuttleDispatcher::new(
        Arc::clone(&map),
        Arc::clone(&state),
        Arc::clone(&tasks),
        Arc::clone(&mission),
        Arc::clone(&publisher),
        Arc::clone(&occupancy),
        Arc::clone(&reservations),
        Arc::clone(&path_cache),
        Arc::clone(&conflict),
        Arc::clone(&lifter),
        bus.clone(),
        &timing,
    );
    let scheduler = Arc::new(StagingScheduler::new(
        Arc::clone(&map),
        Arc::clone(&staging),
        Arc::clone(&tasks),
        Arc::clone(&reservations),
        Arc::clone(&rows),
        Arc::clone(&state),
        &timing,
    ));
    let detector = Arc::new(DeadlockDetector::new(
        Arc::clone(&state),
        Arc::clone(&path_cache),
        Arc::clone(&occupancy),
        Arc::clone(&reservations),
        Arc::clone(&tasks),
        bus.clone(),
    ));

    Harness {
        bus,
        ingress_rx,
        map,
        occupancy,
        reservations,
        path_cache,
        staging,
        tasks,
        rows,
        state,
        plc,
        lifter,
        mission,
        conflict,
        publisher,
        dispatcher,
        scheduler,
        detector,
        token: CancelToken::new(),
    }
}

/// Bring a shuttle online at a node
pub async fn add_shuttle(h: &Harness, id: &str, node: NodeId, floor: FloorId) {
    h.dispatcher
        .handle_event(IngressEvent::ShuttleInitialized {
            vehicle: VehicleId::from(id),
            node,
            floor,
        })
        .await
        .unwrap();
}

/// Next mission envelope on the egress stream, skipping other commands
pub async fn recv_mission(rx: &mut broadcast::Receiver<EgressCommand>) -> MissionEnvelope {
    loop {
        let command = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("egress timed out")
            .expect("egress closed");
        if let EgressCommand::Mission(envelope) = command {
            return envelope;
        }
    }
}

/// Next mission with the given arrival tag; retries of earlier envelopes
/// are skipped.
pub async fn recv_mission_with(
    rx: &mut broadcast::Receiver<EgressCommand>,
    on_arrival: warefleet::events::OnArrival,
) -> MissionEnvelope {
    loop {
        let envelope = recv_mission(rx).await;
        if envelope.on_arrival == on_arrival {
            return envelope;
        }
    }
}

/// Next conflict command on the egress stream, skipping missions
pub async fn recv_command(rx: &mut broadcast::Receiver<EgressCommand>) -> VehicleCommand {
    loop {
        let command = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("egress timed out")
            .expect("egress closed");
        if let EgressCommand::Command(command) = command {
            return command;
        }
    }
}

/// Acknowledge a mission so the publisher stops retrying
pub async fn ack(h: &Harness, envelope: &MissionEnvelope) {
    h.dispatcher
        .handle_event(IngressEvent::MissionAck {
            vehicle: envelope.vehicle.clone(),
            task: envelope.task_id,
        })
        .await
        .unwrap();
}

//! Shuttle dispatcher and event router
//!
//! The dispatcher is the single writer of vehicle/task bindings: it pulls
//! the oldest committed task, picks an idle shuttle (same floor first, then
//! closest, ties by id), builds the pickup segment and publishes it with
//! acknowledgement retry. The router is the single consumer of the ingress
//! queue, so events for one vehicle are processed strictly in arrival
//! order; it advances missions and delegates blocking reports to the
//! conflict resolver.

pub mod publisher;

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::concurrency::{spawn_periodic, CancelToken};
use crate::config::TimingConfig;
use crate::conflict::{ConflictResolver, Resolution};
use crate::error::{WcsError, WcsResult};
use crate::events::{EgressCommand, EventBus, IngressEvent, LifterEvent, MissionEnvelope};
use crate::graph::{astar, WarehouseMap};
use crate::lifter::LifterCoordinator;
use crate::mission::{MissionCoordinator, SegmentPurpose};
use crate::state::VehicleStateCache;
use crate::store::occupancy::OccupancyStore;
use crate::store::path_cache::PathCache;
use crate::store::reservation::{end_node_lock, pickup_lock, ReservationStore};
use crate::store::task_queue::ShuttleTaskQueue;
use crate::types::{
    FloorId, LifterStatus, NodeId, Task, TaskId, TaskStatus, Vehicle, VehicleId, VehicleKind,
    VehicleStatus,
};

use self::publisher::MissionPublisher;

/// Steps a carrying shuttle must put between itself and the pickup node
/// before the pickup lock is released
const SAFETY_EXIT_DISTANCE: i32 = 2;

/// Dispatcher and event router for the shuttle fleet
pub struct ShuttleDispatcher {
    me: Weak<ShuttleDispatcher>,
    map: Arc<WarehouseMap>,
    state: Arc<VehicleStateCache>,
    tasks: Arc<ShuttleTaskQueue>,
    mission: Arc<MissionCoordinator>,
    publisher: Arc<MissionPublisher>,
    occupancy: Arc<OccupancyStore>,
    reservations: Arc<ReservationStore>,
    path_cache: Arc<PathCache>,
    conflict: Arc<ConflictResolver>,
    lifter: Arc<LifterCoordinator>,
    bus: EventBus,
    /// Shuttles that auto-pull the next task after completing one
    executing_mode: DashMap<VehicleId, ()>,
    /// Segment ordinal per task
    segments: DashMap<TaskId, u32>,
    pickup_ttl: Duration,
}

impl ShuttleDispatcher {
    /// Dispatcher over the shared stores
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        map: Arc<WarehouseMap>,
        state: Arc<VehicleStateCache>,
        tasks: Arc<ShuttleTaskQueue>,
        mission: Arc<MissionCoordinator>,
        publisher: Arc<MissionPublisher>,
        occupancy: Arc<OccupancyStore>,
        reservations: Arc<ReservationStore>,
        path_cache: Arc<PathCache>,
        conflict: Arc<ConflictResolver>,
        lifter: Arc<LifterCoordinator>,
        bus: EventBus,
        timing: &TimingConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            map,
            state,
            tasks,
            mission,
            publisher,
            occupancy,
            reservations,
            path_cache,
            conflict,
            lifter,
            bus,
            executing_mode: DashMap::new(),
            segments: DashMap::new(),
            pickup_ttl: Duration::from_secs(timing.pickup_lock_ttl_secs),
        })
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    fn next_segment_ordinal(&self, task: TaskId) -> u32 {
        let mut entry = self.segments.entry(task).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Pull the oldest pending task and hand it to the best idle shuttle.
    /// Returns whether a task went out.
    pub async fn dispatch_next_task(&self) -> WcsResult<bool> {
        let task = match self.tasks.next_pending().await {
            Some(t) => t,
            None => return Ok(false),
        };
        let shuttle = match self.choose_shuttle(&task) {
            Some(s) => s,
            None => {
                debug!(task = %task.id, "no idle shuttle");
                return Ok(false);
            }
        };

        // The pickup lock guards the cell until the shuttle has safely
        // left with the pallet.
        let lock = pickup_lock(&task.pickup_node);
        if !self
            .reservations
            .acquire(&lock, &shuttle.id, Some(task.id), self.pickup_ttl)
        {
            debug!(task = %task.id, "pickup locked elsewhere, holding task");
            return Ok(false);
        }

        let segment = self.next_segment_ordinal(task.id);
        let envelope = match self
            .mission
            .next_segment(&shuttle.id, &task, SegmentPurpose::Pickup, segment)
            .await
        {
            Ok(envelope) => envelope,
            Err(WcsError::NoPath { .. }) => {
                warn!(task = %task.id, vehicle = %shuttle.id, "pickup unreachable");
                self.reservations.release(&lock);
                self.fail_task(&task, Some(&shuttle.id)).await;
                return Ok(false);
            }
            Err(err) => {
                self.reservations.release(&lock);
                return Err(err);
            }
        };

        self.tasks
            .update_status(task.id, TaskStatus::Assigned, Some(shuttle.id.clone()))
            .await?;
        self.state.set_active_task(&shuttle.id, Some(task.id));
        self.state.set_status(&shuttle.id, VehicleStatus::Moving);
        info!(task = %task.id, vehicle = %shuttle.id, "task dispatched");
        self.spawn_publish(envelope);
        Ok(true)
    }

    /// Same-floor shuttles first, then closest by pathfinder, ties by id
    fn choose_shuttle(&self, task: &Task) -> Option<Vehicle> {
        let mut best: Option<(u8, usize, VehicleId, Vehicle)> = None;
        for shuttle in self.state.idle_shuttles() {
            let node = match &shuttle.node {
                Some(n) => n.clone(),
                None => continue,
            };
            let (off_floor, distance) = if shuttle.floor == task.pickup_floor {
                let graph = match self.map.floor(shuttle.floor) {
                    Ok(g) => g,
                    Err(_) => continue,
                };
                match astar::find_path(graph, &node, &task.pickup_node) {
                    Some(path) => (0u8, path.len()),
                    None => continue,
                }
            } else {
                (1u8, usize::MAX)
            };
            let better = best.as_ref().map_or(true, |(f, d, id, _)| {
                (off_floor, distance, &shuttle.id) < (*f, *d, id)
            });
            if better {
                best = Some((off_floor, distance, shuttle.id.clone(), shuttle));
            }
        }
        best.map(|(_, _, _, shuttle)| shuttle)
    }

    /// Publish in the background; an unacknowledged mission fails the task.
    fn spawn_publish(&self, envelope: MissionEnvelope) {
        let dispatcher = match self.strong() {
            Some(d) => d,
            None => return,
        };
        tokio::spawn(async move {
            let task_id = envelope.task_id;
            let vehicle = envelope.vehicle.clone();
            if let Err(err) = dispatcher.publisher.publish_with_retry(envelope).await {
                warn!(task = %task_id, vehicle = %vehicle, error = %err, "publish failed");
                if let Some(task) = dispatcher.tasks.task(&task_id) {
                    dispatcher.fail_task(&task, Some(&vehicle)).await;
                }
            }
        });
    }

    fn spawn_dispatch_once(&self) {
        if let Some(dispatcher) = self.strong() {
            tokio::spawn(async move {
                if let Err(err) = dispatcher.dispatch_next_task().await {
                    warn!(error = %err, "dispatch failed");
                }
            });
        }
    }

    /// Terminal failure: release locks, drop the path, free the vehicle
    async fn fail_task(&self, task: &Task, vehicle: Option<&VehicleId>) {
        let _ = self
            .tasks
            .update_status(task.id, TaskStatus::Failed, None)
            .await;
        self.release_task_locks(task);
        if let Some(vehicle) = vehicle {
            self.path_cache.delete_path(vehicle);
            self.state.set_active_task(vehicle, None);
            self.state.set_status(vehicle, VehicleStatus::Idle);
            self.conflict.clear_waiting(vehicle);
        }
        self.segments.remove(&task.id);
    }

    fn release_task_locks(&self, task: &Task) {
        self.reservations.release(&pickup_lock(&task.pickup_node));
        if let Some(end) = &task.end_node {
            self.reservations.release(&end_node_lock(end));
        }
    }

    /// Spawn the periodic dispatch loop
    pub fn spawn_dispatch_loop(
        self: Arc<Self>,
        interval: Duration,
        token: CancelToken,
    ) -> JoinHandle<()> {
        let dispatcher = self;
        spawn_periodic("shuttle-dispatcher", interval, token, move || {
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                dispatcher.dispatch_next_task().await?;
                Ok(())
            }
        })
    }

    /// Spawn the event router: single consumer of the ingress queue plus
    /// the lifter fan-out.
    pub fn spawn_router(
        self: Arc<Self>,
        mut ingress: mpsc::Receiver<IngressEvent>,
        token: CancelToken,
    ) -> JoinHandle<()> {
        let dispatcher = self;
        let mut lifter_rx = dispatcher.bus.subscribe_lifter();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    maybe = ingress.recv() => {
                        match maybe {
                            Some(event) => {
                                if let Err(err) = dispatcher.handle_event(event).await {
                                    warn!(error = %err, "event handler failed");
                                }
                            }
                            None => break,
                        }
                    }
                    arrived = lifter_rx.recv() => {
                        if let Ok(event) = arrived {
                            if let Err(err) = dispatcher.handle_lifter_event(event).await {
                                warn!(error = %err, "lifter handler failed");
                            }
                        }
                    }
                }
            }
            debug!("event router stopped");
        })
    }

    /// Route one ingress event
    pub async fn handle_event(&self, event: IngressEvent) -> WcsResult<()> {
        match event {
            IngressEvent::VehicleInfo(info) => {
                self.state.apply_info(VehicleKind::Shuttle, &info);
                Ok(())
            }
            IngressEvent::ShuttleInitialized {
                vehicle,
                node,
                floor,
            } => self.on_initialized(vehicle, node, floor).await,
            IngressEvent::ShuttleMoved {
                vehicle,
                previous_node,
                current_node,
            } => self.on_moved(vehicle, previous_node, current_node).await,
            IngressEvent::ShuttleWaiting {
                vehicle,
                waiting_at,
                target_node,
                blocked_by,
            } => {
                self.on_waiting(vehicle, waiting_at, target_node, blocked_by)
                    .await
            }
            IngressEvent::ShuttleResumed { vehicle } => {
                self.state.set_status(&vehicle, VehicleStatus::Moving);
                self.conflict.clear_waiting(&vehicle);
                Ok(())
            }
            IngressEvent::ShuttleTaskStarted { vehicle, .. } => {
                self.state.set_status(&vehicle, VehicleStatus::Moving);
                Ok(())
            }
            IngressEvent::PickupComplete { vehicle } => self.on_pickup_complete(vehicle).await,
            IngressEvent::TaskComplete { vehicle } => self.on_task_complete(vehicle).await,
            IngressEvent::ArrivedAtLifter { vehicle, floor } => {
                self.on_arrived_at_lifter(vehicle, floor).await
            }
            IngressEvent::WaitingForLifter { vehicle } => {
                self.on_waiting_for_lifter(vehicle).await
            }
            IngressEvent::MissionAck { vehicle, task } => {
                self.publisher.ack(&vehicle, task);
                Ok(())
            }
        }
    }

    async fn on_initialized(
        &self,
        vehicle: VehicleId,
        node: NodeId,
        floor: FloorId,
    ) -> WcsResult<()> {
        self.state.ensure(&vehicle, VehicleKind::Shuttle, floor);
        self.state.set_location(&vehicle, node.clone(), floor);
        self.occupancy.block(&node, &vehicle)?;
        self.executing_mode.insert(vehicle.clone(), ());
        self.bus.publish(EgressCommand::RunPermission {
            vehicle: vehicle.clone(),
            allowed: true,
        });
        info!(vehicle = %vehicle, node = %node, floor, "shuttle initialized");
        self.spawn_dispatch_once();
        Ok(())
    }

    async fn on_moved(
        &self,
        vehicle: VehicleId,
        previous_node: Option<NodeId>,
        current_node: NodeId,
    ) -> WcsResult<()> {
        self.occupancy
            .handle_move(&vehicle, previous_node.as_ref(), &current_node)?;
        self.state.set_node(&vehicle, current_node.clone());
        self.state.set_status(&vehicle, VehicleStatus::Moving);
        self.conflict.clear_waiting(&vehicle);

        // Past the safety exit with the pallet on board, the pickup cell
        // can serve the next shuttle.
        if let Some(task) = self.tasks.active_task_of(&vehicle) {
            if task.status == TaskStatus::InProgress {
                if let Some(v) = self.state.get(&vehicle) {
                    if v.carrying {
                        let graph = self.map.floor(v.floor)?;
                        if let (Some(here), Some(pickup)) =
                            (graph.node(&current_node), graph.node(&task.pickup_node))
                        {
                            if here.manhattan(pickup) >= SAFETY_EXIT_DISTANCE {
                                self.reservations
                                    .release(&pickup_lock(&task.pickup_node));
                            }
                        }
                    }
                }
            }
        }

        self.spawn_dispatch_once();
        Ok(())
    }

    async fn on_waiting(
        &self,
        vehicle: VehicleId,
        waiting_at: NodeId,
        target_node: NodeId,
        blocked_by: VehicleId,
    ) -> WcsResult<()> {
        self.state.set_status(&vehicle, VehicleStatus::Waiting);
        let resolution = self
            .conflict
            .handle_waiting(&vehicle, &waiting_at, &target_node, &blocked_by)
            .await?;
        match resolution {
            Resolution::Waiting { next_check, .. } => {
                // Re-enter the resolver after the escalation delay unless
                // the shuttle moved on by itself.
                if let Some(dispatcher) = self.strong() {
                    tokio::spawn(async move {
                        tokio::time::sleep(next_check).await;
                        let still_waiting = dispatcher
                            .state
                            .get(&vehicle)
                            .map_or(false, |v| v.status == VehicleStatus::Waiting);
                        if still_waiting {
                            let _ = dispatcher
                                .bus
                                .ingest(IngressEvent::ShuttleWaiting {
                                    vehicle,
                                    waiting_at,
                                    target_node,
                                    blocked_by,
                                })
                                .await;
                        }
                    });
                }
            }
            Resolution::Failed => {
                if let Some(task) = self.tasks.active_task_of(&vehicle) {
                    self.fail_task(&task, Some(&vehicle)).await;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_pickup_complete(&self, vehicle: VehicleId) -> WcsResult<()> {
        let task = self
            .tasks
            .active_task_of(&vehicle)
            .ok_or_else(|| WcsError::VehicleNotFound(format!("{} has no task", vehicle)))?;
        self.tasks
            .update_status(task.id, TaskStatus::InProgress, Some(vehicle.clone()))
            .await?;
        self.state.set_carrying(&vehicle, true);
        self.state.set_node_has_box(&task.pickup_node, false);
        info!(task = %task.id, vehicle = %vehicle, "pickup complete");

        let task = self
            .tasks
            .task(&task.id)
            .ok_or_else(|| WcsError::TaskNotFound(task.id.to_string()))?;
        let segment = self.next_segment_ordinal(task.id);
        match self
            .mission
            .next_segment(&vehicle, &task, SegmentPurpose::Delivery, segment)
            .await
        {
            Ok(envelope) => {
                self.spawn_publish(envelope);
                Ok(())
            }
            Err(WcsError::NoPath { .. }) => {
                self.fail_task(&task, Some(&vehicle)).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn on_task_complete(&self, vehicle: VehicleId) -> WcsResult<()> {
        let task = self
            .tasks
            .active_task_of(&vehicle)
            .ok_or_else(|| WcsError::VehicleNotFound(format!("{} has no task", vehicle)))?;
        self.tasks
            .update_status(task.id, TaskStatus::Completed, None)
            .await?;
        self.release_task_locks(&task);
        self.path_cache.delete_path(&vehicle);
        self.state.set_status(&vehicle, VehicleStatus::Idle);
        self.state.set_carrying(&vehicle, false);
        self.state.set_active_task(&vehicle, None);
        self.conflict.clear_waiting(&vehicle);
        self.segments.remove(&task.id);
        if let Some(end) = &task.end_node {
            self.state.set_node_has_box(end, true);
        }
        info!(task = %task.id, vehicle = %vehicle, "task complete");

        if self.executing_mode.contains_key(&vehicle) {
            self.spawn_dispatch_once();
        }
        Ok(())
    }

    async fn on_arrived_at_lifter(&self, vehicle: VehicleId, floor: FloorId) -> WcsResult<()> {
        let entry = self.mission.lifter_entry(floor)?;
        self.state.set_location(&vehicle, entry, floor);
        self.state.set_status(&vehicle, VehicleStatus::Waiting);
        let task = match self.tasks.active_task_of(&vehicle) {
            Some(t) => t,
            None => return Ok(()),
        };
        let carrying = self.state.get(&vehicle).map_or(false, |v| v.carrying);
        let target_floor = self.objective_floor(&task, carrying);
        // Board: ask the cabin to carry the shuttle over.
        self.lifter.request_lifter(target_floor, &vehicle, 0);
        debug!(vehicle = %vehicle, floor, target_floor, "at lifter entry, boarding requested");
        Ok(())
    }

    async fn on_waiting_for_lifter(&self, vehicle: VehicleId) -> WcsResult<()> {
        let task = match self.tasks.active_task_of(&vehicle) {
            Some(t) => t,
            None => return Ok(()),
        };
        self.tasks
            .update_status(task.id, TaskStatus::WaitingForLifter, Some(vehicle.clone()))
            .await?;
        let v = self
            .state
            .get(&vehicle)
            .ok_or_else(|| WcsError::VehicleNotFound(vehicle.to_string()))?;
        let status = self.lifter.status().await?;
        let here = status.current_floor == v.floor && status.status == LifterStatus::Idle;
        if !here {
            self.lifter.request_lifter(v.floor, &vehicle, 0);
        }
        Ok(())
    }

    /// React to the cabin reaching a floor for a vehicle
    pub async fn handle_lifter_event(&self, event: LifterEvent) -> WcsResult<()> {
        let LifterEvent::LifterArrived { floor, vehicle } = event;
        let v = match self.state.get(&vehicle) {
            Some(v) => v,
            None => return Ok(()),
        };
        let task = match self.tasks.active_task_of(&vehicle) {
            Some(t) => t,
            None => return Ok(()),
        };
        let target_floor = self.objective_floor(&task, v.carrying);
        let purpose = if task.status == TaskStatus::InProgress || v.carrying {
            SegmentPurpose::Delivery
        } else {
            SegmentPurpose::Pickup
        };

        if floor == v.floor && v.floor != target_floor {
            // The cabin is here to collect the shuttle. A shuttle still
            // short of the entry gets a fresh segment to it; one already
            // at the entry boards.
            let entry = self.mission.lifter_entry(v.floor)?;
            if v.node.as_ref() == Some(&entry) {
                self.lifter.request_lifter(target_floor, &vehicle, 0);
            } else {
                let segment = self.next_segment_ordinal(task.id);
                let envelope = self
                    .mission
                    .next_segment(&vehicle, &task, purpose, segment)
                    .await?;
                self.spawn_publish(envelope);
            }
            return Ok(());
        }

        if floor == target_floor && v.floor != target_floor {
            // The cabin delivered the shuttle to the objective floor.
            let old_entry = self.mission.lifter_entry(v.floor)?;
            let exit = self.mission.lifter_exit(target_floor)?;
            self.occupancy
                .handle_move(&vehicle, Some(&old_entry), &exit)?;
            self.state.set_location(&vehicle, exit, target_floor);
            let restored = match purpose {
                SegmentPurpose::Pickup => TaskStatus::Assigned,
                SegmentPurpose::Delivery => TaskStatus::InProgress,
            };
            self.tasks
                .update_status(task.id, restored, Some(vehicle.clone()))
                .await?;
            let segment = self.next_segment_ordinal(task.id);
            let envelope = self
                .mission
                .next_segment(&vehicle, &task, purpose, segment)
                .await?;
            info!(vehicle = %vehicle, floor = target_floor, "lifter transfer complete");
            self.spawn_publish(envelope);
        }
        Ok(())
    }

    /// Floor of the task's current objective: pickup before the pallet is
    /// on board, the committed end node after.
    fn objective_floor(&self, task: &Task, carrying: bool) -> FloorId {
        if task.status == TaskStatus::InProgress || carrying {
            task.end_floor.unwrap_or(task.pickup_floor)
        } else {
            task.pickup_floor
        }
    }
}

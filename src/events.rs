//! Typed event stream between the engine and the vehicle fleet
//!
//! Transport (MQTT/WebSocket) stays outside the crate; adapters translate
//! wire messages into these variants and back. The core only ever sees the
//! typed stream.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::{WcsError, WcsResult};
use crate::types::{FloorId, NodeId, TaskId, VehiclePath, VehicleId, VehicleStatus};

/// Periodic vehicle state snapshot (`vehicle.info.<id>` channel)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleInfo {
    /// Reporting vehicle
    pub vehicle: VehicleId,
    /// Current node, if localized
    pub node: Option<NodeId>,
    /// Current floor
    pub floor: FloorId,
    /// Operational status
    pub status: VehicleStatus,
    /// Pallet on board
    pub carrying: bool,
    /// Battery percentage
    pub battery: Option<f32>,
}

/// Semantic ingress events (`vehicle.events` channel)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IngressEvent {
    /// Periodic state snapshot
    VehicleInfo(VehicleInfo),
    /// A shuttle came online at a node
    ShuttleInitialized {
        vehicle: VehicleId,
        node: NodeId,
        floor: FloorId,
    },
    /// A shuttle advanced one node
    ShuttleMoved {
        vehicle: VehicleId,
        previous_node: Option<NodeId>,
        current_node: NodeId,
    },
    /// A shuttle is blocked and asks for help
    ShuttleWaiting {
        vehicle: VehicleId,
        waiting_at: NodeId,
        target_node: NodeId,
        blocked_by: VehicleId,
    },
    /// A previously blocked shuttle is moving again
    ShuttleResumed { vehicle: VehicleId },
    /// A shuttle accepted its mission and started driving
    ShuttleTaskStarted { vehicle: VehicleId, task: TaskId },
    /// The pallet is on board
    #[serde(rename = "PICKUP_COMPLETE")]
    PickupComplete { vehicle: VehicleId },
    /// The mission's final node was reached
    #[serde(rename = "TASK_COMPLETE")]
    TaskComplete { vehicle: VehicleId },
    /// The shuttle stands at the lifter entry node
    #[serde(rename = "ARRIVED_AT_LIFTER")]
    ArrivedAtLifter { vehicle: VehicleId, floor: FloorId },
    /// The shuttle parked short of the lifter entry
    #[serde(rename = "WAITING_FOR_LIFTER")]
    WaitingForLifter { vehicle: VehicleId },
    /// Mission acknowledgement for publish-with-retry
    #[serde(rename = "MISSION_ACK")]
    MissionAck { vehicle: VehicleId, task: TaskId },
}

impl IngressEvent {
    /// The vehicle this event belongs to; events for one vehicle are
    /// processed strictly in arrival order.
    pub fn vehicle(&self) -> &VehicleId {
        match self {
            IngressEvent::VehicleInfo(info) => &info.vehicle,
            IngressEvent::ShuttleInitialized { vehicle, .. }
            | IngressEvent::ShuttleMoved { vehicle, .. }
            | IngressEvent::ShuttleWaiting { vehicle, .. }
            | IngressEvent::ShuttleResumed { vehicle }
            | IngressEvent::ShuttleTaskStarted { vehicle, .. }
            | IngressEvent::PickupComplete { vehicle }
            | IngressEvent::TaskComplete { vehicle }
            | IngressEvent::ArrivedAtLifter { vehicle, .. }
            | IngressEvent::WaitingForLifter { vehicle }
            | IngressEvent::MissionAck { vehicle, .. } => vehicle,
        }
    }
}

/// Internal lifter fan-out (`lifter.events`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifterEvent {
    /// The cabin reached a floor for a vehicle
    LifterArrived { floor: FloorId, vehicle: VehicleId },
}

/// Semantic tag telling the router what the vehicle reports on arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnArrival {
    /// Final node of the mission
    TaskComplete,
    /// Pickup node; pallet goes on board
    PickupComplete,
    /// Lifter entry node
    ArrivedAtLifter,
    /// Parked short of the lifter entry
    WaitingForLifter,
}

/// Structured instruction sent to a vehicle (`vehicle.mission.<id>`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionEnvelope {
    /// Executing vehicle
    pub vehicle: VehicleId,
    /// Task this segment belongs to
    pub task_id: TaskId,
    /// Steps to drive
    pub path: VehiclePath,
    /// What the vehicle reports at the last step
    pub on_arrival: OnArrival,
    /// Ordinal of this segment within the task, 1-based
    pub segment: u32,
    /// Final mission target (may differ from the last path node on
    /// cross-floor segments)
    pub final_target_node: NodeId,
    /// Final mission floor
    pub final_target_floor: FloorId,
    /// Pickup node of the task
    pub pickup_node_qr: Option<NodeId>,
    /// Committed end node of the task
    pub end_node_qr: Option<NodeId>,
    /// Opaque item payload
    pub item_info: serde_json::Value,
    /// Pallet on board for this segment
    pub is_carrying: bool,
    /// Node ids only, for external observers
    pub running_path_simulation: Vec<NodeId>,
}

impl MissionEnvelope {
    /// Wire rendering of the steps, `"<QR>><dir>:<action>"` each
    pub fn wire_steps(&self) -> Vec<String> {
        self.path.steps.iter().map(|s| s.render()).collect()
    }
}

/// Conflict-resolution command kind (`vehicle.command.<id>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandAction {
    /// Replace the active path
    Reroute,
    /// Drive backward to a reserved parking node
    BacktrackToParking,
    /// Drive backward and hold
    BacktrackAndWait,
    /// Clear the way for a higher-priority vehicle
    Yield,
}

/// Conflict-resolution command envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleCommand {
    /// Addressed vehicle
    pub vehicle: VehicleId,
    /// Command kind
    pub action: CommandAction,
    /// Replacement or backtrack path, when the action carries one
    pub path: Option<VehiclePath>,
    /// Human-readable cause, for the vehicle log
    pub reason: String,
}

/// Egress side of the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EgressCommand {
    /// Mission envelope
    Mission(MissionEnvelope),
    /// Conflict-resolution command
    Command(VehicleCommand),
    /// Boolean run permission (`vehicle.run.<id>`)
    RunPermission { vehicle: VehicleId, allowed: bool },
}

impl EgressCommand {
    /// The addressed vehicle
    pub fn vehicle(&self) -> &VehicleId {
        match self {
            EgressCommand::Mission(m) => &m.vehicle,
            EgressCommand::Command(c) => &c.vehicle,
            EgressCommand::RunPermission { vehicle, .. } => vehicle,
        }
    }
}

/// Channel bundle connecting ingress, egress and the lifter fan-out.
///
/// Ingress is a bounded queue drained by the single router task; egress and
/// lifter events are broadcast so transports and tests can subscribe
/// independently.
#[derive(Clone)]
pub struct EventBus {
    ingress_tx: mpsc::Sender<IngressEvent>,
    egress_tx: broadcast::Sender<EgressCommand>,
    lifter_tx: broadcast::Sender<LifterEvent>,
}

impl EventBus {
    /// Create a bus with the given ingress queue capacity. Returns the bus
    /// and the ingress receiver for the router task.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<IngressEvent>) {
        let (ingress_tx, ingress_rx) = mpsc::channel(capacity);
        let (egress_tx, _) = broadcast::channel(capacity);
        let (lifter_tx, _) = broadcast::channel(capacity);
        (
            Self {
                ingress_tx,
                egress_tx,
                lifter_tx,
            },
            ingress_rx,
        )
    }

    /// Hand an ingress event to the router
    pub async fn ingest(&self, event: IngressEvent) -> WcsResult<()> {
        self.ingress_tx
            .send(event)
            .await
            .map_err(|_| WcsError::ChannelClosed("ingress".into()))
    }

    /// Publish a command toward the fleet. Succeeds with no receivers; a
    /// transport that is not up yet simply misses the message.
    pub fn publish(&self, command: EgressCommand) {
        let _ = self.egress_tx.send(command);
    }

    /// Subscribe to egress commands
    pub fn subscribe_egress(&self) -> broadcast::Receiver<EgressCommand> {
        self.egress_tx.subscribe()
    }

    /// Publish an internal lifter event
    pub fn publish_lifter(&self, event: LifterEvent) {
        let _ = self.lifter_tx.send(event);
    }

    /// Subscribe to lifter events
    pub fn subscribe_lifter(&self) -> broadcast::Receiver<LifterEvent> {
        self.lifter_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn ingress_events_reach_the_router() {
        let (bus, mut rx) = EventBus::new(8);
        assert_ok!(
            bus.ingest(IngressEvent::ShuttleResumed {
                vehicle: VehicleId::from("S1"),
            })
            .await
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.vehicle(), &VehicleId::from("S1"));
    }

    #[tokio::test]
    async fn ingest_fails_once_the_router_is_gone() {
        let (bus, rx) = EventBus::new(8);
        drop(rx);
        let result = bus
            .ingest(IngressEvent::ShuttleResumed {
                vehicle: VehicleId::from("S1"),
            })
            .await;
        assert!(matches!(result, Err(WcsError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn egress_fan_out_reaches_all_subscribers() {
        let (bus, _rx) = EventBus::new(8);
        let mut a = bus.subscribe_egress();
        let mut b = bus.subscribe_egress();

        bus.publish(EgressCommand::RunPermission {
            vehicle: VehicleId::from("S1"),
            allowed: true,
        });

        assert!(matches!(
            a.recv().await.unwrap(),
            EgressCommand::RunPermission { allowed: true, .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            EgressCommand::RunPermission { allowed: true, .. }
        ));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let (bus, _rx) = EventBus::new(8);
        bus.publish(EgressCommand::RunPermission {
            vehicle: VehicleId::from("S1"),
            allowed: false,
        });
    }
}

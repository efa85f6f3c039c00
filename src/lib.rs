//! Warehouse fleet controller
//!
//! Traffic and mission coordination for three vehicle populations on a
//! shared floor graph:
//! - row-running shuttles, routed topologically with traffic, corridor and
//!   row-direction penalties;
//! - free-roaming AMRs, routed metrically and driven fire-and-forget;
//! - vertical lifters, coordinated through a FIFO queue with sensor drift
//!   correction.
//!
//! The engine guarantees exclusive node occupation with lease semantics,
//! FIFO task dispatch, deterministic conflict priorities with tiered
//! reroute/backtrack/parking strategies, and deadlock detection over the
//! wait-for graph. Transport (MQTT/WebSocket), the PLC wire protocol and
//! the map catalog database stay behind seams.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod amr;
pub mod api;
pub mod concurrency;
pub mod config;
pub mod conflict;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod graph;
pub mod lifter;
pub mod mission;
pub mod priority;
pub mod row;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod testing;
pub mod types;

pub use config::{AppConfig, ConfigLoader};
pub use error::{WcsError, WcsResult};
pub use events::{EgressCommand, EventBus, IngressEvent, MissionEnvelope, OnArrival};
pub use types::{
    Direction, FloorId, Node, NodeId, StepAction, Task, TaskId, TaskStatus, Vehicle, VehicleId,
    VehicleKind, VehicleStatus,
};

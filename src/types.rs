//! Core data model for the fleet controller
//!
//! Nodes and edges are created at map load and read-only at runtime;
//! mutations to `has_box`/`blocked` are externally driven and observed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{WcsError, WcsResult};

/// Floor identifier
pub type FloorId = u32;

/// Stable node identifier (QR or map point id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Wrap a QR string
    pub fn new(qr: impl Into<String>) -> Self {
        Self(qr.into())
    }

    /// The raw QR string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Vehicle identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(pub String);

impl VehicleId {
    /// Wrap a vehicle name
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

static TASK_SEQ: AtomicU32 = AtomicU32::new(1);

/// Task identifier: registration timestamp plus a process-wide sequence
/// number. The sequence number is the FIFO term of the priority formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    /// Milliseconds since the epoch at registration
    pub stamp: i64,
    /// Monotone registration sequence
    pub seq: u32,
}

impl TaskId {
    /// Allocate a fresh task id
    pub fn next() -> Self {
        Self {
            stamp: Utc::now().timestamp_millis(),
            seq: TASK_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Parse from the `T<stamp>-<seq>` rendering
    pub fn parse_str(s: &str) -> WcsResult<Self> {
        let body = s
            .strip_prefix('T')
            .ok_or_else(|| WcsError::Validation(format!("Invalid task id: {}", s)))?;
        let (stamp, seq) = body
            .split_once('-')
            .ok_or_else(|| WcsError::Validation(format!("Invalid task id: {}", s)))?;
        Ok(Self {
            stamp: stamp
                .parse()
                .map_err(|_| WcsError::Validation(format!("Invalid task id: {}", s)))?,
            seq: seq
                .parse()
                .map_err(|_| WcsError::Validation(format!("Invalid task id: {}", s)))?,
        })
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}-{}", self.stamp, self.seq)
    }
}

impl Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TaskId::parse_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Vehicle population
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleKind {
    /// Row-running vehicle under pallets
    Shuttle,
    /// Free-roaming rack carrier
    Amr,
    /// Vertical transport between floors
    Lifter,
}

/// Vehicle operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStatus {
    /// Ready for dispatch
    Idle,
    /// Executing a path
    Moving,
    /// Blocked by another vehicle
    Waiting,
    /// Lifting a pallet
    Picking,
    /// Setting a pallet down
    Dropping,
    /// Faulted; excluded from dispatch
    Error,
}

/// A graph position with a stable QR id, grid and metric coordinates, and
/// externally observed flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable QR / map point id
    pub id: NodeId,
    /// Grid column
    pub col: i32,
    /// Grid row
    pub row: i32,
    /// Floor this node belongs to
    pub floor: FloorId,
    /// Metric x, for the Euclidean heuristic
    pub x: f64,
    /// Metric y
    pub y: f64,
    /// Node is not traversable
    #[serde(default)]
    pub blocked: bool,
    /// A pallet currently sits on this node
    #[serde(default)]
    pub has_box: bool,
    /// Direction tag from the map catalog; empty on nodes that must not be
    /// used for parking
    #[serde(default)]
    pub direction_type: String,
    /// Optional cell classification (storage, buffer, charger...)
    #[serde(default)]
    pub cell_type: Option<String>,
}

impl Node {
    /// Manhattan distance to another node on the grid
    pub fn manhattan(&self, other: &Node) -> i32 {
        (self.col - other.col).abs() + (self.row - other.row).abs()
    }

    /// Euclidean distance between node centers
    pub fn euclidean(&self, other: &Node) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Undirected same-floor edge with precomputed geometric distance.
/// Direction semantics are enforced by one-way row locks, not storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// One endpoint
    pub a: NodeId,
    /// Other endpoint
    pub b: NodeId,
    /// Geometric length
    pub distance: f64,
}

/// Travel direction on the 4-neighbour grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Row decreasing
    Up,
    /// Row increasing
    Down,
    /// Column decreasing
    Left,
    /// Column increasing
    Right,
}

impl Direction {
    /// Wire number used in mission steps
    pub fn wire(self) -> u8 {
        match self {
            Direction::Up => 1,
            Direction::Down => 2,
            Direction::Left => 3,
            Direction::Right => 4,
        }
    }

    /// Infer from a grid delta between two adjacent nodes. Vertical
    /// movement wins when both deltas are non-zero, which cannot happen on
    /// a well-formed 4-neighbour map.
    pub fn from_delta(dcol: i32, drow: i32) -> Option<Self> {
        if drow < 0 {
            Some(Direction::Up)
        } else if drow > 0 {
            Some(Direction::Down)
        } else if dcol < 0 {
            Some(Direction::Left)
        } else if dcol > 0 {
            Some(Direction::Right)
        } else {
            None
        }
    }

    /// The opposite direction
    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    /// Whether `other` crosses this direction (perpendicular axes)
    pub fn crosses(self, other: Self) -> bool {
        self != other && self != other.opposite()
    }
}

/// Per-step command annotated on a mission edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepAction {
    /// Plain traversal
    NoAction,
    /// Lift the pallet at this node
    PickUp,
    /// Set the pallet down at this node
    DropOff,
    /// First slow tier
    Slow1,
    /// Second slow tier
    Slow2,
    /// Stop and hold position (lifter entry)
    StopAtNode,
    /// Full speed
    Fast,
}

impl StepAction {
    /// Wire number used in mission steps
    pub fn wire(self) -> u8 {
        match self {
            StepAction::NoAction => 0,
            StepAction::PickUp => 11,
            StepAction::DropOff => 12,
            StepAction::Slow1 => 21,
            StepAction::Slow2 => 22,
            StepAction::StopAtNode => 31,
            StepAction::Fast => 41,
        }
    }
}

/// One step of a committed path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStep {
    /// Destination node of this step
    pub node: NodeId,
    /// Travel direction into the node
    pub direction: Direction,
    /// Action to perform at the node
    pub action: StepAction,
}

impl PathStep {
    /// Wire rendering `"<QR>><dir>:<action>"`
    pub fn render(&self) -> String {
        format!("{}>{}:{}", self.node, self.direction.wire(), self.action.wire())
    }
}

/// A committed path for one vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePath {
    /// Ordered steps, excluding the start node
    pub steps: Vec<PathStep>,
    /// Step count, equal to `steps.len()`
    pub total_step: usize,
}

impl VehiclePath {
    /// Build from steps
    pub fn new(steps: Vec<PathStep>) -> Self {
        let total_step = steps.len();
        Self { steps, total_step }
    }

    /// An empty "wait in place" path
    pub fn empty() -> Self {
        Self { steps: Vec::new(), total_step: 0 }
    }

    /// Node ids in traversal order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.steps.iter().map(|s| s.node.clone()).collect()
    }
}

/// Vehicle record as tracked by the state cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    /// Identity
    pub id: VehicleId,
    /// Population
    pub kind: VehicleKind,
    /// Current node, if localized
    pub node: Option<NodeId>,
    /// Current floor
    pub floor: FloorId,
    /// Whether a pallet is on board
    pub carrying: bool,
    /// Operational status
    pub status: VehicleStatus,
    /// Active task, if any
    pub active_task: Option<TaskId>,
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Committed, waiting for a vehicle
    Pending,
    /// Bound to a vehicle, en route to pickup
    Assigned,
    /// Pallet on board, en route to the end node
    InProgress,
    /// Parked short of the lifter entry
    WaitingForLifter,
    /// Terminal: done
    Completed,
    /// Terminal: given up
    Failed,
}

impl TaskStatus {
    /// Terminal statuses release the vehicle
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A pickup/drop mission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier
    pub id: TaskId,
    /// Pickup node
    pub pickup_node: NodeId,
    /// Pickup floor
    pub pickup_floor: FloorId,
    /// End node; set at commit time, not registration
    pub end_node: Option<NodeId>,
    /// End floor; set at commit time
    pub end_floor: Option<FloorId>,
    /// Pallet type used for end-node allocation
    pub pallet_type: String,
    /// Whether the pallet is on board
    pub carrying: bool,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Vehicle this task is bound to
    pub assigned_vehicle: Option<VehicleId>,
    /// Registration timestamp
    pub created_at: DateTime<Utc>,
    /// Last transition timestamp
    pub updated_at: DateTime<Utc>,
    /// Opaque item payload, preserved end-to-end
    pub item_info: serde_json::Value,
    /// Pickup batch key, when row coordination applies
    pub batch_id: Option<String>,
    /// Target row: requested by the stager, otherwise assigned at commit
    /// time
    pub target_row: Option<i32>,
}

impl Task {
    /// Create a freshly staged task. `target_row` pins the end-node
    /// allocation to one aisle; `None` leaves the choice to the scheduler.
    pub fn staged(
        pickup_node: NodeId,
        pickup_floor: FloorId,
        pallet_type: impl Into<String>,
        target_row: Option<i32>,
        item_info: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::next(),
            pickup_node,
            pickup_floor,
            end_node: None,
            end_floor: None,
            pallet_type: pallet_type.into(),
            carrying: false,
            status: TaskStatus::Pending,
            assigned_vehicle: None,
            created_at: now,
            updated_at: now,
            item_info,
            batch_id: None,
            target_row,
        }
    }
}

/// One-way direction of a horizontal aisle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowDirection {
    /// Columns ascending
    LeftToRight,
    /// Columns descending
    RightToLeft,
}

impl RowDirection {
    /// The grid direction a vehicle travels under this row direction
    pub fn travel(self) -> Direction {
        match self {
            RowDirection::LeftToRight => Direction::Right,
            RowDirection::RightToLeft => Direction::Left,
        }
    }
}

/// Lifter operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifterStatus {
    /// Parked at `current_floor`
    Idle,
    /// Travelling to `target_floor`
    Moving,
}

/// Lifter state, drift-corrected on read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifterState {
    /// Operational status
    pub status: LifterStatus,
    /// Floor the cabin is at (or was last seen at)
    pub current_floor: FloorId,
    /// Destination floor while moving
    pub target_floor: Option<FloorId>,
    /// Vehicle the current trip serves
    pub assigned_to: Option<VehicleId>,
}

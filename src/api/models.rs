//! REST request/response models

use serde::{Deserialize, Serialize};

use crate::types::FloorId;

/// `POST /amr/path` request
#[derive(Debug, Deserialize)]
pub struct AmrPathRequest {
    /// Executing AMR
    pub amr_id: Option<String>,
    /// Start node QR
    pub start: Option<String>,
    /// End node QR
    pub end: Option<String>,
    /// Floor, defaults to 1
    pub floor: Option<FloorId>,
}

/// `POST /amr/path` response
#[derive(Debug, Serialize)]
pub struct AmrPathResponse {
    /// Task id of the background execution
    pub task_id: String,
    /// Node ids in drive order
    pub move_task_list: Vec<String>,
}

/// `POST /lifter/request-task` request
#[derive(Debug, Deserialize)]
pub struct LifterRequestTask {
    /// Destination floor
    pub floor: Option<FloorId>,
    /// Served vehicle
    pub vehicle: Option<String>,
    /// Tower id; the deployment's single tower when omitted
    pub lifter_id: Option<String>,
}

/// `POST /lifter/request-task` response
#[derive(Debug, Serialize)]
pub struct LifterQueueResponse {
    /// Tower id
    pub lifter: String,
    /// Requested floor
    pub floor: FloorId,
    /// Requests ahead in the queue, including this one
    pub queue_length: usize,
}

/// Next queued lifter trip
#[derive(Debug, Serialize)]
pub struct NextLifterTask {
    /// Destination floor
    pub floor: FloorId,
    /// Served vehicle
    pub vehicle: String,
}

/// `POST /lifter/complete-task/:id` response
#[derive(Debug, Serialize)]
pub struct LifterCompleteResponse {
    /// Completed tower
    pub lifter: String,
    /// Next trip, if one is queued
    pub next: Option<NextLifterTask>,
}

/// `GET /health` response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves
    pub status: String,
    /// Service name from configuration
    pub service: String,
    /// Loaded floors
    pub floors: Vec<FloorId>,
    /// Staged tasks awaiting an end node
    pub staged_tasks: usize,
    /// Committed tasks awaiting dispatch
    pub pending_tasks: usize,
    /// Queued lifter trips
    pub lifter_queue: usize,
}

/// Error body for non-2xx responses
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable cause
    pub error: String,
}

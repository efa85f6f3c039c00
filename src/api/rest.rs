//! REST API server

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::amr::AmrExecutor;
use crate::api::models::*;
use crate::error::WcsError;
use crate::graph::WarehouseMap;
use crate::lifter::LifterCoordinator;
use crate::state::VehicleStateCache;
use crate::store::task_queue::{ShuttleTaskQueue, StagingQueue};
use crate::types::{NodeId, VehicleId};

/// Shared handler context
pub struct ApiContext {
    /// Service name for the health payload
    pub service_name: String,
    /// Floor map
    pub map: Arc<WarehouseMap>,
    /// AMR executor
    pub amr_executor: Arc<AmrExecutor>,
    /// Fleet state cache
    pub state: Arc<VehicleStateCache>,
    /// Lifter coordinator
    pub lifter: Arc<LifterCoordinator>,
    /// Staging queue
    pub staging: Arc<StagingQueue>,
    /// Committed task queue
    pub tasks: Arc<ShuttleTaskQueue>,
}

/// REST API server
pub struct RestApiServer {
    context: Arc<ApiContext>,
}

impl RestApiServer {
    /// Server over the shared context
    pub fn new(context: Arc<ApiContext>) -> Self {
        Self { context }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/amr/path", post(Self::amr_path))
            .route("/amr/data/:id", get(Self::amr_data))
            .route("/lifter/request-task", post(Self::lifter_request_task))
            .route("/lifter/complete-task/:id", post(Self::lifter_complete_task))
            .route("/health", get(Self::health))
            .with_state(Arc::clone(&self.context))
    }

    /// Enqueue an AMR task
    async fn amr_path(
        State(ctx): State<Arc<ApiContext>>,
        Json(request): Json<AmrPathRequest>,
    ) -> Result<Json<AmrPathResponse>, (StatusCode, Json<ErrorBody>)> {
        let amr_id = require(request.amr_id, "amr_id")?;
        let start = require(request.start, "start")?;
        let end = require(request.end, "end")?;
        let floor = request.floor.unwrap_or(1);

        let (task, list) = ctx
            .amr_executor
            .execute(&amr_id, floor, &NodeId::new(start), &NodeId::new(end))
            .map_err(|err| match err {
                WcsError::Validation(msg) => bad_request(msg),
                other => internal(other.to_string()),
            })?;

        Ok(Json(AmrPathResponse {
            task_id: task.to_string(),
            move_task_list: list.into_iter().map(|n| n.to_string()).collect(),
        }))
    }

    /// Read cached AMR state
    async fn amr_data(
        State(ctx): State<Arc<ApiContext>>,
        Path(id): Path<String>,
    ) -> Result<Json<serde_json::Value>, StatusCode> {
        ctx.state
            .amr_snapshot(&id)
            .map(Json)
            .ok_or(StatusCode::NOT_FOUND)
    }

    /// Enqueue a lifter trip
    async fn lifter_request_task(
        State(ctx): State<Arc<ApiContext>>,
        Json(request): Json<LifterRequestTask>,
    ) -> Result<Json<LifterQueueResponse>, (StatusCode, Json<ErrorBody>)> {
        let floor = require(request.floor, "floor")?;
        let vehicle = require(request.vehicle, "vehicle")?;
        if let Some(lifter_id) = &request.lifter_id {
            if lifter_id != ctx.lifter.tower_id() {
                return Err((
                    StatusCode::NOT_FOUND,
                    Json(ErrorBody {
                        error: format!("lifter {} not found", lifter_id),
                    }),
                ));
            }
        }

        ctx.lifter
            .request_lifter(floor, &VehicleId::new(vehicle), 0);
        Ok(Json(LifterQueueResponse {
            lifter: ctx.lifter.tower_id().to_string(),
            floor,
            queue_length: ctx.lifter.pending(),
        }))
    }

    /// Confirm a lifter trip done and return the next one
    async fn lifter_complete_task(
        State(ctx): State<Arc<ApiContext>>,
        Path(_id): Path<String>,
    ) -> Json<LifterCompleteResponse> {
        let next = ctx.lifter.confirm_complete().map(|r| NextLifterTask {
            floor: r.floor,
            vehicle: r.vehicle.to_string(),
        });
        Json(LifterCompleteResponse {
            lifter: ctx.lifter.tower_id().to_string(),
            next,
        })
    }

    /// Readiness
    async fn health(State(ctx): State<Arc<ApiContext>>) -> Json<HealthResponse> {
        Json(HealthResponse {
            status: "ok".into(),
            service: ctx.service_name.clone(),
            floors: ctx.map.floor_ids(),
            staged_tasks: ctx.staging.len().await,
            pending_tasks: ctx.tasks.pending_len().await,
            lifter_queue: ctx.lifter.pending(),
        })
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, (StatusCode, Json<ErrorBody>)> {
    value.ok_or_else(|| bad_request(format!("missing field {}", field)))
}

fn bad_request(msg: String) -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: msg }))
}

fn internal(msg: String) -> (StatusCode, Json<ErrorBody>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: msg }))
}

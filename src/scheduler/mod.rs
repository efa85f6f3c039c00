//! Staging scheduler
//!
//! Row-aware endpoint allocator. Each tick advances at most one staged
//! task: pick the target row (the stager's requested row when given,
//! batch-coordinated when two or more shuttles are active), scan that
//! row's free cells left to right, lock the first one and commit the task
//! to the global queue. A task that finds no cell goes back to the queue
//! front for the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::concurrency::{spawn_periodic, CancelToken};
use crate::config::TimingConfig;
use crate::error::WcsResult;
use crate::graph::{FloorGraph, WarehouseMap};
use crate::row::RowCoordinator;
use crate::state::VehicleStateCache;
use crate::store::reservation::{end_node_lock, ReservationStore};
use crate::store::task_queue::{ShuttleTaskQueue, StagingQueue};
use crate::types::{Node, Task, VehicleId, VehicleKind, VehicleStatus};

/// Owner recorded on end-node locks taken before a vehicle is known
fn scheduler_owner() -> VehicleId {
    VehicleId::new("staging-scheduler")
}

/// Row-aware endpoint allocator
pub struct StagingScheduler {
    map: Arc<WarehouseMap>,
    staging: Arc<StagingQueue>,
    tasks: Arc<ShuttleTaskQueue>,
    reservations: Arc<ReservationStore>,
    rows: Arc<RowCoordinator>,
    state: Arc<VehicleStateCache>,
    endnode_ttl: Duration,
}

impl StagingScheduler {
    /// Scheduler over the shared stores
    pub fn new(
        map: Arc<WarehouseMap>,
        staging: Arc<StagingQueue>,
        tasks: Arc<ShuttleTaskQueue>,
        reservations: Arc<ReservationStore>,
        rows: Arc<RowCoordinator>,
        state: Arc<VehicleStateCache>,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            map,
            staging,
            tasks,
            reservations,
            rows,
            state,
            endnode_ttl: Duration::from_secs(timing.endnode_lock_ttl_secs),
        }
    }

    /// One scheduler tick; at most one task advances.
    pub async fn tick(&self) -> WcsResult<()> {
        if self.staging.is_empty().await {
            return Ok(());
        }
        let mut task = match self.staging.pop_front().await {
            Some(t) => t,
            None => return Ok(()),
        };

        let target_floor = task.end_floor.unwrap_or(task.pickup_floor);
        let graph = self.map.floor(target_floor)?;

        let target_row = match self.target_row(&task, graph) {
            Some(row) => row,
            None => {
                debug!(task = %task.id, "no available cells, staged task requeued");
                self.staging.push_front(task).await;
                return Ok(());
            }
        };

        let candidates = self.available_cells(graph, target_row, &task.pallet_type);
        if candidates.is_empty() {
            self.staging.push_front(task).await;
            return Ok(());
        }

        // Left to right: the first lockable cell wins.
        for cell in candidates {
            let key = end_node_lock(&cell.id);
            if self
                .reservations
                .acquire(&key, &scheduler_owner(), Some(task.id), self.endnode_ttl)
            {
                task.end_node = Some(cell.id.clone());
                task.end_floor = Some(target_floor);
                task.target_row = Some(target_row);
                if task.batch_id.is_none() {
                    task.batch_id = Some(batch_key(&task));
                }
                info!(
                    task = %task.id,
                    end_node = %cell.id,
                    row = target_row,
                    "end node committed"
                );
                self.tasks.register(task).await?;
                return Ok(());
            }
        }

        self.staging.push_front(task).await;
        Ok(())
    }

    /// Target row: a row requested at staging time wins; otherwise
    /// batch-coordinated in multi-vehicle mode, first available cell's row
    /// in single-vehicle mode.
    fn target_row(&self, task: &Task, graph: &FloorGraph) -> Option<i32> {
        if let Some(requested) = task.target_row {
            return Some(requested);
        }
        let first_available = self.first_available_row(graph, &task.pallet_type)?;
        if self.active_shuttles() >= 2 {
            Some(self.rows.assign_row_for_batch(&batch_key(task), first_available))
        } else {
            Some(first_available)
        }
    }

    fn active_shuttles(&self) -> usize {
        self.state
            .all()
            .iter()
            .filter(|v| v.kind == VehicleKind::Shuttle && v.status != VehicleStatus::Error)
            .count()
    }

    /// Row of the first free cell in scan order (row, then column)
    fn first_available_row(&self, graph: &FloorGraph, pallet_type: &str) -> Option<i32> {
        let mut nodes: Vec<&Node> = graph
            .nodes()
            .filter(|n| self.cell_available(n, pallet_type))
            .collect();
        nodes.sort_by_key(|n| (n.row, n.col));
        nodes.first().map(|n| n.row)
    }

    /// Free cells of a row, column-ascending
    fn available_cells(&self, graph: &FloorGraph, row: i32, pallet_type: &str) -> Vec<Node> {
        graph
            .row_nodes(row)
            .into_iter()
            .filter(|n| self.cell_available(n, pallet_type))
            .cloned()
            .collect()
    }

    /// A cell can take this pallet: storage-typed (or untyped for the
    /// pallet's type), unblocked and observed empty.
    fn cell_available(&self, node: &Node, pallet_type: &str) -> bool {
        let type_ok = match node.cell_type.as_deref() {
            Some("storage") | None => true,
            Some(ct) => ct == pallet_type,
        };
        type_ok && !node.blocked && !self.state.node_has_box(&node.id, node.has_box)
    }

    /// Spawn the 5 s tick loop
    pub fn spawn(self: Arc<Self>, interval: Duration, token: CancelToken) -> JoinHandle<()> {
        let scheduler = self;
        spawn_periodic("staging-scheduler", interval, token, move || {
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.tick().await }
        })
    }
}

/// Pickup batch key shared by tasks staged from the same pickup node
pub fn batch_key(task: &Task) -> String {
    format!("batch:pickup:{}", task.pickup_node)
}

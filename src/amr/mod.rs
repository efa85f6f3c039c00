//! AMR async executor and pollers
//!
//! AMRs are driven fire-and-forget: a task request is answered immediately
//! with a task id and the metric move list, while a background driver walks
//! the sequence and emits lifecycle events on a fixed cadence. Five pollers
//! per AMR keep the state cache fresh; a poller that fails logs and simply
//! tries again on its next tick. AMRs take no part in reservations, row
//! locks or the shuttle conflict resolver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::concurrency::{spawn_periodic, CancelToken};
use crate::config::AmrConfig;
use crate::error::{WcsError, WcsResult};
use crate::graph::{astar, WarehouseMap};
use crate::state::VehicleStateCache;
use crate::types::{FloorId, NodeId, TaskId};

/// What a poller asks the AMR endpoint for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    /// Position
    Location,
    /// Battery percentage
    Battery,
    /// Rack on board
    Cargo,
    /// Operational status
    Status,
    /// Safety sensors
    Sensors,
}

impl PollKind {
    /// Cache key fragment
    pub fn as_str(self) -> &'static str {
        match self {
            PollKind::Location => "location",
            PollKind::Battery => "battery",
            PollKind::Cargo => "cargo",
            PollKind::Status => "status",
            PollKind::Sensors => "sensors",
        }
    }

    fn cadence(self, cfg: &AmrConfig) -> Duration {
        let secs = match self {
            PollKind::Location => cfg.location_poll_secs,
            PollKind::Battery => cfg.battery_poll_secs,
            PollKind::Cargo => cfg.cargo_poll_secs,
            PollKind::Status => cfg.status_poll_secs,
            PollKind::Sensors => cfg.sensors_poll_secs,
        };
        Duration::from_secs(secs)
    }

    const ALL: [PollKind; 5] = [
        PollKind::Location,
        PollKind::Battery,
        PollKind::Cargo,
        PollKind::Status,
        PollKind::Sensors,
    ];
}

/// Seam to one AMR's vendor endpoint
#[async_trait]
pub trait AmrEndpoint: Send + Sync {
    /// Fetch one datum
    async fn fetch(&self, amr: &str, kind: PollKind) -> WcsResult<serde_json::Value>;
}

/// Spawn the five pollers for one AMR. Every fetch carries the external
/// call deadline; errors are logged by the supervised loop and the poller
/// retries on its next tick. It is never restarted.
pub fn spawn_pollers(
    amr: &str,
    endpoint: Arc<dyn AmrEndpoint>,
    state: Arc<VehicleStateCache>,
    cfg: &AmrConfig,
    call_timeout: Duration,
    token: &CancelToken,
) -> Vec<JoinHandle<()>> {
    PollKind::ALL
        .iter()
        .map(|&kind| {
            let amr = amr.to_string();
            let endpoint = Arc::clone(&endpoint);
            let state = Arc::clone(&state);
            spawn_periodic("amr-poller", kind.cadence(cfg), token.clone(), move || {
                let amr = amr.clone();
                let endpoint = Arc::clone(&endpoint);
                let state = Arc::clone(&state);
                async move {
                    let value =
                        tokio::time::timeout(call_timeout, endpoint.fetch(&amr, kind))
                            .await
                            .map_err(|_| {
                                WcsError::Timeout(format!("{} {} poll", amr, kind.as_str()))
                            })??;
                    state.set_amr_data(&amr, kind.as_str(), value);
                    Ok(())
                }
            })
        })
        .collect()
}

/// Lifecycle phase of an AMR task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmrTaskPhase {
    /// Accepted into the executor
    Queued,
    /// Bound to the AMR
    Assigned,
    /// Driving
    Started,
    /// One node advanced
    Progress {
        /// 1-based step ordinal
        step: usize,
        /// Node reached
        node: NodeId,
    },
    /// Sequence finished
    Completed,
    /// Sequence aborted
    Failed {
        /// Cause
        reason: String,
    },
}

/// Event emitted by the background driver
#[derive(Debug, Clone, Serialize)]
pub struct AmrTaskEvent {
    /// Task id handed back to the caller
    pub task: TaskId,
    /// Executing AMR
    pub amr: String,
    /// Phase reached
    pub phase: AmrTaskPhase,
}

/// Fire-and-forget task executor
pub struct AmrExecutor {
    map: Arc<WarehouseMap>,
    events: broadcast::Sender<AmrTaskEvent>,
    inter_step_delay: Duration,
}

impl AmrExecutor {
    /// Executor over the floor map
    pub fn new(map: Arc<WarehouseMap>, cfg: &AmrConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            map,
            events,
            inter_step_delay: Duration::from_secs(cfg.inter_step_delay_secs),
        }
    }

    /// Subscribe to task lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<AmrTaskEvent> {
        self.events.subscribe()
    }

    /// Accept a task: compute the metric move list, return immediately and
    /// drive the sequence in the background.
    pub fn execute(
        &self,
        amr: &str,
        floor: FloorId,
        start: &NodeId,
        end: &NodeId,
    ) -> WcsResult<(TaskId, Vec<NodeId>)> {
        let graph = self.map.floor(floor)?;
        let move_task_list = astar::find_path(graph, start, end).ok_or(WcsError::NoPath {
            from: start.to_string(),
            to: end.to_string(),
            floor,
        })?;

        let task = TaskId::next();
        info!(task = %task, amr, steps = move_task_list.len(), "amr task accepted");

        let events = self.events.clone();
        let amr = amr.to_string();
        let list = move_task_list.clone();
        let delay = self.inter_step_delay;
        tokio::spawn(async move {
            let emit = |phase: AmrTaskPhase| {
                let _ = events.send(AmrTaskEvent {
                    task,
                    amr: amr.clone(),
                    phase,
                });
            };
            emit(AmrTaskPhase::Queued);
            emit(AmrTaskPhase::Assigned);
            emit(AmrTaskPhase::Started);
            for (step, node) in list.iter().skip(1).enumerate() {
                tokio::time::sleep(delay).await;
                emit(AmrTaskPhase::Progress {
                    step: step + 1,
                    node: node.clone(),
                });
            }
            emit(AmrTaskPhase::Completed);
            debug!(task = %task, "amr task finished");
        });

        Ok((task, move_task_list))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{grid_id, grid_map};

    struct StaticEndpoint;

    #[async_trait]
    impl AmrEndpoint for StaticEndpoint {
        async fn fetch(&self, _amr: &str, kind: PollKind) -> WcsResult<serde_json::Value> {
            Ok(serde_json::json!({ "kind": kind.as_str() }))
        }
    }

    #[tokio::test]
    async fn pollers_write_through_to_the_cache() {
        let state = Arc::new(VehicleStateCache::new());
        let token = CancelToken::new();
        let mut cfg = AmrConfig::default();
        cfg.location_poll_secs = 1;
        let handles = spawn_pollers(
            "A1",
            Arc::new(StaticEndpoint),
            Arc::clone(&state),
            &cfg,
            Duration::from_secs(5),
            &token,
        );
        assert_eq!(handles.len(), 5);

        // First tick of every poller fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let snapshot = state.amr_snapshot("A1").unwrap();
        assert!(snapshot.get("location").is_some());
        assert!(snapshot.get("battery").is_some());
    }

    #[tokio::test]
    async fn executor_returns_immediately_and_completes_in_background() {
        let map = Arc::new(grid_map("n", 3, 1, 1));
        let mut cfg = AmrConfig::default();
        cfg.inter_step_delay_secs = 0;
        let executor = AmrExecutor::new(map, &cfg);
        let mut events = executor.subscribe();

        let (task, list) = executor
            .execute("A1", 1, &grid_id("n", 0, 0), &grid_id("n", 2, 0))
            .unwrap();
        assert_eq!(list.len(), 3);

        let mut phases = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            assert_eq!(event.task, task);
            let done = event.phase == AmrTaskPhase::Completed;
            phases.push(event.phase);
            if done {
                break;
            }
        }
        assert_eq!(phases[0], AmrTaskPhase::Queued);
        assert_eq!(phases[1], AmrTaskPhase::Assigned);
        assert_eq!(phases[2], AmrTaskPhase::Started);
        // Two progress steps for a three-node list.
        assert_eq!(
            phases
                .iter()
                .filter(|p| matches!(p, AmrTaskPhase::Progress { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn unreachable_goal_is_rejected_up_front() {
        let map = Arc::new(grid_map("n", 2, 1, 1));
        let executor = AmrExecutor::new(map, &AmrConfig::default());
        assert!(executor
            .execute("A1", 1, &grid_id("n", 0, 0), &NodeId::from("nowhere"))
            .is_err());
    }
}

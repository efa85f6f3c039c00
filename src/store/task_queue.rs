//! Task queues
//!
//! The staging queue feeds the endpoint allocator; the shuttle task queue is
//! the globally ordered FIFO of committed tasks, keyed by registration
//! timestamp, with a mutable status record per task. Both dequeue paths are
//! single-writer by construction (one scheduler tick, one dispatcher loop).

use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{WcsError, WcsResult};
use crate::types::{Task, TaskId, TaskStatus, VehicleId};

/// FIFO of staged tasks awaiting end-node allocation
pub struct StagingQueue {
    queue: Mutex<VecDeque<Task>>,
}

impl StagingQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a freshly staged task
    pub async fn push_back(&self, task: Task) {
        self.queue.lock().await.push_back(task);
    }

    /// Return a task to the queue front (allocation failed, retry next tick)
    pub async fn push_front(&self, task: Task) {
        self.queue.lock().await.push_front(task);
    }

    /// Take the next staged task
    pub async fn pop_front(&self) -> Option<Task> {
        self.queue.lock().await.pop_front()
    }

    /// Pending staged count
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// True when nothing is staged
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

impl Default for StagingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Globally ordered FIFO of committed tasks plus status records
pub struct ShuttleTaskQueue {
    /// Registration order: `(stamp, seq) -> task id`
    pending: RwLock<BTreeMap<(i64, u32), TaskId>>,
    /// Task records
    tasks: DashMap<TaskId, Task>,
    /// Tasks currently being processed
    processing: DashMap<TaskId, ()>,
    /// `vehicle -> active task`
    active: DashMap<VehicleId, TaskId>,
}

impl ShuttleTaskQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(BTreeMap::new()),
            tasks: DashMap::new(),
            processing: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Register a committed task into the global FIFO
    pub async fn register(&self, task: Task) -> WcsResult<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(WcsError::Validation(format!(
                "task {} already registered",
                task.id
            )));
        }
        self.pending
            .write()
            .await
            .insert((task.id.stamp, task.id.seq), task.id);
        debug!(task = %task.id, "task committed");
        self.tasks.insert(task.id, task);
        Ok(())
    }

    /// Peek the oldest task still in `Pending` without removing it
    pub async fn next_pending(&self) -> Option<Task> {
        let pending = self.pending.read().await;
        for id in pending.values() {
            if let Some(task) = self.tasks.get(id) {
                if task.status == TaskStatus::Pending {
                    return Some(task.clone());
                }
            }
        }
        None
    }

    /// Transition a task's status, applying the queue side effects
    pub async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        vehicle: Option<VehicleId>,
    ) -> WcsResult<Task> {
        let mut task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| WcsError::TaskNotFound(task_id.to_string()))?;
        task.status = status;
        task.updated_at = chrono::Utc::now();
        if let Some(vehicle) = &vehicle {
            task.assigned_vehicle = Some(vehicle.clone());
        }
        let task_snapshot = task.clone();
        drop(task);

        match status {
            TaskStatus::Assigned => {
                self.processing.insert(task_id, ());
                // A reassignment moves the binding; it never duplicates it.
                self.active.retain(|_, active_task| *active_task != task_id);
                if let Some(vehicle) = vehicle {
                    self.active.insert(vehicle, task_id);
                }
                self.pending
                    .write()
                    .await
                    .remove(&(task_id.stamp, task_id.seq));
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                self.processing.remove(&task_id);
                self.active
                    .retain(|_, active_task| *active_task != task_id);
            }
            _ => {}
        }
        Ok(task_snapshot)
    }

    /// A task record
    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// The task a vehicle is working on
    pub fn active_task_of(&self, vehicle: &VehicleId) -> Option<Task> {
        self.active
            .get(vehicle)
            .and_then(|id| self.tasks.get(&id).map(|t| t.clone()))
    }

    /// Ids currently in the processing set
    pub fn processing_ids(&self) -> Vec<TaskId> {
        self.processing.iter().map(|e| *e.key()).collect()
    }

    /// Committed tasks still pending
    pub async fn pending_len(&self) -> usize {
        self.pending.read().await.len()
    }
}

impl Default for ShuttleTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

//! Lifter coordination
//!
//! One coordinator per physical tower. Requests queue FIFO; the processor
//! loop holds a busy-lock with a safety TTL while a trip is in flight, so a
//! PLC that never confirms releases the tower by expiry and the request is
//! retried. Every status read is checked against the physical position
//! sensors; disagreement overwrites the cache and logs drift.

pub mod plc;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::concurrency::{spawn_periodic, CancelToken};
use crate::config::LifterTowerConfig;
use crate::error::{WcsError, WcsResult};
use crate::events::{EventBus, LifterEvent};
use crate::types::{FloorId, LifterState, LifterStatus, VehicleId};

use self::plc::{ctrl_tag, pos_tag, PlcClient};

/// A queued trip request
#[derive(Debug, Clone)]
pub struct LifterRequest {
    /// Destination floor
    pub floor: FloorId,
    /// Vehicle the trip serves
    pub vehicle: VehicleId,
    /// Requester priority, recorded for diagnostics
    pub priority: i64,
}

/// Coordinator for one lifter tower
pub struct LifterCoordinator {
    tower: LifterTowerConfig,
    plc: Arc<dyn PlcClient>,
    bus: EventBus,
    state: RwLock<Option<LifterState>>,
    queue: Mutex<VecDeque<LifterRequest>>,
    busy_until: Mutex<Option<Instant>>,
    busy_ttl: Duration,
    call_timeout: Duration,
}

impl LifterCoordinator {
    /// Coordinator over a PLC seam
    pub fn new(
        tower: LifterTowerConfig,
        plc: Arc<dyn PlcClient>,
        bus: EventBus,
        busy_ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            tower,
            plc,
            bus,
            state: RwLock::new(None),
            queue: Mutex::new(VecDeque::new()),
            busy_until: Mutex::new(None),
            busy_ttl,
            call_timeout,
        }
    }

    /// Tower id
    pub fn tower_id(&self) -> &str {
        &self.tower.id
    }

    /// Tower configuration (entry/exit nodes per floor)
    pub fn tower(&self) -> &LifterTowerConfig {
        &self.tower
    }

    /// Enqueue a trip request. Duplicate `(floor, vehicle)` pairs collapse
    /// into the existing queue position.
    pub fn request_lifter(&self, floor: FloorId, vehicle: &VehicleId, priority: i64) {
        let mut queue = self.queue.lock();
        if queue
            .iter()
            .any(|r| r.floor == floor && r.vehicle == *vehicle)
        {
            return;
        }
        info!(tower = %self.tower.id, floor, vehicle = %vehicle, "lifter requested");
        queue.push_back(LifterRequest {
            floor,
            vehicle: vehicle.clone(),
            priority,
        });
    }

    /// Pending request count
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// External completion confirmation: frees the tower immediately and
    /// reports the next queued trip, if any.
    pub fn confirm_complete(&self) -> Option<LifterRequest> {
        self.clear_busy();
        self.queue.lock().front().cloned()
    }

    /// Drift-corrected status. The physical sensors win over the cache;
    /// with an empty cache the initial state is synthesized from them.
    pub async fn status(&self) -> WcsResult<LifterState> {
        let sensed = self.read_sensor_floor().await?;
        let mut cache = self.state.write().await;
        match (&mut *cache, sensed) {
            (Some(state), Some(floor)) => {
                if state.status == LifterStatus::Idle && state.current_floor != floor {
                    warn!(
                        tower = %self.tower.id,
                        cached = state.current_floor,
                        sensed = floor,
                        "lifter position drift, cache corrected"
                    );
                    state.current_floor = floor;
                }
            }
            (None, Some(floor)) => {
                *cache = Some(LifterState {
                    status: LifterStatus::Idle,
                    current_floor: floor,
                    target_floor: None,
                    assigned_to: None,
                });
            }
            (None, None) => {
                return Err(WcsError::Drift(format!(
                    "lifter {} position unknown, no sensor active",
                    self.tower.id
                )));
            }
            (Some(_), None) => {}
        }
        Ok(cache.clone().ok_or_else(|| {
            WcsError::Internal(format!("lifter {} state missing", self.tower.id))
        })?)
    }

    async fn read_sensor_floor(&self) -> WcsResult<Option<FloorId>> {
        for floor_nodes in &self.tower.floors {
            let tag = pos_tag(&self.tower.id, floor_nodes.floor);
            let value = tokio::time::timeout(
                self.call_timeout,
                self.plc.get_value(&self.tower.id, &tag),
            )
            .await
            .map_err(|_| WcsError::Timeout(format!("PLC read {}", tag)))??;
            if value.as_bool() {
                return Ok(Some(floor_nodes.floor));
            }
        }
        Ok(None)
    }

    fn busy(&self) -> bool {
        let mut busy = self.busy_until.lock();
        match *busy {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *busy = None;
                false
            }
            None => false,
        }
    }

    fn set_busy(&self) {
        *self.busy_until.lock() = Some(Instant::now() + self.busy_ttl);
    }

    fn clear_busy(&self) {
        *self.busy_until.lock() = None;
    }

    /// One processor pass: skip while busy, otherwise serve the next
    /// request end to end.
    pub async fn process_next(&self) -> WcsResult<()> {
        if self.busy() {
            return Ok(());
        }
        let request = match self.queue.lock().pop_front() {
            Some(r) => r,
            None => return Ok(()),
        };
        self.set_busy();

        {
            let mut cache = self.state.write().await;
            let current = cache
                .as_ref()
                .map(|s| s.current_floor)
                .unwrap_or(request.floor);
            *cache = Some(LifterState {
                status: LifterStatus::Moving,
                current_floor: current,
                target_floor: Some(request.floor),
                assigned_to: Some(request.vehicle.clone()),
            });
        }

        let moved = self.drive_to(request.floor).await;
        match moved {
            Ok(()) => {
                {
                    let mut cache = self.state.write().await;
                    *cache = Some(LifterState {
                        status: LifterStatus::Idle,
                        current_floor: request.floor,
                        target_floor: None,
                        assigned_to: None,
                    });
                }
                info!(
                    tower = %self.tower.id,
                    floor = request.floor,
                    vehicle = %request.vehicle,
                    "lifter arrived"
                );
                self.bus.publish_lifter(LifterEvent::LifterArrived {
                    floor: request.floor,
                    vehicle: request.vehicle,
                });
                self.clear_busy();
            }
            Err(err) => {
                // Leave the busy-lock to its TTL; the request retries once
                // the tower frees up.
                warn!(
                    tower = %self.tower.id,
                    floor = request.floor,
                    error = %err,
                    "lifter trip failed, request requeued"
                );
                self.queue.lock().push_front(request);
            }
        }
        Ok(())
    }

    async fn drive_to(&self, floor: FloorId) -> WcsResult<()> {
        let ctrl = ctrl_tag(&self.tower.id, floor);
        tokio::time::timeout(
            self.call_timeout,
            self.plc
                .write_value(&self.tower.id, &ctrl, plc::PlcValue::Bool(true)),
        )
        .await
        .map_err(|_| WcsError::Timeout(format!("PLC write {}", ctrl)))??;

        // Poll the position sensor until the cabin confirms.
        let pos = pos_tag(&self.tower.id, floor);
        let deadline = Instant::now() + self.busy_ttl;
        loop {
            let value = tokio::time::timeout(
                self.call_timeout,
                self.plc.get_value(&self.tower.id, &pos),
            )
            .await
            .map_err(|_| WcsError::Timeout(format!("PLC read {}", pos)))??;
            if value.as_bool() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(WcsError::Timeout(format!(
                    "lifter {} never confirmed floor {}",
                    self.tower.id, floor
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Spawn the processor loop
    pub fn spawn_processor(
        self: Arc<Self>,
        interval: Duration,
        token: CancelToken,
    ) -> JoinHandle<()> {
        let lifter = self;
        spawn_periodic("lifter-processor", interval, token, move || {
            let lifter = Arc::clone(&lifter);
            async move {
                lifter.process_next().await?;
                debug!(tower = %lifter.tower.id, pending = lifter.pending(), "lifter pass");
                Ok(())
            }
        })
    }
}

//! Mission publishing with acknowledgement retry
//!
//! A published mission must be acknowledged by the vehicle within the ack
//! timeout; until then it is re-sent on the retry interval. A timeout is
//! surfaced to the caller, which fails the task, so a mission is never
//! silently dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{WcsError, WcsResult};
use crate::events::{EgressCommand, EventBus, MissionEnvelope};
use crate::types::{TaskId, VehicleId};

/// Publisher with per-mission acknowledgement tracking
pub struct MissionPublisher {
    bus: EventBus,
    pending: DashMap<(VehicleId, TaskId), Arc<Notify>>,
    retry_interval: Duration,
    ack_timeout: Duration,
}

impl MissionPublisher {
    /// Publisher over the event bus
    pub fn new(bus: EventBus, retry_interval: Duration, ack_timeout: Duration) -> Self {
        Self {
            bus,
            pending: DashMap::new(),
            retry_interval,
            ack_timeout,
        }
    }

    /// Publish and re-send until acknowledged or timed out
    pub async fn publish_with_retry(&self, envelope: MissionEnvelope) -> WcsResult<()> {
        let key = (envelope.vehicle.clone(), envelope.task_id);
        let notify = Arc::new(Notify::new());
        self.pending.insert(key.clone(), Arc::clone(&notify));

        let deadline = Instant::now() + self.ack_timeout;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            self.bus.publish(EgressCommand::Mission(envelope.clone()));
            tokio::select! {
                _ = notify.notified() => {
                    debug!(vehicle = %key.0, task = %key.1, attempts, "mission acknowledged");
                    self.pending.remove(&key);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
            if Instant::now() >= deadline {
                self.pending.remove(&key);
                warn!(vehicle = %key.0, task = %key.1, attempts, "mission never acknowledged");
                return Err(WcsError::Timeout(format!(
                    "mission for {} unacknowledged",
                    key.0
                )));
            }
        }
    }

    /// Deliver an acknowledgement from the event stream
    pub fn ack(&self, vehicle: &VehicleId, task: TaskId) {
        if let Some((_, notify)) = self.pending.remove(&(vehicle.clone(), task)) {
            notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OnArrival;
    use crate::types::{NodeId, VehiclePath};

    fn envelope(vehicle: &str, task: TaskId) -> MissionEnvelope {
        MissionEnvelope {
            vehicle: VehicleId::from(vehicle),
            task_id: task,
            path: VehiclePath::empty(),
            on_arrival: OnArrival::TaskComplete,
            segment: 1,
            final_target_node: NodeId::from("B"),
            final_target_floor: 1,
            pickup_node_qr: None,
            end_node_qr: None,
            item_info: serde_json::Value::Null,
            is_carrying: false,
            running_path_simulation: vec![],
        }
    }

    fn publisher(retry_ms: u64, timeout_ms: u64) -> (Arc<MissionPublisher>, EventBus) {
        let (bus, _rx) = EventBus::new(64);
        (
            Arc::new(MissionPublisher::new(
                bus.clone(),
                Duration::from_millis(retry_ms),
                Duration::from_millis(timeout_ms),
            )),
            bus,
        )
    }

    #[tokio::test]
    async fn ack_completes_the_publish() {
        let (publisher, bus) = publisher(20, 500);
        let task = TaskId::next();
        let mut egress = bus.subscribe_egress();

        let background = Arc::clone(&publisher);
        let handle =
            tokio::spawn(async move { background.publish_with_retry(envelope("S1", task)).await });

        // The vehicle sees the mission and acknowledges.
        let _ = egress.recv().await.unwrap();
        publisher.ack(&VehicleId::from("S1"), task);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unacknowledged_mission_times_out_after_retries() {
        let (publisher, bus) = publisher(10, 60);
        let task = TaskId::next();
        let mut egress = bus.subscribe_egress();

        let result = publisher.publish_with_retry(envelope("S1", task)).await;
        assert!(matches!(result, Err(WcsError::Timeout(_))));

        // Several retries reached the wire.
        let mut seen = 0;
        while egress.try_recv().is_ok() {
            seen += 1;
        }
        assert!(seen >= 2);
    }

    #[tokio::test]
    async fn ack_for_an_unknown_mission_is_ignored() {
        let (publisher, _bus) = publisher(10, 50);
        publisher.ack(&VehicleId::from("S9"), TaskId::next());
    }
}

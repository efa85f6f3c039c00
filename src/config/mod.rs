//! Configuration management
//!
//! One frozen [`AppConfig`] is built at startup and injected into every
//! component. Every loop cadence, lease and penalty constant lives here so
//! the schedule of the whole engine is declared in one place.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{WcsError, WcsResult};
use crate::types::{FloorId, NodeId};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a TOML file, applying `WCS_`-prefixed
    /// environment overrides (`WCS_SERVICE__LISTEN_ADDR=...`).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> WcsResult<AppConfig> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("WCS").separator("__"))
            .build()
            .map_err(|e| WcsError::Config(e.to_string()))?;
        let cfg: AppConfig = settings
            .try_deserialize()
            .map_err(|e| WcsError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load defaults plus environment overrides only
    pub fn load_from_env() -> WcsResult<AppConfig> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("WCS").separator("__"))
            .build()
            .map_err(|e| WcsError::Config(e.to_string()))?;
        let mut cfg = AppConfig::default();
        if let Ok(level) = settings.get_string("logging.level") {
            cfg.logging.level = level;
        }
        if let Ok(addr) = settings.get_string("service.listen_addr") {
            cfg.service.listen_addr = addr;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Service identity and network
    pub service: ServiceConfig,
    /// Logging
    pub logging: LoggingConfig,
    /// Loop cadences, leases and TTLs
    pub timing: TimingConfig,
    /// Shuttle pathfinder penalty table
    pub traffic: TrafficConfig,
    /// Conflict-resolution tiers and waits
    pub conflict: ConflictConfig,
    /// Lifter towers
    pub lifter: LifterConfig,
    /// AMR pollers and executor
    pub amr: AmrConfig,
}

impl AppConfig {
    /// Validate configuration
    pub fn validate(&self) -> WcsResult<()> {
        self.service.validate()?;
        self.timing.validate()?;
        self.traffic.validate()?;
        self.conflict.validate()?;
        self.lifter.validate()?;
        self.amr.validate()?;
        Ok(())
    }
}

/// Service identity and network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, used in log fields
    pub name: String,
    /// HTTP listen address
    pub listen_addr: String,
    /// Deadline for every external call (PLC, AMR endpoints)
    pub external_call_timeout_secs: u64,
    /// Ingress queue capacity between transport and router
    pub ingress_queue_capacity: usize,
}

impl ServiceConfig {
    fn validate(&self) -> WcsResult<()> {
        if self.name.is_empty() {
            return Err(WcsError::Config("service.name must not be empty".into()));
        }
        if self.external_call_timeout_secs == 0 {
            return Err(WcsError::Config(
                "service.external_call_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "warefleet".into(),
            listen_addr: "0.0.0.0:8080".into(),
            external_call_timeout_secs: 5,
            ingress_queue_capacity: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Env-filter directive, e.g. `info` or `warefleet=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Loop cadences, leases and TTLs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Staging scheduler tick
    pub staging_tick_secs: u64,
    /// Dispatcher pull interval
    pub dispatch_tick_secs: u64,
    /// Lifter processor pass interval, milliseconds
    pub lifter_tick_ms: u64,
    /// Path cache cleaner interval
    pub path_cleaner_interval_secs: u64,
    /// Row lock sweeper interval
    pub row_sweeper_interval_secs: u64,
    /// Deadlock detector interval
    pub deadlock_interval_secs: u64,
    /// Node occupation lease
    pub occupation_lease_secs: u64,
    /// Active path TTL in the cache
    pub path_ttl_secs: u64,
    /// Row direction lock idle expiry
    pub row_lock_idle_secs: u64,
    /// Row direction lock stale sweep threshold
    pub row_lock_stale_secs: u64,
    /// Batch row assignment retention
    pub batch_row_ttl_secs: u64,
    /// End-node allocation lock TTL
    pub endnode_lock_ttl_secs: u64,
    /// Pickup lock TTL
    pub pickup_lock_ttl_secs: u64,
    /// Mission publish retry interval
    pub publish_retry_interval_ms: u64,
    /// Mission acknowledgement timeout
    pub publish_ack_timeout_secs: u64,
}

impl TimingConfig {
    fn validate(&self) -> WcsResult<()> {
        let cadences = [
            ("timing.staging_tick_secs", self.staging_tick_secs),
            ("timing.path_cleaner_interval_secs", self.path_cleaner_interval_secs),
            ("timing.row_sweeper_interval_secs", self.row_sweeper_interval_secs),
            ("timing.deadlock_interval_secs", self.deadlock_interval_secs),
            ("timing.occupation_lease_secs", self.occupation_lease_secs),
            ("timing.path_ttl_secs", self.path_ttl_secs),
        ];
        for (name, value) in cadences {
            if value == 0 {
                return Err(WcsError::Config(format!("{} must be > 0", name)));
            }
        }
        if self.row_lock_stale_secs < self.row_lock_idle_secs {
            return Err(WcsError::Config(
                "timing.row_lock_stale_secs must be >= timing.row_lock_idle_secs".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            staging_tick_secs: 5,
            dispatch_tick_secs: 2,
            lifter_tick_ms: 500,
            path_cleaner_interval_secs: 30,
            row_sweeper_interval_secs: 60,
            deadlock_interval_secs: 30,
            occupation_lease_secs: 300,
            path_ttl_secs: 600,
            row_lock_idle_secs: 300,
            row_lock_stale_secs: 600,
            batch_row_ttl_secs: 3600,
            endnode_lock_ttl_secs: 3600,
            pickup_lock_ttl_secs: 1800,
            publish_retry_interval_ms: 500,
            publish_ack_timeout_secs: 30,
        }
    }
}

/// Additive penalty table for the shuttle pathfinder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Destination node owned by another vehicle
    pub occupied_soft_avoid: f64,
    /// Head-on against another active path
    pub head_on_base: f64,
    /// Extra when exactly one side carries
    pub head_on_vs_carrier: f64,
    /// Extra when both sides carry
    pub head_on_both_carrying: f64,
    /// Travelling with the flow, empty
    pub with_flow_empty: f64,
    /// Travelling with the flow, carrying
    pub with_flow_carrying: f64,
    /// Crossing another active path
    pub cross_base: f64,
    /// Extra crossing penalty when either side carries
    pub cross_carrying_extra: f64,
    /// Against the corridor's dominant direction
    pub corridor_against: f64,
    /// Against dominant on a high-traffic node
    pub corridor_against_high: f64,
    /// With the dominant direction
    pub corridor_with: f64,
    /// With dominant on a high-traffic node
    pub corridor_with_high: f64,
    /// Crossing the dominant direction
    pub corridor_cross: f64,
    /// Crossing dominant on a high-traffic node
    pub corridor_cross_high: f64,
    /// Vehicles required before a node counts as a corridor
    pub corridor_min_vehicles: usize,
    /// Share one direction must hold on a corridor node
    pub corridor_dominant_share: f64,
    /// Vehicles required before a corridor counts as high-traffic
    pub corridor_high_traffic_vehicles: usize,
}

impl TrafficConfig {
    fn validate(&self) -> WcsResult<()> {
        if !(0.5..=1.0).contains(&self.corridor_dominant_share) {
            return Err(WcsError::Config(
                "traffic.corridor_dominant_share must be within [0.5, 1.0]".into(),
            ));
        }
        if self.corridor_min_vehicles == 0 {
            return Err(WcsError::Config(
                "traffic.corridor_min_vehicles must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            occupied_soft_avoid: 100.0,
            head_on_base: 150.0,
            head_on_vs_carrier: 30.0,
            head_on_both_carrying: 50.0,
            with_flow_empty: 5.0,
            with_flow_carrying: 8.0,
            cross_base: 15.0,
            cross_carrying_extra: 5.0,
            corridor_against: 180.0,
            corridor_against_high: 250.0,
            corridor_with: 12.0,
            corridor_with_high: 25.0,
            corridor_cross: 35.0,
            corridor_cross_high: 60.0,
            corridor_min_vehicles: 2,
            corridor_dominant_share: 0.7,
            corridor_high_traffic_vehicles: 3,
        }
    }
}

/// Conflict-resolution tiers and wait escalation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// T1 limit for a carrying vehicle, percent of the original path length
    pub t1_carrying_pct: u32,
    /// T1 limit for an empty vehicle
    pub t1_empty_pct: u32,
    /// T2: percent added per reroute retry
    pub retry_step_pct: u32,
    /// T3: wait seconds per escalation step
    pub wait_step_secs: u64,
    /// T3: percent added per wait step
    pub wait_step_pct: u32,
    /// Cap for T2/T3
    pub max_pct: u32,
    /// Wait beyond this forces an any-cost Emergency reroute
    pub emergency_wait_secs: u64,
    /// Initial wait-in-place delay
    pub initial_wait_secs: u64,
    /// Wait-in-place retry interval
    pub retry_interval_secs: u64,
    /// Maximum backtrack depth along the original path
    pub max_backtrack_steps: usize,
    /// Manhattan radius of the parking search
    pub parking_max_distance: i32,
    /// Parking reservation TTL
    pub parking_ttl_secs: u64,
}

impl ConflictConfig {
    fn validate(&self) -> WcsResult<()> {
        if self.t1_carrying_pct < 100 || self.t1_empty_pct < 100 {
            return Err(WcsError::Config(
                "conflict tier limits must be >= 100 percent".into(),
            ));
        }
        if self.wait_step_secs == 0 {
            return Err(WcsError::Config("conflict.wait_step_secs must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            t1_carrying_pct: 140,
            t1_empty_pct: 200,
            retry_step_pct: 50,
            wait_step_secs: 15,
            wait_step_pct: 50,
            max_pct: 500,
            emergency_wait_secs: 45,
            initial_wait_secs: 5,
            retry_interval_secs: 15,
            max_backtrack_steps: 5,
            parking_max_distance: 3,
            parking_ttl_secs: 300,
        }
    }
}

/// Well-known lifter nodes on one floor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifterFloorNodes {
    /// Floor id
    pub floor: FloorId,
    /// Node a shuttle stops at to enter the cabin
    pub entry_node: String,
    /// Node a shuttle stands on when leaving the cabin
    pub exit_node: String,
}

/// One physical lifter tower
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifterTowerConfig {
    /// Tower id, also the PLC unit prefix
    pub id: String,
    /// Entry/exit nodes per floor
    pub floors: Vec<LifterFloorNodes>,
}

impl LifterTowerConfig {
    /// Entry node on a floor, if configured
    pub fn entry_node(&self, floor: FloorId) -> Option<NodeId> {
        self.floors
            .iter()
            .find(|f| f.floor == floor)
            .map(|f| NodeId::new(f.entry_node.clone()))
    }

    /// Exit node on a floor, if configured
    pub fn exit_node(&self, floor: FloorId) -> Option<NodeId> {
        self.floors
            .iter()
            .find(|f| f.floor == floor)
            .map(|f| NodeId::new(f.exit_node.clone()))
    }
}

/// Lifter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifterConfig {
    /// Physical towers; one coordinator instance each
    pub towers: Vec<LifterTowerConfig>,
    /// Busy-lock safety TTL while a trip is in flight
    pub busy_ttl_secs: u64,
}

impl LifterConfig {
    fn validate(&self) -> WcsResult<()> {
        for tower in &self.towers {
            if tower.floors.is_empty() {
                return Err(WcsError::Config(format!(
                    "lifter tower {} has no floor nodes",
                    tower.id
                )));
            }
        }
        Ok(())
    }

    /// The single tower of a one-lifter deployment
    pub fn primary(&self) -> Option<&LifterTowerConfig> {
        self.towers.first()
    }
}

impl Default for LifterConfig {
    fn default() -> Self {
        Self {
            towers: vec![LifterTowerConfig {
                id: "LIFTER_1".into(),
                floors: vec![
                    LifterFloorNodes {
                        floor: 1,
                        entry_node: "LF1-IN".into(),
                        exit_node: "LF1-OUT".into(),
                    },
                    LifterFloorNodes {
                        floor: 2,
                        entry_node: "LF2-IN".into(),
                        exit_node: "LF2-OUT".into(),
                    },
                ],
            }],
            busy_ttl_secs: 60,
        }
    }
}

/// AMR poller cadences and executor pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmrConfig {
    /// Location poll cadence
    pub location_poll_secs: u64,
    /// Battery poll cadence
    pub battery_poll_secs: u64,
    /// Cargo poll cadence
    pub cargo_poll_secs: u64,
    /// Status poll cadence
    pub status_poll_secs: u64,
    /// Sensors poll cadence
    pub sensors_poll_secs: u64,
    /// Delay between progress steps of the fire-and-forget executor
    pub inter_step_delay_secs: u64,
}

impl AmrConfig {
    fn validate(&self) -> WcsResult<()> {
        let cadences = [
            ("amr.location_poll_secs", self.location_poll_secs),
            ("amr.battery_poll_secs", self.battery_poll_secs),
            ("amr.cargo_poll_secs", self.cargo_poll_secs),
            ("amr.status_poll_secs", self.status_poll_secs),
            ("amr.sensors_poll_secs", self.sensors_poll_secs),
        ];
        for (name, value) in cadences {
            if value == 0 {
                return Err(WcsError::Config(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

impl Default for AmrConfig {
    fn default() -> Self {
        Self {
            location_poll_secs: 1,
            battery_poll_secs: 5,
            cargo_poll_secs: 3,
            status_poll_secs: 2,
            sensors_poll_secs: 2,
            inter_step_delay_secs: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_cadence_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.timing.staging_tick_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dominant_share_bounds_are_enforced() {
        let mut cfg = AppConfig::default();
        cfg.traffic.corridor_dominant_share = 0.3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn lifter_tower_lookup() {
        let cfg = LifterConfig::default();
        let tower = cfg.primary().unwrap();
        assert_eq!(tower.entry_node(1), Some(NodeId::from("LF1-IN")));
        assert_eq!(tower.exit_node(2), Some(NodeId::from("LF2-OUT")));
        assert_eq!(tower.entry_node(9), None);
    }
}

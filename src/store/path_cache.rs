//! Path cache and traffic map
//!
//! Holds the rich active path per vehicle plus metadata, and derives the
//! traffic model the shuttle pathfinder prices edges with: per-node flows
//! and corridor classification (≥ 2 vehicles with a ≥ 70 % dominant
//! direction; high-traffic at ≥ 3 vehicles). A background cleaner drops
//! paths whose metadata age exceeds their TTL.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::concurrency::{spawn_periodic, CancelToken};
use crate::config::TrafficConfig;
use crate::graph::topo::{Corridor, Flow, TrafficView};
use crate::types::{Direction, NodeId, VehicleId, VehiclePath};

/// Metadata stored alongside a path
#[derive(Debug, Clone, PartialEq)]
pub struct PathMetadata {
    /// Pallet on board while driving this path
    pub carrying: bool,
    /// Priority score at save time
    pub priority: i64,
    /// Save timestamp
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: VehiclePath,
    metadata: PathMetadata,
    expires_at: Instant,
}

/// An active path with its metadata
#[derive(Debug, Clone)]
pub struct ActivePath {
    /// Driving vehicle
    pub vehicle: VehicleId,
    /// The committed path
    pub path: VehiclePath,
    /// Save-time metadata
    pub metadata: PathMetadata,
}

/// Active-path store and traffic model source
pub struct PathCache {
    entries: DashMap<VehicleId, CacheEntry>,
    default_ttl: Duration,
}

impl PathCache {
    /// Cache with the default path TTL
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    /// Store a vehicle's path, replacing any previous one
    pub fn save_path(
        &self,
        vehicle: &VehicleId,
        path: VehiclePath,
        carrying: bool,
        priority: i64,
        ttl: Option<Duration>,
    ) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.entries.insert(
            vehicle.clone(),
            CacheEntry {
                path,
                metadata: PathMetadata {
                    carrying,
                    priority,
                    saved_at: Utc::now(),
                },
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop a vehicle's path and metadata
    pub fn delete_path(&self, vehicle: &VehicleId) {
        self.entries.remove(vehicle);
    }

    /// A vehicle's live path
    pub fn get_path(&self, vehicle: &VehicleId) -> Option<ActivePath> {
        let entry = self.entries.get(vehicle)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(ActivePath {
            vehicle: vehicle.clone(),
            path: entry.path.clone(),
            metadata: entry.metadata.clone(),
        })
    }

    /// All live paths
    pub fn active_paths(&self) -> Vec<ActivePath> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.value().expires_at > now)
            .map(|e| ActivePath {
                vehicle: e.key().clone(),
                path: e.value().path.clone(),
                metadata: e.value().metadata.clone(),
            })
            .collect()
    }

    /// Nodes covered by live paths, optionally excluding one vehicle
    pub fn nodes_in_paths(&self, exclude: Option<&VehicleId>) -> HashSet<NodeId> {
        self.active_paths()
            .into_iter()
            .filter(|p| exclude.map_or(true, |v| &p.vehicle != v))
            .flat_map(|p| p.path.node_ids())
            .collect()
    }

    /// Whether a node lies on any live path (excluding one vehicle)
    pub fn is_node_in_any_path(&self, node: &NodeId, exclude: Option<&VehicleId>) -> bool {
        self.nodes_in_paths(exclude).contains(node)
    }

    /// Build the traffic model for the pathfinder
    pub fn traffic_view(&self, cfg: &TrafficConfig) -> TrafficView {
        let mut flows: HashMap<NodeId, Vec<Flow>> = HashMap::new();
        let mut vehicles_at: HashMap<NodeId, HashSet<VehicleId>> = HashMap::new();
        let mut histogram: HashMap<NodeId, HashMap<Direction, usize>> = HashMap::new();

        for active in self.active_paths() {
            for step in &active.path.steps {
                flows.entry(step.node.clone()).or_default().push(Flow {
                    vehicle: active.vehicle.clone(),
                    direction: Some(step.direction),
                    carrying: active.metadata.carrying,
                });
                vehicles_at
                    .entry(step.node.clone())
                    .or_default()
                    .insert(active.vehicle.clone());
                *histogram
                    .entry(step.node.clone())
                    .or_default()
                    .entry(step.direction)
                    .or_insert(0) += 1;
            }
        }

        let mut corridors = HashMap::new();
        for (node, vehicles) in &vehicles_at {
            if vehicles.len() < cfg.corridor_min_vehicles {
                continue;
            }
            let counts = &histogram[node];
            let total: usize = counts.values().sum();
            if total == 0 {
                continue;
            }
            let (&dominant, &dominant_count) =
                match counts.iter().max_by_key(|(_, &count)| count) {
                    Some(best) => best,
                    None => continue,
                };
            if (dominant_count as f64) / (total as f64) >= cfg.corridor_dominant_share {
                corridors.insert(
                    node.clone(),
                    Corridor {
                        dominant,
                        high_traffic: vehicles.len() >= cfg.corridor_high_traffic_vehicles,
                    },
                );
            }
        }

        TrafficView { flows, corridors }
    }

    /// Spawn the 30 s cleaner loop
    pub fn spawn_cleaner(
        self: Arc<Self>,
        interval: Duration,
        token: CancelToken,
    ) -> JoinHandle<()> {
        let cache = self;
        spawn_periodic("path-cache-cleaner", interval, token, move || {
            let cache = Arc::clone(&cache);
            async move {
                let now = Instant::now();
                let before = cache.entries.len();
                cache.entries.retain(|_, e| e.expires_at > now);
                let dropped = before - cache.entries.len();
                if dropped > 0 {
                    debug!(dropped, "expired paths cleaned");
                }
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PathStep, StepAction};

    fn step(id: &str, direction: Direction) -> PathStep {
        PathStep {
            node: NodeId::from(id),
            direction,
            action: StepAction::NoAction,
        }
    }

    fn cache() -> PathCache {
        PathCache::new(Duration::from_secs(600))
    }

    #[test]
    fn save_then_fetch_compares_equal() {
        let c = cache();
        let v = VehicleId::from("S1");
        let path = VehiclePath::new(vec![
            step("A", Direction::Right),
            step("B", Direction::Right),
        ]);
        c.save_path(&v, path.clone(), true, 42, None);

        let fetched = c.get_path(&v).unwrap();
        assert_eq!(fetched.path, path);
        assert!(fetched.metadata.carrying);
        assert_eq!(fetched.metadata.priority, 42);
    }

    #[test]
    fn delete_removes_path_and_metadata() {
        let c = cache();
        let v = VehicleId::from("S1");
        c.save_path(&v, VehiclePath::new(vec![step("A", Direction::Up)]), false, 0, None);
        c.delete_path(&v);
        assert!(c.get_path(&v).is_none());
        assert!(c.active_paths().is_empty());
    }

    #[test]
    fn corridor_requires_two_vehicles_and_dominance() {
        let c = cache();
        let cfg = TrafficConfig::default();
        c.save_path(
            &VehicleId::from("S1"),
            VehiclePath::new(vec![step("X", Direction::Right)]),
            false,
            0,
            None,
        );
        // One vehicle only: not a corridor.
        assert!(c.traffic_view(&cfg).corridors.is_empty());

        c.save_path(
            &VehicleId::from("S2"),
            VehiclePath::new(vec![step("X", Direction::Right)]),
            false,
            0,
            None,
        );
        let view = c.traffic_view(&cfg);
        let corridor = view.corridors.get(&NodeId::from("X")).unwrap();
        assert_eq!(corridor.dominant, Direction::Right);
        assert!(!corridor.high_traffic);
    }

    #[test]
    fn high_traffic_needs_three_vehicles() {
        let c = cache();
        let cfg = TrafficConfig::default();
        for id in ["S1", "S2", "S3"] {
            c.save_path(
                &VehicleId::from(id),
                VehiclePath::new(vec![step("X", Direction::Left)]),
                false,
                0,
                None,
            );
        }
        let view = c.traffic_view(&cfg);
        assert!(view.corridors.get(&NodeId::from("X")).unwrap().high_traffic);
    }

    #[test]
    fn split_directions_are_not_a_corridor() {
        let c = cache();
        let cfg = TrafficConfig::default();
        c.save_path(
            &VehicleId::from("S1"),
            VehiclePath::new(vec![step("X", Direction::Right)]),
            false,
            0,
            None,
        );
        c.save_path(
            &VehicleId::from("S2"),
            VehiclePath::new(vec![step("X", Direction::Left)]),
            false,
            0,
            None,
        );
        // 50/50 split never reaches the 70 % dominance bar.
        assert!(c.traffic_view(&cfg).corridors.is_empty());
    }

    #[test]
    fn expired_paths_vanish_from_the_traffic_model() {
        let c = cache();
        let v = VehicleId::from("S1");
        c.save_path(
            &v,
            VehiclePath::new(vec![step("A", Direction::Up)]),
            false,
            0,
            Some(Duration::from_millis(10)),
        );
        std::thread::sleep(Duration::from_millis(15));
        assert!(c.get_path(&v).is_none());
        assert!(c.nodes_in_paths(None).is_empty());
    }
}

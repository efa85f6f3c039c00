//! Floor graphs and pathfinding
//!
//! One [`FloorGraph`] per floor, loaded once through the [`MapCatalog`]
//! seam and immutable at runtime. Two search modes sit on top:
//! - [`astar`]: metric A* for AMRs (Euclidean heuristic, geometric costs);
//! - [`topo`]: weighted topological search for shuttles with traffic,
//!   corridor and row-direction penalties.

pub mod astar;
pub mod topo;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{WcsError, WcsResult};
use crate::types::{Direction, Edge, FloorId, Node, NodeId};

/// Immutable graph of one floor
#[derive(Debug, Clone, Default)]
pub struct FloorGraph {
    nodes: HashMap<NodeId, Node>,
    adjacency: HashMap<NodeId, Vec<(NodeId, f64)>>,
}

impl FloorGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node
    pub fn add_node(&mut self, node: Node) {
        self.adjacency.entry(node.id.clone()).or_default();
        self.nodes.insert(node.id.clone(), node);
    }

    /// Insert an undirected edge between two existing nodes. Distance is
    /// computed from node centers when not supplied by the catalog.
    pub fn add_edge(&mut self, a: &NodeId, b: &NodeId) -> WcsResult<()> {
        let (na, nb) = match (self.nodes.get(a), self.nodes.get(b)) {
            (Some(na), Some(nb)) => (na, nb),
            (None, _) => return Err(WcsError::NodeNotFound(a.to_string())),
            (_, None) => return Err(WcsError::NodeNotFound(b.to_string())),
        };
        if na.floor != nb.floor {
            return Err(WcsError::Validation(format!(
                "edge {}-{} spans floors {} and {}",
                a, b, na.floor, nb.floor
            )));
        }
        let distance = na.euclidean(nb);
        self.adjacency
            .entry(a.clone())
            .or_default()
            .push((b.clone(), distance));
        self.adjacency
            .entry(b.clone())
            .or_default()
            .push((a.clone(), distance));
        Ok(())
    }

    /// Look up a node
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Neighbours with geometric distances
    pub fn neighbors(&self, id: &NodeId) -> &[(NodeId, f64)] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All nodes of the floor
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the floor has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direction of travel from `a` to `b` on the 4-neighbour grid
    pub fn step_direction(&self, a: &NodeId, b: &NodeId) -> Option<Direction> {
        let na = self.nodes.get(a)?;
        let nb = self.nodes.get(b)?;
        Direction::from_delta(nb.col - na.col, nb.row - na.row)
    }

    /// Nodes of a given row, column-ascending
    pub fn row_nodes(&self, row: i32) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().filter(|n| n.row == row).collect();
        nodes.sort_by_key(|n| n.col);
        nodes
    }
}

/// All floors of the warehouse
#[derive(Debug, Clone, Default)]
pub struct WarehouseMap {
    floors: HashMap<FloorId, FloorGraph>,
}

impl WarehouseMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a floor graph
    pub fn add_floor(&mut self, floor: FloorId, graph: FloorGraph) {
        self.floors.insert(floor, graph);
    }

    /// Graph of a floor
    pub fn floor(&self, floor: FloorId) -> WcsResult<&FloorGraph> {
        self.floors
            .get(&floor)
            .ok_or_else(|| WcsError::MapLoad(format!("floor {} not loaded", floor)))
    }

    /// Find a node on any floor
    pub fn locate(&self, id: &NodeId) -> Option<(FloorId, &Node)> {
        self.floors
            .iter()
            .find_map(|(floor, g)| g.node(id).map(|n| (*floor, n)))
    }

    /// Loaded floor ids
    pub fn floor_ids(&self) -> Vec<FloorId> {
        let mut ids: Vec<FloorId> = self.floors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Seam to the external map catalog (relational DB in production; a JSON
/// file for the binary and tests)
#[async_trait]
pub trait MapCatalog: Send + Sync {
    /// Load every floor once at startup. Failure is fatal.
    async fn load(&self) -> WcsResult<WarehouseMap>;
}

#[derive(Debug, Deserialize)]
struct MapFileEdge {
    a: String,
    b: String,
}

#[derive(Debug, Deserialize)]
struct MapFile {
    nodes: Vec<Node>,
    edges: Vec<MapFileEdge>,
}

/// JSON-file map catalog
pub struct JsonMapCatalog {
    path: PathBuf,
}

impl JsonMapCatalog {
    /// Catalog backed by a JSON file
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl MapCatalog for JsonMapCatalog {
    async fn load(&self) -> WcsResult<WarehouseMap> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| WcsError::MapLoad(format!("{}: {}", self.path.display(), e)))?;
        let file: MapFile =
            serde_json::from_str(&raw).map_err(|e| WcsError::MapLoad(e.to_string()))?;

        let mut map = WarehouseMap::new();
        let mut floors: HashMap<FloorId, FloorGraph> = HashMap::new();
        for node in file.nodes {
            floors.entry(node.floor).or_default().add_node(node);
        }
        for edge in &file.edges {
            let a = NodeId::new(edge.a.clone());
            let b = NodeId::new(edge.b.clone());
            let floor = floors
                .iter_mut()
                .find(|(_, g)| g.node(&a).is_some())
                .ok_or_else(|| WcsError::MapLoad(format!("edge endpoint {} unknown", a)))?;
            floor.1.add_edge(&a, &b).map_err(|e| WcsError::MapLoad(e.to_string()))?;
        }
        for (floor, graph) in floors {
            map.add_floor(floor, graph);
        }
        if map.floor_ids().is_empty() {
            return Err(WcsError::MapLoad("catalog contains no floors".into()));
        }
        Ok(map)
    }
}

/// Edges materialized for diagnostics and tests
pub fn edges_of(graph: &FloorGraph) -> Vec<Edge> {
    let mut seen = std::collections::HashSet::new();
    let mut edges = Vec::new();
    for node in graph.nodes() {
        for (other, distance) in graph.neighbors(&node.id) {
            let key = if node.id <= *other {
                (node.id.clone(), other.clone())
            } else {
                (other.clone(), node.id.clone())
            };
            if seen.insert(key.clone()) {
                edges.push(Edge {
                    a: key.0,
                    b: key.1,
                    distance: *distance,
                });
            }
        }
    }
    edges
}

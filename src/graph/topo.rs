//! Topological weighted search for shuttles
//!
//! Edge base cost is 1. Traffic, corridor and occupation penalties are
//! composed additively per edge; entering a row against its one-way lock
//! excludes the edge outright. The fallback chain relaxes the avoid set
//! first and penalties last:
//!
//! 1. soft-avoid + traffic + corridor;
//! 2. same, with the explicit avoid list dropped;
//! 3. direct base-cost search.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::FloorGraph;
use crate::config::TrafficConfig;
use crate::types::{Direction, Node, NodeId, PathStep, StepAction, VehicleId, VehiclePath};

/// One vehicle's traversal of a node, taken from its active path
#[derive(Debug, Clone)]
pub struct Flow {
    /// Traversing vehicle
    pub vehicle: VehicleId,
    /// Direction it moves through the node; `None` on the path's last node
    pub direction: Option<Direction>,
    /// Whether it carries a pallet
    pub carrying: bool,
}

/// Corridor classification of a node
#[derive(Debug, Clone, Copy)]
pub struct Corridor {
    /// Direction holding the dominant share of traversals
    pub dominant: Direction,
    /// Three or more vehicles traverse the node
    pub high_traffic: bool,
}

/// Traffic model built from all active paths
#[derive(Debug, Clone, Default)]
pub struct TrafficView {
    /// Per-node traversals
    pub flows: HashMap<NodeId, Vec<Flow>>,
    /// Detected corridors
    pub corridors: HashMap<NodeId, Corridor>,
}

/// Inputs of one shuttle path search
pub struct ShuttleSearchRequest<'a> {
    /// Searching vehicle; its own flows and occupations are ignored
    pub vehicle: &'a VehicleId,
    /// Whether it carries a pallet
    pub carrying: bool,
    /// Nodes to treat as impassable (dropped on fallback)
    pub avoid: HashSet<NodeId>,
    /// Current node owners from the occupation store
    pub occupied: HashMap<NodeId, VehicleId>,
    /// Traffic model
    pub traffic: &'a TrafficView,
    /// Penalty table
    pub cfg: &'a TrafficConfig,
    /// Row one-way gate: `(row, direction) -> allowed`
    pub row_permit: Option<&'a (dyn Fn(i32, Direction) -> bool + Send + Sync)>,
    /// Action annotated on the final edge
    pub last_action: StepAction,
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Full,
    NoAvoid,
    Direct,
}

#[derive(Debug)]
struct Frontier {
    f: f64,
    h: f64,
    node: NodeId,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f && self.h == other.h
    }
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.h.total_cmp(&self.h))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Find a shuttle path with the full fallback chain. Returns `None` only
/// when even the direct search fails.
pub fn find_shuttle_path(
    graph: &FloorGraph,
    start: &NodeId,
    goal: &NodeId,
    req: &ShuttleSearchRequest<'_>,
) -> Option<VehiclePath> {
    for mode in [Mode::Full, Mode::NoAvoid, Mode::Direct] {
        if mode == Mode::NoAvoid && req.avoid.is_empty() {
            continue;
        }
        if let Some(nodes) = weighted_search(graph, start, goal, req, mode) {
            return Some(build_path(graph, &nodes, req.last_action));
        }
    }
    None
}

/// Single-mode search without fallback; used by the conflict resolver to
/// probe a constrained reroute before relaxing anything.
pub fn find_constrained_path(
    graph: &FloorGraph,
    start: &NodeId,
    goal: &NodeId,
    req: &ShuttleSearchRequest<'_>,
) -> Option<VehiclePath> {
    weighted_search(graph, start, goal, req, Mode::Full)
        .map(|nodes| build_path(graph, &nodes, req.last_action))
}

fn weighted_search(
    graph: &FloorGraph,
    start: &NodeId,
    goal: &NodeId,
    req: &ShuttleSearchRequest<'_>,
    mode: Mode,
) -> Option<Vec<NodeId>> {
    let goal_node = graph.node(goal)?;
    graph.node(start)?;
    if goal_node.blocked {
        return None;
    }
    if start == goal {
        return Some(vec![start.clone()]);
    }

    let mut open = BinaryHeap::new();
    let mut g_score: HashMap<NodeId, f64> = HashMap::new();
    let mut came_from: HashMap<NodeId, NodeId> = HashMap::new();

    let h0 = manhattan(graph, start, goal_node);
    g_score.insert(start.clone(), 0.0);
    open.push(Frontier {
        f: h0,
        h: h0,
        node: start.clone(),
    });

    while let Some(Frontier { node, .. }) = open.pop() {
        if node == *goal {
            let mut path = vec![goal.clone()];
            let mut cursor = goal;
            while let Some(prev) = came_from.get(cursor) {
                path.push(prev.clone());
                cursor = prev;
            }
            path.reverse();
            return Some(path);
        }
        let current_g = g_score[&node];

        for (neighbor, _) in graph.neighbors(&node) {
            let n = match graph.node(neighbor) {
                Some(n) if !n.blocked => n,
                _ => continue,
            };
            if mode == Mode::Full && neighbor != goal && req.avoid.contains(neighbor) {
                continue;
            }
            let direction = graph.step_direction(&node, neighbor);

            // Row one-way locks make the edge impassable, not expensive.
            if mode != Mode::Direct {
                if let (Some(permit), Some(d)) = (req.row_permit, direction) {
                    if matches!(d, Direction::Left | Direction::Right) && !permit(n.row, d) {
                        continue;
                    }
                }
            }

            let penalty = if mode == Mode::Direct {
                0.0
            } else {
                edge_penalty(req, n, direction)
            };
            let tentative = current_g + 1.0 + penalty;
            if g_score
                .get(neighbor)
                .map_or(true, |&known| tentative < known)
            {
                g_score.insert(neighbor.clone(), tentative);
                came_from.insert(neighbor.clone(), node.clone());
                let h = manhattan(graph, neighbor, goal_node);
                open.push(Frontier {
                    f: tentative + h,
                    h,
                    node: neighbor.clone(),
                });
            }
        }
    }
    None
}

fn manhattan(graph: &FloorGraph, id: &NodeId, goal: &Node) -> f64 {
    graph
        .node(id)
        .map(|n| f64::from(n.manhattan(goal)))
        .unwrap_or(0.0)
}

/// Additive penalty for entering `node` with direction `d`
fn edge_penalty(req: &ShuttleSearchRequest<'_>, node: &Node, d: Option<Direction>) -> f64 {
    let cfg = req.cfg;
    let mut penalty = 0.0;

    if let Some(owner) = req.occupied.get(&node.id) {
        if owner != req.vehicle {
            penalty += cfg.occupied_soft_avoid;
        }
    }

    let d = match d {
        Some(d) => d,
        None => return penalty,
    };

    if let Some(flows) = req.traffic.flows.get(&node.id) {
        for flow in flows.iter().filter(|f| &f.vehicle != req.vehicle) {
            match flow.direction {
                Some(fd) if fd == d.opposite() => {
                    penalty += cfg.head_on_base;
                    if req.carrying && flow.carrying {
                        penalty += cfg.head_on_both_carrying;
                    } else if req.carrying || flow.carrying {
                        penalty += cfg.head_on_vs_carrier;
                    }
                }
                Some(fd) if fd == d => {
                    penalty += if req.carrying {
                        cfg.with_flow_carrying
                    } else {
                        cfg.with_flow_empty
                    };
                }
                Some(fd) if fd.crosses(d) => {
                    penalty += cfg.cross_base;
                    if req.carrying || flow.carrying {
                        penalty += cfg.cross_carrying_extra;
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(corridor) = req.traffic.corridors.get(&node.id) {
        let (against, with, cross) = if corridor.high_traffic {
            (
                cfg.corridor_against_high,
                cfg.corridor_with_high,
                cfg.corridor_cross_high,
            )
        } else {
            (cfg.corridor_against, cfg.corridor_with, cfg.corridor_cross)
        };
        if d == corridor.dominant.opposite() {
            penalty += against;
        } else if d == corridor.dominant {
            penalty += with;
        } else {
            penalty += cross;
        }
    }

    penalty
}

/// Convert a node sequence into mission steps. Only the final edge carries
/// the requested action; all others are plain traversals.
pub fn build_path(graph: &FloorGraph, nodes: &[NodeId], last_action: StepAction) -> VehiclePath {
    let mut steps = Vec::with_capacity(nodes.len().saturating_sub(1));
    for window in nodes.windows(2) {
        let direction = graph
            .step_direction(&window[0], &window[1])
            .unwrap_or(Direction::Right);
        steps.push(PathStep {
            node: window[1].clone(),
            direction,
            action: StepAction::NoAction,
        });
    }
    if let Some(last) = steps.last_mut() {
        last.action = last_action;
    }
    VehiclePath::new(steps)
}

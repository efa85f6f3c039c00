//! Metric A* for AMRs
//!
//! Heuristic is the Euclidean distance between node centers, edge cost the
//! precomputed geometric length. Tie-break on equal f-score prefers the
//! lower heuristic.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use super::FloorGraph;
use crate::types::NodeId;

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
        // BinaryHeap is a max-heap; invert so the lowest f wins, then the
        // lowest h on equal f.
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

/// Shortest metric path from `start` to `goal`, inclusive of both, or
/// `None` when no route exists. Blocked nodes are impassable.
pub fn find_path(graph: &FloorGraph, start: &NodeId, goal: &NodeId) -> Option<Vec<NodeId>> {
    let goal_node = graph.node(goal)?;
    let start_node = graph.node(start)?;
    if goal_node.blocked {
        return None;
    }
    if start == goal {
        return Some(vec![start.clone()]);
    }

    let mut open = BinaryHeap::new();
    let mut g_score: HashMap<NodeId, f64> = HashMap::new();
    let mut came_from: HashMap<NodeId, NodeId> = HashMap::new();

    g_score.insert(start.clone(), 0.0);
    open.push(Frontier {
        f: start_node.euclidean(goal_node),
        h: start_node.euclidean(goal_node),
        node: start.clone(),
    });

    while let Some(Frontier { node, .. }) = open.pop() {
        if node == *goal {
            return Some(reconstruct(&came_from, goal));
        }
        let current_g = g_score[&node];

        for (neighbor, distance) in graph.neighbors(&node) {
            let n = match graph.node(neighbor) {
                Some(n) if !n.blocked => n,
                _ => continue,
            };
            let tentative = current_g + distance;
            if g_score
                .get(neighbor)
                .map_or(true, |&known| tentative < known)
            {
                g_score.insert(neighbor.clone(), tentative);
                came_from.insert(neighbor.clone(), node.clone());
                let h = n.euclidean(goal_node);
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

fn reconstruct(came_from: &HashMap<NodeId, NodeId>, goal: &NodeId) -> Vec<NodeId> {
    let mut path = vec![goal.clone()];
    let mut cursor = goal;
    while let Some(prev) = came_from.get(cursor) {
        path.push(prev.clone());
        cursor = prev;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{grid_floor, grid_id};

    #[test]
    fn straight_line_is_shortest() {
        let g = grid_floor("n", 5, 1, 1);
        let path = find_path(&g, &grid_id("n", 0, 0), &grid_id("n", 4, 0)).unwrap();
        assert_eq!(path.len(), 5);
        assert_eq!(path[0], grid_id("n", 0, 0));
        assert_eq!(path[4], grid_id("n", 4, 0));
    }

    #[test]
    fn routes_around_blocked_nodes() {
        let mut g = grid_floor("n", 3, 3, 1);
        // Wall across the middle column, except the top row.
        for row in 1..3 {
            let mut node = g.node(&grid_id("n", 1, row)).unwrap().clone();
            node.blocked = true;
            g.add_node(node);
        }
        let path = find_path(&g, &grid_id("n", 0, 2), &grid_id("n", 2, 2)).unwrap();
        assert!(path.contains(&grid_id("n", 1, 0)));
        assert_eq!(path.len(), 7);
    }

    #[test]
    fn start_equals_goal() {
        let g = grid_floor("n", 2, 2, 1);
        let path = find_path(&g, &grid_id("n", 0, 0), &grid_id("n", 0, 0)).unwrap();
        assert_eq!(path, vec![grid_id("n", 0, 0)]);
    }

    #[test]
    fn unreachable_goal_returns_none() {
        let mut g = grid_floor("n", 3, 1, 1);
        let mut node = g.node(&grid_id("n", 1, 0)).unwrap().clone();
        node.blocked = true;
        g.add_node(node);
        assert!(find_path(&g, &grid_id("n", 0, 0), &grid_id("n", 2, 0)).is_none());
    }
}

//! Shared fixtures for unit and integration tests
//!
//! Compiled into the library so the `tests/` suites can reuse them; nothing
//! here is part of the public contract.

#![allow(clippy::expect_used)]

use crate::graph::{FloorGraph, WarehouseMap};
use crate::types::{FloorId, Node, NodeId};

/// Build a rectangular grid floor: `cols × rows`, node ids
/// `"<prefix><col>-<row>"`, 1.0 spacing, 4-neighbour edges.
pub fn grid_floor(prefix: &str, cols: i32, rows: i32, floor: FloorId) -> FloorGraph {
    let mut g = FloorGraph::new();
    for col in 0..cols {
        for row in 0..rows {
            g.add_node(Node {
                id: NodeId::new(format!("{}{}-{}", prefix, col, row)),
                col,
                row,
                floor,
                x: f64::from(col),
                y: f64::from(row),
                blocked: false,
                has_box: false,
                direction_type: "twoway".into(),
                cell_type: None,
            });
        }
    }
    for col in 0..cols {
        for row in 0..rows {
            let here = NodeId::new(format!("{}{}-{}", prefix, col, row));
            if col + 1 < cols {
                let right = NodeId::new(format!("{}{}-{}", prefix, col + 1, row));
                g.add_edge(&here, &right).expect("grid edge");
            }
            if row + 1 < rows {
                let down = NodeId::new(format!("{}{}-{}", prefix, col, row + 1));
                g.add_edge(&here, &down).expect("grid edge");
            }
        }
    }
    g
}

/// A one-floor map around a grid floor
pub fn grid_map(prefix: &str, cols: i32, rows: i32, floor: FloorId) -> WarehouseMap {
    let mut map = WarehouseMap::new();
    map.add_floor(floor, grid_floor(prefix, cols, rows, floor));
    map
}

/// Grid node id helper matching [`grid_floor`] naming
pub fn grid_id(prefix: &str, col: i32, row: i32) -> NodeId {
    NodeId::new(format!("{}{}-{}", prefix, col, row))
}

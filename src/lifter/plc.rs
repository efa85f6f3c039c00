//! PLC seam
//!
//! The production controller speaks S7 to the lifter PLC; the crate only
//! depends on this trait. Tags per tower: `<tower>_POS_F<floor>` (cabin
//! position sensor), `<tower>_CTRL_F<floor>` (move command),
//! `<tower>_ERROR`.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{WcsError, WcsResult};
use crate::types::FloorId;

/// A PLC tag value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlcValue {
    /// Boolean flag
    Bool(bool),
    /// Numeric register
    Number(f64),
}

impl PlcValue {
    /// Boolean reading; numbers are truthy when non-zero
    pub fn as_bool(&self) -> bool {
        match self {
            PlcValue::Bool(b) => *b,
            PlcValue::Number(n) => *n != 0.0,
        }
    }
}

/// Position sensor tag of a floor
pub fn pos_tag(tower: &str, floor: FloorId) -> String {
    format!("{}_POS_F{}", tower, floor)
}

/// Move command tag of a floor
pub fn ctrl_tag(tower: &str, floor: FloorId) -> String {
    format!("{}_CTRL_F{}", tower, floor)
}

/// Error flag tag
pub fn error_tag(tower: &str) -> String {
    format!("{}_ERROR", tower)
}

/// PLC client contract
#[async_trait]
pub trait PlcClient: Send + Sync {
    /// Read a tag
    async fn get_value(&self, plc_id: &str, tag: &str) -> WcsResult<PlcValue>;

    /// Write a tag
    async fn write_value(&self, plc_id: &str, tag: &str, value: PlcValue) -> WcsResult<()>;
}

/// In-memory PLC used by the binary in simulation mode and by tests.
///
/// Writing a `CTRL` tag moves the simulated cabin: the matching `POS` flag
/// comes up and every other floor's flag drops.
pub struct InMemoryPlc {
    tags: DashMap<String, PlcValue>,
    floors: Vec<FloorId>,
}

impl InMemoryPlc {
    /// Simulated PLC with the cabin parked at `initial_floor`
    pub fn new(tower: &str, floors: Vec<FloorId>, initial_floor: FloorId) -> Self {
        let plc = Self {
            tags: DashMap::new(),
            floors,
        };
        for &floor in &plc.floors {
            plc.tags
                .insert(pos_tag(tower, floor), PlcValue::Bool(floor == initial_floor));
        }
        plc.tags.insert(error_tag(tower), PlcValue::Bool(false));
        plc
    }

    /// Force a sensor reading, for drift tests
    pub fn set_tag(&self, tag: &str, value: PlcValue) {
        self.tags.insert(tag.to_string(), value);
    }
}

#[async_trait]
impl PlcClient for InMemoryPlc {
    async fn get_value(&self, _plc_id: &str, tag: &str) -> WcsResult<PlcValue> {
        self.tags
            .get(tag)
            .map(|v| *v)
            .ok_or_else(|| WcsError::Unavailable(format!("unknown tag {}", tag)))
    }

    async fn write_value(&self, plc_id: &str, tag: &str, value: PlcValue) -> WcsResult<()> {
        if let Some(rest) = tag.rfind("_CTRL_F").map(|at| (&tag[..at], &tag[at + 7..])) {
            let (tower, floor_str) = rest;
            if value.as_bool() {
                if let Ok(target) = floor_str.parse::<FloorId>() {
                    for &floor in &self.floors {
                        self.tags
                            .insert(pos_tag(tower, floor), PlcValue::Bool(floor == target));
                    }
                }
            }
        }
        let _ = plc_id;
        self.tags.insert(tag.to_string(), value);
        Ok(())
    }
}

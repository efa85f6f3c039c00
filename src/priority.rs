//! Deterministic priority model
//!
//! Carrying vehicles outrank empty ones; within the same cargo status the
//! older task (lower registration sequence) wins. Waiting time is
//! deliberately excluded here; escalation lives in the conflict resolver.

use serde::Serialize;

use crate::types::{TaskId, VehicleId};

const CARRYING_WEIGHT: i64 = 1_000_000_000;
const FIFO_BASE: i64 = 999_999;

/// Dominant criterion of a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityReason {
    /// Decided by cargo status
    CargoStatus,
    /// Decided by task registration order
    Fifo,
}

/// Outcome of a pairwise priority comparison
#[derive(Debug, Clone, Serialize)]
pub struct PriorityVerdict {
    /// Higher-priority vehicle
    pub winner: VehicleId,
    /// Lower-priority vehicle
    pub loser: VehicleId,
    /// Score difference, always positive
    pub diff: i64,
    /// Dominant criterion
    pub reason: PriorityReason,
}

/// One contender in a comparison
#[derive(Debug, Clone)]
pub struct Contender {
    /// Vehicle
    pub vehicle: VehicleId,
    /// Whether it carries a pallet
    pub carrying: bool,
    /// Its task
    pub task: TaskId,
}

/// Deterministic priority score. Higher wins; ties are impossible while
/// task sequence numbers are unique.
pub fn score(carrying: bool, task: &TaskId) -> i64 {
    let cargo = if carrying { CARRYING_WEIGHT } else { 0 };
    cargo + (FIFO_BASE - i64::from(task.seq))
}

/// Compare two contenders
pub fn compare(a: &Contender, b: &Contender) -> PriorityVerdict {
    let score_a = score(a.carrying, &a.task);
    let score_b = score(b.carrying, &b.task);
    let (winner, loser) = if score_a >= score_b { (a, b) } else { (b, a) };
    let reason = if winner.carrying != loser.carrying {
        PriorityReason::CargoStatus
    } else {
        PriorityReason::Fifo
    };
    PriorityVerdict {
        winner: winner.vehicle.clone(),
        loser: loser.vehicle.clone(),
        diff: (score_a - score_b).abs(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(true, 1, 1_000_999_998 ; "carrying, first task")]
    #[test_case(false, 1, 999_998 ; "empty, first task")]
    #[test_case(true, 999_999, 1_000_000_000 ; "carrying, fifo term exhausted")]
    #[test_case(false, 999_999, 0 ; "empty, fifo term exhausted")]
    fn score_table(carrying: bool, seq: u32, expected: i64) {
        assert_eq!(score(carrying, &TaskId { stamp: 0, seq }), expected);
    }

    fn contender(vehicle: &str, carrying: bool, seq: u32) -> Contender {
        Contender {
            vehicle: VehicleId::from(vehicle),
            carrying,
            task: TaskId { stamp: 0, seq },
        }
    }

    #[test]
    fn carrying_beats_empty_regardless_of_age() {
        let carrier = contender("S1", true, 500);
        let empty = contender("S2", false, 1);
        let verdict = compare(&carrier, &empty);
        assert_eq!(verdict.winner, VehicleId::from("S1"));
        assert_eq!(verdict.reason, PriorityReason::CargoStatus);
    }

    #[test]
    fn older_task_wins_on_equal_cargo() {
        let older = contender("S1", false, 3);
        let newer = contender("S2", false, 7);
        let verdict = compare(&older, &newer);
        assert_eq!(verdict.winner, VehicleId::from("S1"));
        assert_eq!(verdict.reason, PriorityReason::Fifo);
        assert_eq!(verdict.diff, 4);
    }

    #[test]
    fn score_is_order_independent() {
        let a = contender("S1", true, 10);
        let b = contender("S2", false, 2);
        let ab = compare(&a, &b);
        let ba = compare(&b, &a);
        assert_eq!(ab.winner, ba.winner);
        assert_eq!(ab.diff, ba.diff);
    }
}

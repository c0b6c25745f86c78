//! Error types for race control preconditions

use thiserror::Error;

use crate::entrant::{EntrantId, EntrantStatus};
use crate::heat::HeatId;
use crate::race::RaceState;

/// Reasons a race or heat operation was refused.
///
/// Every variant names the entity that blocked the operation so the operator
/// can fix it. The race and entrant records are left untouched whenever one
/// of these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RaceError {
    /// An entrant has not reached a checked-in status yet
    #[error("All entrants must be checked in: entrant {entrant_id} is still in {status} state")]
    EntrantNotCheckedIn {
        entrant_id: EntrantId,
        status: EntrantStatus,
    },

    /// Nobody is eligible to race (in the selected divisions)
    #[error("No entrants ready to race, check in at least one entrant first")]
    NoEligibleEntrants,

    /// State change not allowed from the current state
    #[error("Cannot move race from {from} to {to}")]
    InvalidTransition { from: RaceState, to: RaceState },

    /// Operation needs a current heat but heats were never generated
    #[error("No current heat, generate heats first")]
    NoCurrentHeat,

    #[error("No heat with id {0}")]
    HeatNotFound(HeatId),

    #[error("No entrant with id {0}")]
    EntrantNotFound(EntrantId),

    #[error("Entrant {entrant_id} has no run at index {index}")]
    RunNotFound { entrant_id: EntrantId, index: usize },

    /// Lane index outside the heat's lane slots (0-indexed)
    #[error("Lane {lane_index} is out of range, heat {heat_id} has {lane_count} lanes")]
    LaneOutOfRange {
        heat_id: HeatId,
        lane_index: usize,
        lane_count: usize,
    },

    /// A time was offered for a lane nobody races in
    #[error("Lane {lane_index} of heat {heat_id} is empty and cannot hold a time")]
    EmptyLane { heat_id: HeatId, lane_index: usize },

    /// A finish time that is not a positive number of seconds
    #[error("Invalid lane time {0}")]
    InvalidTime(f64),

    /// The heat still waits for a time on this lane
    #[error("Heat {heat_id} still needs a time for lane {lane_index}")]
    HeatPending { heat_id: HeatId, lane_index: usize },

    #[error("Lane count must be at least 1, got {0}")]
    InvalidLaneCount(usize),

    /// A required entrant field was empty
    #[error("Entrant {0} must not be blank")]
    BlankField(&'static str),

    /// Heat control step requested out of order
    #[error("Cannot {action} while heat control is {phase}")]
    WrongPhase {
        action: &'static str,
        phase: &'static str,
    },
}

//! The race aggregate and its event-level lifecycle.
//!
//! ```text
//! Registration ──advance──► Racing ──advance──► Complete
//!       ▲                                          │
//!       └──────────── override (operator) ─────────┘
//! ```
//!
//! `advance_to` only moves one step forward and checks the entrant list
//! before racing starts. `override_state` skips all checks.

use serde::{Deserialize, Serialize};

use crate::entrant::Entrant;
use crate::error::RaceError;
use crate::heat::{Heat, HeatId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaceState {
    Registration,
    Racing,
    Complete,
}

impl Default for RaceState {
    fn default() -> Self {
        RaceState::Registration
    }
}

impl RaceState {
    /// The state an operator may advance to from here.
    pub fn next(&self) -> Option<RaceState> {
        match self {
            RaceState::Registration => Some(RaceState::Racing),
            RaceState::Racing => Some(RaceState::Complete),
            RaceState::Complete => None,
        }
    }
}

impl std::fmt::Display for RaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaceState::Registration => write!(f, "REGISTRATION"),
            RaceState::Racing => write!(f, "RACING"),
            RaceState::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Everything about the running event that is not an entrant record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Race {
    #[serde(default)]
    pub state: RaceState,
    /// Scheduled heats in running order
    #[serde(default)]
    pub heats: Vec<Heat>,
    /// Ad-hoc heats run outside the schedule, ids are negative
    #[serde(default)]
    pub manual_runs: Vec<Heat>,
    #[serde(default)]
    pub current_heat_id: Option<HeatId>,
    /// Wall clock (ms since the epoch) when the running countdown ends
    #[serde(default)]
    pub countdown_end_epoch_ms: Option<i64>,
    /// Bumped every time the schedule is replaced
    #[serde(default)]
    pub schedule_id: u32,
}

impl Race {
    pub fn new() -> Self {
        Race::default()
    }

    /// Move one step forward in the lifecycle.
    ///
    /// Entering [`RaceState::Racing`] needs every entrant checked in and at
    /// least one of them eligible to race.
    pub fn advance_to(&mut self, target: RaceState, entrants: &[Entrant]) -> Result<(), RaceError> {
        if self.state.next() != Some(target) {
            return Err(RaceError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        if target == RaceState::Racing {
            check_ready_to_race(entrants)?;
        }
        self.state = target;
        Ok(())
    }

    /// Set the state without any checks.
    pub fn override_state(&mut self, target: RaceState) {
        self.state = target;
    }

    /// Install a fresh schedule. Results held by the previous heats are
    /// dropped; runs already folded into entrants stay where they are.
    pub fn replace_heats(&mut self, heats: Vec<Heat>) {
        self.schedule_id = self.schedule_id.wrapping_add(1);
        self.current_heat_id = heats.first().map(|h| h.id);
        self.heats = heats;
        self.countdown_end_epoch_ms = None;
    }

    pub fn current_heat(&self) -> Option<&Heat> {
        let id = self.current_heat_id?;
        self.heats.iter().find(|h| h.id == id)
    }

    pub fn current_heat_mut(&mut self) -> Option<&mut Heat> {
        let id = self.current_heat_id?;
        self.heats.iter_mut().find(|h| h.id == id)
    }

    /// Heat that follows the current one in running order.
    pub fn next_heat_id(&self) -> Option<HeatId> {
        let id = self.current_heat_id?;
        let index = self.heats.iter().position(|h| h.id == id)?;
        self.heats.get(index + 1).map(|h| h.id)
    }

    /// Look a heat up in both the schedule and the manual runs.
    pub fn heat_mut(&mut self, heat_id: HeatId) -> Result<&mut Heat, RaceError> {
        self.heats
            .iter_mut()
            .chain(self.manual_runs.iter_mut())
            .find(|h| h.id == heat_id)
            .ok_or(RaceError::HeatNotFound(heat_id))
    }

    pub fn heat(&self, heat_id: HeatId) -> Result<&Heat, RaceError> {
        self.heats
            .iter()
            .chain(self.manual_runs.iter())
            .find(|h| h.id == heat_id)
            .ok_or(RaceError::HeatNotFound(heat_id))
    }

    /// Id for the next manual heat: one below the lowest so far, starting at -1.
    pub fn next_manual_heat_id(&self) -> HeatId {
        self.manual_runs
            .iter()
            .map(|h| h.id)
            .min()
            .unwrap_or(0)
            .min(0)
            - 1
    }
}

fn check_ready_to_race(entrants: &[Entrant]) -> Result<(), RaceError> {
    if let Some(blocking) = entrants.iter().find(|e| !e.status.is_checked_in()) {
        return Err(RaceError::EntrantNotCheckedIn {
            entrant_id: blocking.id,
            status: blocking.status,
        });
    }
    if !entrants.iter().any(|e| e.status.is_race_eligible()) {
        return Err(RaceError::NoEligibleEntrants);
    }
    Ok(())
}

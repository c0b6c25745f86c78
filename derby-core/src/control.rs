//! Heat-level race control.
//!
//! The per-heat sub-state lives only while an operator is actively running
//! heats; it is never persisted:
//!
//! ```text
//!            ready()            start(heat)
//!   Idle ─────────────► Ready ─────────────► Racing(heat)
//!    ▲                                            │
//!    └──────────── finish() (next / rerun) ───────┘
//! ```
//!
//! The functions in this module take the [`Race`] and the entrant records
//! explicitly and mutate them in place. Each one validates everything it
//! needs before touching either, so a returned error leaves both unchanged.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::entrant::{Entrant, EntrantId};
use crate::error::RaceError;
use crate::heat::{Heat, HeatId, Lane};
use crate::protocol::LaneResult;
use crate::race::Race;
use crate::schedule::HeatAlgorithm;

/// Where the operator is within the current heat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum HeatPhase {
    Idle,
    /// Gate raised, cars being staged
    Ready,
    /// Countdown running or heat run, waiting for next/rerun
    Racing { heat_id: HeatId },
}

impl Default for HeatPhase {
    fn default() -> Self {
        HeatPhase::Idle
    }
}

impl HeatPhase {
    pub fn name(&self) -> &'static str {
        match self {
            HeatPhase::Idle => "idle",
            HeatPhase::Ready => "ready",
            HeatPhase::Racing { .. } => "racing",
        }
    }
}

/// Guards the order of heat control steps.
#[derive(Debug, Clone, Default)]
pub struct HeatControl {
    phase: HeatPhase,
}

impl HeatControl {
    pub fn new() -> Self {
        HeatControl::default()
    }

    pub fn phase(&self) -> HeatPhase {
        self.phase
    }

    /// Idle -> Ready
    pub fn ready(&mut self) -> Result<(), RaceError> {
        match self.phase {
            HeatPhase::Idle => {
                self.phase = HeatPhase::Ready;
                Ok(())
            }
            other => Err(wrong_phase("ready a heat", other)),
        }
    }

    /// Ready -> Racing
    pub fn start(&mut self, heat_id: HeatId) -> Result<(), RaceError> {
        match self.phase {
            HeatPhase::Ready => {
                self.phase = HeatPhase::Racing { heat_id };
                Ok(())
            }
            other => Err(wrong_phase("drop the gate", other)),
        }
    }

    /// The heat being raced, if any.
    pub fn racing_heat(&self, action: &'static str) -> Result<HeatId, RaceError> {
        match self.phase {
            HeatPhase::Racing { heat_id } => Ok(heat_id),
            other => Err(wrong_phase(action, other)),
        }
    }

    /// Racing -> Idle
    pub fn finish(&mut self) -> Result<HeatId, RaceError> {
        let heat_id = self.racing_heat("finish a heat")?;
        self.phase = HeatPhase::Idle;
        Ok(heat_id)
    }

    /// Back to Idle from anywhere, used when the schedule is replaced.
    pub fn reset(&mut self) {
        self.phase = HeatPhase::Idle;
    }
}

fn wrong_phase(action: &'static str, phase: HeatPhase) -> RaceError {
    RaceError::WrongPhase {
        action,
        phase: phase.name(),
    }
}

/// Outcome of storing one lane time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneRecord {
    pub heat_id: HeatId,
    pub lane_index: usize,
    pub entrant_id: EntrantId,
    pub time: f64,
    /// Whether the run counts toward the average; `None` when the entrant
    /// record no longer exists and only the heat was updated
    pub is_included: Option<bool>,
}

/// Entrants that get scheduled, optionally limited to some divisions.
pub fn eligible_entrants(entrants: &[Entrant], divisions: &[String]) -> Vec<EntrantId> {
    entrants
        .iter()
        .filter(|e| e.status.is_race_eligible())
        .filter(|e| divisions.is_empty() || divisions.contains(&e.division))
        .map(|e| e.id)
        .collect()
}

/// Generate a schedule and install it on the race.
pub fn schedule_heats<R: Rng + ?Sized>(
    race: &mut Race,
    entrants: &[Entrant],
    divisions: &[String],
    lane_count: usize,
    algorithm: HeatAlgorithm,
    rng: &mut R,
) -> Result<usize, RaceError> {
    let eligible = eligible_entrants(entrants, divisions);
    if eligible.is_empty() {
        return Err(RaceError::NoEligibleEntrants);
    }
    let heats = algorithm.generate_with_rng(&eligible, lane_count, rng);
    let count = heats.len();
    race.replace_heats(heats);
    Ok(count)
}

/// Record a finish time on a lane and fold it into the entrant's runs.
///
/// Recording over an existing time replaces the earlier run from the same
/// heat and lane instead of adding a second one. Runs from an earlier
/// schedule that reused the heat id are left alone.
pub fn record_lane_time(
    race: &mut Race,
    entrants: &mut [Entrant],
    heat_id: HeatId,
    lane_index: usize,
    time: f64,
    now: DateTime<Utc>,
) -> Result<LaneRecord, RaceError> {
    let schedule_id = race.schedule_id;
    let heat = race.heat_mut(heat_id)?;
    let entrant_id = heat.set_time(lane_index, time)?;
    let source = heat.run_source(schedule_id);
    let lane = lane_index + 1;

    let is_included = entrants.iter_mut().find(|e| e.id == entrant_id).map(|e| {
        e.runs
            .retain(|r| !(r.source() == Some(source) && r.lane == lane));
        e.record_run(time, lane, Some(source), now).is_included
    });

    Ok(LaneRecord {
        heat_id,
        lane_index,
        entrant_id,
        time,
        is_included,
    })
}

/// Fold controller results into a heat.
///
/// Each occupied lane takes the time of the result with the matching
/// 1-indexed lane number. DNF, missing or null results leave the lane unset
/// for manual entry. Returns the lanes that did get a time.
pub fn apply_lane_results(
    race: &mut Race,
    entrants: &mut [Entrant],
    heat_id: HeatId,
    results: &[LaneResult],
    now: DateTime<Utc>,
) -> Result<Vec<LaneRecord>, RaceError> {
    let occupied: Vec<usize> = race
        .heat(heat_id)?
        .occupied_lanes()
        .into_iter()
        .map(|lane| lane - 1)
        .collect();

    let mut recorded = Vec::new();
    for lane_index in occupied {
        let time = results
            .iter()
            .find(|r| r.lane_number == lane_index + 1)
            .and_then(LaneResult::seconds);
        if let Some(time) = time {
            recorded.push(record_lane_time(
                race, entrants, heat_id, lane_index, time, now,
            )?);
        }
    }
    Ok(recorded)
}

/// Clear every lane time of a heat and remove the runs it produced in the
/// current schedule. Returns the number of runs removed across all entrants.
pub fn clear_heat_results(
    race: &mut Race,
    entrants: &mut [Entrant],
    heat_id: HeatId,
) -> Result<usize, RaceError> {
    let schedule_id = race.schedule_id;
    let heat = race.heat_mut(heat_id)?;
    heat.clear_times();
    let source = heat.run_source(schedule_id);
    Ok(entrants
        .iter_mut()
        .map(|e| e.remove_runs_from(source))
        .sum())
}

/// Move to the next scheduled heat once the current one has no pending lane.
///
/// Returns the new current heat, or `None` when the current heat was the last
/// one (the current heat id is left alone then).
pub fn advance_heat(race: &mut Race) -> Result<Option<HeatId>, RaceError> {
    let heat = race.current_heat().ok_or(RaceError::NoCurrentHeat)?;
    if let Some(lane_index) = heat.first_pending_lane() {
        return Err(RaceError::HeatPending {
            heat_id: heat.id,
            lane_index,
        });
    }
    let next = race.next_heat_id();
    if next.is_some() {
        race.current_heat_id = next;
    }
    Ok(next)
}

/// Build an ad-hoc heat from entrant ids per lane and append it to the
/// manual runs. Ids that match no entrant leave their lane empty.
pub fn push_manual_heat(
    race: &mut Race,
    entrants: &[Entrant],
    lane_entrants: &[Option<EntrantId>],
    lane_count: usize,
) -> HeatId {
    let id = race.next_manual_heat_id();
    let lanes = (0..lane_count)
        .map(|i| {
            lane_entrants
                .get(i)
                .copied()
                .flatten()
                .filter(|id| entrants.iter().any(|e| e.id == *id))
                .map(Lane::with_entrant)
                .unwrap_or_default()
        })
        .collect();
    race.manual_runs.push(Heat { id, lanes });
    id
}

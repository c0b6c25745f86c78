//! Heats and their lane slots.

use serde::{Deserialize, Serialize};

use crate::entrant::{EntrantId, RunSource};
use crate::error::RaceError;

/// Positive for scheduled heats, negative for manual (ad-hoc) heats.
pub type HeatId = i64;

/// One physical lane in one heat.
///
/// A lane without an entrant never carries a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    pub entrant_id: Option<EntrantId>,
    /// Finish time in seconds
    pub time: Option<f64>,
}

impl Lane {
    pub fn empty() -> Self {
        Lane::default()
    }

    pub fn with_entrant(entrant_id: EntrantId) -> Self {
        Lane {
            entrant_id: Some(entrant_id),
            time: None,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.entrant_id.is_some()
    }

    /// Occupied and still waiting for a time.
    pub fn is_pending(&self) -> bool {
        self.entrant_id.is_some() && self.time.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heat {
    pub id: HeatId,
    /// Lane slots in track order; position is the lane index
    pub lanes: Vec<Lane>,
}

impl Heat {
    pub fn new(id: HeatId, lane_count: usize) -> Self {
        Heat {
            id,
            lanes: vec![Lane::empty(); lane_count],
        }
    }

    pub fn is_manual(&self) -> bool {
        self.id < 0
    }

    /// Tag for the runs this heat produces while `schedule_id` is current.
    pub fn run_source(&self, schedule_id: u32) -> RunSource {
        if self.is_manual() {
            RunSource::manual(self.id)
        } else {
            RunSource::scheduled(schedule_id, self.id)
        }
    }

    /// Lane numbers (1-indexed, as the timing controller counts them) that have an entrant.
    pub fn occupied_lanes(&self) -> Vec<usize> {
        self.lanes
            .iter()
            .enumerate()
            .filter(|(_, lane)| lane.is_occupied())
            .map(|(index, _)| index + 1)
            .collect()
    }

    /// First lane (0-indexed) that still needs a time.
    pub fn first_pending_lane(&self) -> Option<usize> {
        self.lanes.iter().position(Lane::is_pending)
    }

    /// Every lane has either a time or nobody in it.
    pub fn is_finished(&self) -> bool {
        self.first_pending_lane().is_none()
    }

    pub fn clear_times(&mut self) {
        for lane in self.lanes.iter_mut() {
            lane.time = None;
        }
    }

    /// Store a finish time on an occupied lane and return who ran it.
    pub fn set_time(&mut self, lane_index: usize, time: f64) -> Result<EntrantId, RaceError> {
        if !time.is_finite() || time <= 0.0 {
            return Err(RaceError::InvalidTime(time));
        }
        let heat_id = self.id;
        let lane_count = self.lanes.len();
        let lane = self
            .lanes
            .get_mut(lane_index)
            .ok_or(RaceError::LaneOutOfRange {
                heat_id,
                lane_index,
                lane_count,
            })?;
        let entrant_id = lane
            .entrant_id
            .ok_or(RaceError::EmptyLane { heat_id, lane_index })?;
        lane.time = Some(time);
        Ok(entrant_id)
    }

    pub fn entrant_ids(&self) -> impl Iterator<Item = EntrantId> + '_ {
        self.lanes.iter().filter_map(|lane| lane.entrant_id)
    }
}

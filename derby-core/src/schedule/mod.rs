//! Heat scheduling.
//!
//! A schedule assigns every entrant to every lane exactly once across a set
//! of heats. The number of heats is `max(entrants, lanes)`, so when there are
//! fewer entrants than lanes some slots stay empty.
//!
//! Two strategies are available:
//!
//! | Strategy                    | Assignment                                   |
//! |-----------------------------|----------------------------------------------|
//! | [`HeatAlgorithm::Rotation`] | Shuffle once, then cyclic (Latin square)     |
//! | [`HeatAlgorithm::Chaos`]    | Random free heat per entrant and per lane    |
//!
//! Both are total over any input. Callers reject an empty entrant list
//! before asking for a schedule.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::entrant::EntrantId;
use crate::heat::Heat;

mod chaos;
mod rotation;

pub use chaos::chaos;
pub use rotation::rotation;

/// Which scheduling strategy to use, stored in the race settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeatAlgorithm {
    Rotation,
    Chaos,
}

impl Default for HeatAlgorithm {
    fn default() -> Self {
        HeatAlgorithm::Rotation
    }
}

impl HeatAlgorithm {
    /// Name shown to operators when picking a strategy
    pub fn display_name(&self) -> &'static str {
        match self {
            HeatAlgorithm::Rotation => "Max Efficiency",
            HeatAlgorithm::Chaos => "Max Randomness",
        }
    }

    /// Build a schedule using the thread-local random generator.
    pub fn generate(&self, entrants: &[EntrantId], lane_count: usize) -> Vec<Heat> {
        self.generate_with_rng(entrants, lane_count, &mut rand::thread_rng())
    }

    pub fn generate_with_rng<R: Rng + ?Sized>(
        &self,
        entrants: &[EntrantId],
        lane_count: usize,
        rng: &mut R,
    ) -> Vec<Heat> {
        match self {
            HeatAlgorithm::Rotation => rotation(entrants, lane_count, rng),
            HeatAlgorithm::Chaos => chaos(entrants, lane_count, rng),
        }
    }
}

impl std::fmt::Display for HeatAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeatAlgorithm::Rotation => write!(f, "rotation"),
            HeatAlgorithm::Chaos => write!(f, "chaos"),
        }
    }
}

/// Number of heats needed so everybody runs every lane once.
pub fn heat_count(entrant_count: usize, lane_count: usize) -> usize {
    entrant_count.max(lane_count)
}

/// Empty heats numbered from 1.
fn empty_heats(count: usize, lane_count: usize) -> Vec<Heat> {
    (1..=count)
        .map(|id| Heat::new(id as i64, lane_count))
        .collect()
}

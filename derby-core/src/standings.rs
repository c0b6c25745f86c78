//! Speed standings by average time.

use serde::{Deserialize, Serialize};

use crate::entrant::{Entrant, EntrantId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    /// 1-based
    pub place: usize,
    pub entrant_id: EntrantId,
    pub entry_name: String,
    pub owner_name: String,
    pub division: String,
    pub average_time: f64,
}

/// Rank entrants with a positive average, fastest first.
///
/// An empty `divisions` slice means all divisions. Ties keep entrant order.
pub fn speed_standings(entrants: &[Entrant], divisions: &[String]) -> Vec<Standing> {
    let mut ranked: Vec<(&Entrant, f64)> = entrants
        .iter()
        .filter(|e| divisions.is_empty() || divisions.contains(&e.division))
        .filter_map(|e| e.average_time.filter(|t| *t > 0.0).map(|t| (e, t)))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (e, average_time))| Standing {
            place: i + 1,
            entrant_id: e.id,
            entry_name: e.entry_name.clone(),
            owner_name: e.owner_name.clone(),
            division: e.division.clone(),
            average_time,
        })
        .collect()
}

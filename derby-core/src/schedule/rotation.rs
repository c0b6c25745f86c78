//! Cyclic (Latin square) assignment over a shuffled entrant order.

use rand::seq::SliceRandom;
use rand::Rng;

use super::{empty_heats, heat_count};
use crate::entrant::EntrantId;
use crate::heat::Heat;

/// Heat `h`, lane `t` gets `shuffled[(h + t) % heats]`, or nobody when that
/// index is past the end of the entrant list.
///
/// Deterministic once shuffled. Shifting by one position per lane also means
/// two entrants rarely meet in more than one heat.
pub fn rotation<R: Rng + ?Sized>(
    entrants: &[EntrantId],
    lane_count: usize,
    rng: &mut R,
) -> Vec<Heat> {
    let mut shuffled = entrants.to_vec();
    shuffled.shuffle(rng);

    let count = heat_count(shuffled.len(), lane_count);
    let mut heats = empty_heats(count, lane_count);

    for (h, heat) in heats.iter_mut().enumerate() {
        for (t, lane) in heat.lanes.iter_mut().enumerate() {
            lane.entrant_id = shuffled.get((h + t) % count).copied();
        }
    }
    heats
}

//! Fully random per-lane assignment.

use rand::seq::SliceRandom;
use rand::Rng;

use super::{empty_heats, heat_count};
use crate::entrant::EntrantId;
use crate::heat::Heat;

/// For each entrant and each lane, pick a random heat whose slot in that lane
/// is still free.
///
/// There are at least as many heats as entrants, so a lane column never runs
/// out of free slots and no backtracking is needed. Lanes are chosen
/// independently, which means an entrant can land in the same heat on two
/// lanes at once.
pub fn chaos<R: Rng + ?Sized>(entrants: &[EntrantId], lane_count: usize, rng: &mut R) -> Vec<Heat> {
    let count = heat_count(entrants.len(), lane_count);
    let mut heats = empty_heats(count, lane_count);

    for &entrant_id in entrants {
        for t in 0..lane_count {
            let free: Vec<usize> = heats
                .iter()
                .enumerate()
                .filter(|(_, heat)| heat.lanes[t].entrant_id.is_none())
                .map(|(h, _)| h)
                .collect();
            if let Some(&h) = free.choose(rng) {
                heats[h].lanes[t].entrant_id = Some(entrant_id);
            }
        }
    }
    heats
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn has_double_booking(heats: &[Heat]) -> bool {
        heats.iter().any(|heat| {
            let mut ids: Vec<EntrantId> = heat.entrant_ids().collect();
            let total = ids.len();
            ids.sort();
            ids.dedup();
            ids.len() != total
        })
    }

    /// Known gap: lanes are drawn independently, so one entrant can be booked
    /// twice into the same heat. With 2 entrants on 2 lanes this happens half
    /// the time, so some seed in the range below must show it.
    #[test]
    fn test_chaos_can_book_entrant_twice_in_one_heat() {
        let found = (0..64u64).any(|seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            has_double_booking(&chaos(&[1, 2], 2, &mut rng))
        });
        assert!(found);
    }

    #[test]
    fn test_chaos_is_seed_deterministic() {
        let entrants: Vec<EntrantId> = (1..=9).collect();
        let a = chaos(&entrants, 4, &mut StdRng::seed_from_u64(5));
        let b = chaos(&entrants, 4, &mut StdRng::seed_from_u64(5));
        assert_eq!(a, b);
    }
}

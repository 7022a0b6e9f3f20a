//! Weighted random sampling without replacement.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Draws distinct winners; each step picks a remaining member with
/// probability weight / remaining total weight.
pub struct WeightedSelector {
    rng: StdRng,
}

impl WeightedSelector {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible draws, for tests and audits.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Up to `k` distinct members in draw order. Zero-weight entries are never
    /// drawn. When `k` covers the whole pool every member wins, in input order.
    pub fn select<T: Copy>(&mut self, pool: &[(T, u64)], k: usize) -> Vec<T> {
        let mut remaining: Vec<(T, u64)> = pool.iter().copied().filter(|(_, w)| *w > 0).collect();
        if k == 0 || remaining.is_empty() {
            return Vec::new();
        }
        if k >= remaining.len() {
            return remaining.into_iter().map(|(m, _)| m).collect();
        }

        let mut total: u128 = remaining.iter().map(|(_, w)| *w as u128).sum();
        let mut winners = Vec::with_capacity(k);

        while winners.len() < k && !remaining.is_empty() {
            let target = self.rng.gen_range(0..total);
            let mut cumulative = 0u128;
            let mut index = remaining.len() - 1;
            for (i, (_, weight)) in remaining.iter().enumerate() {
                cumulative += *weight as u128;
                if target < cumulative {
                    index = i;
                    break;
                }
            }
            let (member, weight) = remaining.remove(index);
            total -= weight as u128;
            winners.push(member);
        }

        winners
    }
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self::new()
    }
}

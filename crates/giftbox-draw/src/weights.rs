//! Weight resolver.

use std::collections::{BTreeMap, BTreeSet};

use giftbox_core::types::{MemberId, RoleId};

/// Entry weight for an eligible member.
///
/// Starts at 1 and is multiplied by every matching role multiplier. `bonus`
/// (the sponsor boost) is added afterwards. Never below 1.
pub fn resolve_weight(
    roles: &BTreeSet<RoleId>,
    multipliers: &BTreeMap<RoleId, u64>,
    bonus: u64,
) -> u64 {
    let weight = roles
        .iter()
        .filter_map(|r| multipliers.get(r))
        .fold(1u64, |acc, m| acc.saturating_mul(*m));
    weight.saturating_add(bonus).max(1)
}

/// Raffle draw pool: ticket count as weight, zero-ticket holders dropped.
pub fn raffle_pool(tickets: &BTreeMap<MemberId, u64>) -> Vec<(MemberId, u64)> {
    tickets
        .iter()
        .filter(|(_, t)| **t > 0)
        .map(|(m, t)| (*m, *t))
        .collect()
}

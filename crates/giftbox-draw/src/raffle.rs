//! Ticket-based raffles.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use giftbox_core::error::{GiftboxError, Result};
use giftbox_core::types::{GuildId, MemberId, RoleId};

use crate::selector::WeightedSelector;
use crate::weights::raffle_pool;

/// A named ticket pool in a guild. The winner is fixed once drawn until an
/// explicit re-draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Raffle {
    pub guild_id: GuildId,
    pub name: String,
    pub winner: Option<MemberId>,
    /// Members and roles allowed to hand out tickets.
    #[serde(default)]
    pub deputy_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub deputy_members: BTreeSet<MemberId>,
    #[serde(default)]
    pub tickets: BTreeMap<MemberId, u64>,
}

impl Raffle {
    pub fn new(guild_id: GuildId, name: &str) -> Self {
        Self {
            guild_id,
            name: name.to_string(),
            winner: None,
            deputy_roles: BTreeSet::new(),
            deputy_members: BTreeSet::new(),
            tickets: BTreeMap::new(),
        }
    }

    pub fn tickets_of(&self, member: MemberId) -> u64 {
        self.tickets.get(&member).copied().unwrap_or(0)
    }

    pub fn total_tickets(&self) -> u64 {
        self.tickets.values().fold(0u64, |acc, t| acc.saturating_add(*t))
    }

    /// Returns the member's new ticket count.
    pub fn add_tickets(&mut self, member: MemberId, amount: u64) -> Result<u64> {
        if amount == 0 {
            return Err(GiftboxError::Raffle("ticket amount must be positive".into()));
        }
        let count = self.tickets.entry(member).or_insert(0);
        *count = count.saturating_add(amount);
        Ok(*count)
    }

    /// Returns the member's new ticket count; a member reaching zero is dropped.
    pub fn remove_tickets(&mut self, member: MemberId, amount: u64) -> Result<u64> {
        let held = self.tickets_of(member);
        if amount == 0 || amount > held {
            return Err(GiftboxError::Raffle(format!(
                "cannot remove {amount} tickets from a member holding {held}"
            )));
        }
        let left = held - amount;
        if left == 0 {
            self.tickets.remove(&member);
        } else {
            self.tickets.insert(member, left);
        }
        Ok(left)
    }

    pub fn add_deputy_member(&mut self, member: MemberId, limit: usize) -> Result<()> {
        if !self.deputy_members.contains(&member) && self.deputy_members.len() >= limit {
            return Err(GiftboxError::Raffle(format!("at most {limit} deputy members")));
        }
        self.deputy_members.insert(member);
        Ok(())
    }

    pub fn remove_deputy_member(&mut self, member: MemberId) -> bool {
        self.deputy_members.remove(&member)
    }

    pub fn add_deputy_role(&mut self, role: RoleId, limit: usize) -> Result<()> {
        if !self.deputy_roles.contains(&role) && self.deputy_roles.len() >= limit {
            return Err(GiftboxError::Raffle(format!("at most {limit} deputy roles")));
        }
        self.deputy_roles.insert(role);
        Ok(())
    }

    pub fn remove_deputy_role(&mut self, role: RoleId) -> bool {
        self.deputy_roles.remove(&role)
    }

    pub fn is_deputy(&self, member: MemberId, roles: &BTreeSet<RoleId>) -> bool {
        self.deputy_members.contains(&member) || roles.iter().any(|r| self.deputy_roles.contains(r))
    }

    /// Pick a winner weighted by tickets. Refuses to overwrite an existing
    /// winner unless `redraw` is set.
    pub fn draw(&mut self, selector: &mut WeightedSelector, redraw: bool) -> Result<MemberId> {
        if self.winner.is_some() && !redraw {
            return Err(GiftboxError::Raffle(format!(
                "raffle '{}' already has a winner",
                self.name
            )));
        }
        let pool = raffle_pool(&self.tickets);
        let winner = selector
            .select(&pool, 1)
            .first()
            .copied()
            .ok_or_else(|| GiftboxError::Raffle(format!("raffle '{}' has no tickets", self.name)))?;
        tracing::debug!(
            "🎟️ Raffle '{}' drawn from {} holders ({} tickets)",
            self.name,
            pool.len(),
            self.total_tickets()
        );
        self.winner = Some(winner);
        Ok(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_bookkeeping() {
        let mut raffle = Raffle::new(1, "summer");
        assert_eq!(raffle.add_tickets(5, 3).unwrap(), 3);
        assert_eq!(raffle.add_tickets(5, 2).unwrap(), 5);
        assert!(raffle.add_tickets(5, 0).is_err());
        assert!(raffle.remove_tickets(5, 6).is_err());
        assert_eq!(raffle.remove_tickets(5, 5).unwrap(), 0);
        assert!(!raffle.tickets.contains_key(&5));
        assert_eq!(raffle.total_tickets(), 0);
    }

    #[test]
    fn test_deputies() {
        let mut raffle = Raffle::new(1, "summer");
        raffle.add_deputy_member(10, 1).unwrap();
        raffle.add_deputy_member(10, 1).unwrap();
        assert!(raffle.add_deputy_member(11, 1).is_err());
        raffle.add_deputy_role(77, 2).unwrap();

        assert!(raffle.is_deputy(10, &BTreeSet::new()));
        assert!(raffle.is_deputy(12, &BTreeSet::from([77])));
        assert!(!raffle.is_deputy(12, &BTreeSet::from([78])));

        assert!(raffle.remove_deputy_member(10));
        assert!(!raffle.is_deputy(10, &BTreeSet::new()));
    }

    #[test]
    fn test_draw_never_picks_zero_tickets() {
        let mut selector = WeightedSelector::seeded(5);
        for _ in 0..500 {
            let mut raffle = Raffle::new(1, "r");
            raffle.tickets.insert(1, 0);
            raffle.tickets.insert(2, 1);
            raffle.tickets.insert(3, 0);
            assert_eq!(raffle.draw(&mut selector, false).unwrap(), 2);
        }
    }

    #[test]
    fn test_draw_fixed_until_redraw() {
        let mut selector = WeightedSelector::seeded(8);
        let mut raffle = Raffle::new(1, "r");
        assert!(raffle.draw(&mut selector, false).is_err());

        raffle.add_tickets(4, 10).unwrap();
        assert_eq!(raffle.draw(&mut selector, false).unwrap(), 4);
        assert!(raffle.draw(&mut selector, false).is_err());

        raffle.add_tickets(6, 10).unwrap();
        let winner = raffle.draw(&mut selector, true).unwrap();
        assert!(winner == 4 || winner == 6);
        assert_eq!(raffle.winner, Some(winner));
    }
}

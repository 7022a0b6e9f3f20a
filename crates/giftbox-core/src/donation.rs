//! Donation ledger records and autorole thresholds.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{GiftboxError, Result};
use crate::types::{ChannelId, GuildId, MemberId, RoleId};

/// Per-guild, per-category ledger settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationConfig {
    pub guild_id: GuildId,
    pub category: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Threshold amount → role granted once a member's total reaches it.
    #[serde(default)]
    pub roles: BTreeMap<i64, RoleId>,
    /// Roles allowed to amend the ledger.
    #[serde(default)]
    pub managers: BTreeSet<RoleId>,
    #[serde(default)]
    pub logging: Option<ChannelId>,
}

fn default_symbol() -> String { "⏣".into() }

impl DonationConfig {
    pub fn new(guild_id: GuildId, category: &str) -> Self {
        Self {
            guild_id,
            category: category.to_string(),
            symbol: default_symbol(),
            roles: BTreeMap::new(),
            managers: BTreeSet::new(),
            logging: None,
        }
    }

    pub fn format_amount(&self, amount: i64) -> String {
        format!("{} {}", self.symbol, amount)
    }

    /// Roles to grant and revoke so a member with `total` holds exactly the
    /// threshold roles they qualify for.
    pub fn role_changes(&self, total: i64, held: &BTreeSet<RoleId>) -> RoleDelta {
        let mut delta = RoleDelta::default();
        for (threshold, role) in &self.roles {
            let qualifies = total >= *threshold;
            let holds = held.contains(role);
            if qualifies && !holds {
                delta.add.insert(*role);
            } else if !qualifies && holds {
                delta.remove.insert(*role);
            }
        }
        delta
    }
}

/// Autorole adjustments for one member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleDelta {
    pub add: BTreeSet<RoleId>,
    pub remove: BTreeSet<RoleId>,
}

impl RoleDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Running total for (member, guild, category).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donation {
    pub member_id: MemberId,
    pub guild_id: GuildId,
    pub category: String,
    pub amount: i64,
}

/// A manager's amendment to a member's total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DonationAction {
    Add(i64),
    Remove(i64),
}

impl DonationAction {
    /// New balance after applying this action to `balance`.
    pub fn apply(self, balance: i64) -> Result<i64> {
        match self {
            DonationAction::Add(n) if n <= 0 => {
                Err(GiftboxError::Donation("amount must be positive".into()))
            }
            DonationAction::Remove(n) if n <= 0 => {
                Err(GiftboxError::Donation("amount must be positive".into()))
            }
            DonationAction::Add(n) => Ok(balance.saturating_add(n)),
            DonationAction::Remove(n) if n > balance => Err(GiftboxError::Donation(format!(
                "cannot remove {n}, balance is only {balance}"
            ))),
            DonationAction::Remove(n) => Ok(balance - n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_changes() {
        let mut config = DonationConfig::new(1, "coins");
        config.roles.insert(100, 10);
        config.roles.insert(500, 50);
        config.roles.insert(1000, 99);

        let held = BTreeSet::from([99]);
        let delta = config.role_changes(600, &held);
        assert_eq!(delta.add, BTreeSet::from([10, 50]));
        assert_eq!(delta.remove, BTreeSet::from([99]));

        let held = BTreeSet::from([10, 50]);
        assert!(config.role_changes(500, &held).is_empty());
    }

    #[test]
    fn test_apply_actions() {
        assert_eq!(DonationAction::Add(5).apply(10).unwrap(), 15);
        assert_eq!(DonationAction::Remove(10).apply(10).unwrap(), 0);
        assert!(DonationAction::Remove(11).apply(10).is_err());
        assert!(DonationAction::Add(0).apply(10).is_err());
        assert!(DonationAction::Remove(-3).apply(10).is_err());
    }

    #[test]
    fn test_format_amount() {
        let mut config = DonationConfig::new(1, "coins");
        assert_eq!(config.format_amount(42), "⏣ 42");
        config.symbol = "$".into();
        assert_eq!(config.format_amount(7), "$ 7");
    }
}

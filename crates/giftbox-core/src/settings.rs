//! Per-guild and per-channel giveaway defaults.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::rules::EligibilityRules;
use crate::types::{ChannelId, GuildId, RoleId};

/// Guild-wide defaults. At most one per guild; created lazily on first read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildConfig {
    pub guild_id: GuildId,
    #[serde(default)]
    pub logging: Option<ChannelId>,
    #[serde(default)]
    pub ping: Option<RoleId>,
    #[serde(default)]
    pub managers: BTreeSet<RoleId>,
    #[serde(default)]
    pub required_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub blacklisted_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub bypass_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub multiplier_roles: BTreeMap<RoleId, u64>,
    #[serde(default = "bool_true")]
    pub dm_winner: bool,
    #[serde(default = "bool_true")]
    pub dm_host: bool,
    #[serde(default = "default_end_message")]
    pub end_message: String,
    #[serde(default = "default_reroll_message")]
    pub reroll_message: String,
    #[serde(default = "default_dm_message")]
    pub dm_message: String,
    #[serde(default = "default_dm_host_message")]
    pub dm_host_message: String,
    #[serde(default = "default_gw_header")]
    pub gw_header: String,
    #[serde(default = "default_gw_end_header")]
    pub gw_end_header: String,
}

fn bool_true() -> bool { true }
fn default_end_message() -> String { "Congratulations {winners}! You won {prize}!".into() }
fn default_reroll_message() -> String { "Congratulations {winners}! You are the new winner(s) of {prize}!".into() }
fn default_dm_message() -> String { "Congratulations {winner}! You won {prize}!".into() }
fn default_dm_host_message() -> String { "Your giveaway for {prize} has ended. Winners: {winners}".into() }
fn default_gw_header() -> String { "🎉 **GIVEAWAY** 🎉".into() }
fn default_gw_end_header() -> String { "🎉 **GIVEAWAY ENDED** 🎉".into() }

impl GuildConfig {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            logging: None,
            ping: None,
            managers: BTreeSet::new(),
            required_roles: BTreeSet::new(),
            blacklisted_roles: BTreeSet::new(),
            bypass_roles: BTreeSet::new(),
            multiplier_roles: BTreeMap::new(),
            dm_winner: true,
            dm_host: true,
            end_message: default_end_message(),
            reroll_message: default_reroll_message(),
            dm_message: default_dm_message(),
            dm_host_message: default_dm_host_message(),
            gw_header: default_gw_header(),
            gw_end_header: default_gw_end_header(),
        }
    }

    /// Role rules for a new giveaway in a channel: each field comes from the
    /// channel override when it is non-empty, otherwise from the guild.
    pub fn effective_rules(&self, channel: Option<&ChannelConfig>) -> EligibilityRules {
        fn pick<T: Clone + Default + PartialEq>(over: Option<&T>, base: &T) -> T {
            match over {
                Some(v) if *v != T::default() => v.clone(),
                _ => base.clone(),
            }
        }

        EligibilityRules {
            required_roles: pick(channel.map(|c| &c.required_roles), &self.required_roles),
            blacklisted_roles: pick(channel.map(|c| &c.blacklisted_roles), &self.blacklisted_roles),
            bypass_roles: pick(channel.map(|c| &c.bypass_roles), &self.bypass_roles),
            multiplier_roles: pick(channel.map(|c| &c.multiplier_roles), &self.multiplier_roles),
            ..EligibilityRules::default()
        }
    }

    /// Ping role for a channel, channel override first.
    pub fn ping_for(&self, channel: Option<&ChannelConfig>) -> Option<RoleId> {
        channel.and_then(|c| c.ping).or(self.ping)
    }
}

/// Per-channel override of the guild's role rules. Keyed by (guild, channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub required_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub blacklisted_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub bypass_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub multiplier_roles: BTreeMap<RoleId, u64>,
    #[serde(default)]
    pub ping: Option<RoleId>,
}

impl ChannelConfig {
    pub fn new(guild_id: GuildId, channel_id: ChannelId) -> Self {
        Self {
            guild_id,
            channel_id,
            required_roles: BTreeSet::new(),
            blacklisted_roles: BTreeSet::new(),
            bypass_roles: BTreeSet::new(),
            multiplier_roles: BTreeMap::new(),
            ping: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_overrides_non_empty_fields_only() {
        let mut guild = GuildConfig::new(1);
        guild.required_roles.insert(10);
        guild.bypass_roles.insert(20);
        guild.multiplier_roles.insert(30, 2);

        let mut channel = ChannelConfig::new(1, 5);
        channel.required_roles.insert(11);

        let rules = guild.effective_rules(Some(&channel));
        assert_eq!(rules.required_roles, BTreeSet::from([11]));
        assert_eq!(rules.bypass_roles, BTreeSet::from([20]));
        assert_eq!(rules.multiplier_roles.get(&30), Some(&2));
    }

    #[test]
    fn test_no_channel_uses_guild() {
        let mut guild = GuildConfig::new(1);
        guild.blacklisted_roles.insert(3);
        guild.ping = Some(9);
        assert_eq!(guild.effective_rules(None).blacklisted_roles, BTreeSet::from([3]));
        assert_eq!(guild.ping_for(None), Some(9));

        let mut channel = ChannelConfig::new(1, 2);
        channel.ping = Some(4);
        assert_eq!(guild.ping_for(Some(&channel)), Some(4));
    }

    #[test]
    fn test_defaults_from_sparse_json() {
        let config: GuildConfig = serde_json::from_str(r#"{"guild_id": 42}"#).unwrap();
        assert_eq!(config, GuildConfig::new(42));
    }
}

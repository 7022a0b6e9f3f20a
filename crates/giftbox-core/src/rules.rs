//! Eligibility rule snapshot carried by every giveaway.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{GiftboxError, Result};
use crate::types::{ChannelId, RoleId};

/// Who may win and how much each entry counts.
///
/// Multiplier roles compound: a member holding roles worth `2x` and `3x`
/// enters with weight 6, not 5.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityRules {
    #[serde(default)]
    pub required_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub blacklisted_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub bypass_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub multiplier_roles: BTreeMap<RoleId, u64>,
    #[serde(default)]
    pub messages_required: Option<u32>,
    /// Channels where messages count. Empty means every channel.
    #[serde(default)]
    pub message_channels: BTreeSet<ChannelId>,
    /// Minimum overall activity total (e.g. level/experience).
    #[serde(default)]
    pub activity_total: Option<u64>,
    /// Minimum activity within the recent window (e.g. weekly experience).
    #[serde(default)]
    pub activity_recent: Option<u64>,
}

impl EligibilityRules {
    /// Reject rule sets that cannot be honoured.
    pub fn validate(&self) -> Result<()> {
        if let Some((role, _)) = self.multiplier_roles.iter().find(|(_, m)| **m == 0) {
            return Err(GiftboxError::InvalidRules(format!(
                "multiplier for role {role} must be positive"
            )));
        }
        if let Some(role) = self.required_roles.intersection(&self.blacklisted_roles).next() {
            return Err(GiftboxError::InvalidRules(format!(
                "role {role} is both required and blacklisted"
            )));
        }
        Ok(())
    }

    /// Message threshold, if one is in force.
    pub fn message_threshold(&self) -> Option<u32> {
        self.messages_required.filter(|n| *n > 0)
    }

    pub fn has_activity_thresholds(&self) -> bool {
        self.activity_total.is_some_and(|t| t > 0) || self.activity_recent.is_some_and(|t| t > 0)
    }

    /// Layer per-giveaway rules over inherited defaults: each role field of
    /// `over` wins when non-empty, thresholds always come from `over`.
    pub fn overlay(self, over: EligibilityRules) -> EligibilityRules {
        fn pick<T: Default + PartialEq>(over: T, base: T) -> T {
            if over == T::default() { base } else { over }
        }

        EligibilityRules {
            required_roles: pick(over.required_roles, self.required_roles),
            blacklisted_roles: pick(over.blacklisted_roles, self.blacklisted_roles),
            bypass_roles: pick(over.bypass_roles, self.bypass_roles),
            multiplier_roles: pick(over.multiplier_roles, self.multiplier_roles),
            messages_required: over.messages_required,
            message_channels: over.message_channels,
            activity_total: over.activity_total,
            activity_recent: over.activity_recent,
        }
    }

    /// Whether a message sent in `channel` counts toward the threshold.
    pub fn counts_channel(&self, channel: ChannelId) -> bool {
        self.message_channels.is_empty() || self.message_channels.contains(&channel)
    }
}

//! Eligibility filter: decides whether one entrant may win.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use giftbox_core::rules::EligibilityRules;
use giftbox_core::traits::ActivitySnapshot;
use giftbox_core::types::{MemberId, RoleId};

/// Live data for one entrant, resolved by the caller.
#[derive(Debug, Clone, Default)]
pub struct MemberSnapshot {
    pub member_id: MemberId,
    /// `None` when the role lookup failed or the member left.
    pub roles: Option<BTreeSet<RoleId>>,
    pub messages: u32,
    /// Zeros when the activity service was unreachable.
    pub activity: ActivitySnapshot,
}

impl MemberSnapshot {
    pub fn new(member_id: MemberId, roles: BTreeSet<RoleId>) -> Self {
        Self {
            member_id,
            roles: Some(roles),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    BlacklistedRole,
    MissingRequiredRole,
    InsufficientMessages,
    InsufficientActivityTotal,
    InsufficientActivityRecent,
    DataUnavailable,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExclusionReason::BlacklistedRole => "holds a blacklisted role",
            ExclusionReason::MissingRequiredRole => "missing a required role",
            ExclusionReason::InsufficientMessages => "not enough messages",
            ExclusionReason::InsufficientActivityTotal => "not enough total activity",
            ExclusionReason::InsufficientActivityRecent => "not enough recent activity",
            ExclusionReason::DataUnavailable => "member data unavailable",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Excluded(ExclusionReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Run the filter. First match wins; a bypass role short-circuits everything.
pub fn check(member: &MemberSnapshot, rules: &EligibilityRules) -> Eligibility {
    let Some(roles) = &member.roles else {
        return Eligibility::Excluded(ExclusionReason::DataUnavailable);
    };

    if roles.iter().any(|r| rules.bypass_roles.contains(r)) {
        return Eligibility::Eligible;
    }
    if roles.iter().any(|r| rules.blacklisted_roles.contains(r)) {
        return Eligibility::Excluded(ExclusionReason::BlacklistedRole);
    }
    if !rules.required_roles.is_empty() && !roles.iter().any(|r| rules.required_roles.contains(r)) {
        return Eligibility::Excluded(ExclusionReason::MissingRequiredRole);
    }
    if let Some(needed) = rules.message_threshold() {
        if member.messages < needed {
            return Eligibility::Excluded(ExclusionReason::InsufficientMessages);
        }
    }
    if let Some(needed) = rules.activity_total.filter(|n| *n > 0) {
        if member.activity.total < needed {
            return Eligibility::Excluded(ExclusionReason::InsufficientActivityTotal);
        }
    }
    if let Some(needed) = rules.activity_recent.filter(|n| *n > 0) {
        if member.activity.recent < needed {
            return Eligibility::Excluded(ExclusionReason::InsufficientActivityRecent);
        }
    }
    Eligibility::Eligible
}

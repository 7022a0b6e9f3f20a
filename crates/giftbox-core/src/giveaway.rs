//! Giveaway record: one scheduled selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{GiftboxError, Result};
use crate::rules::EligibilityRules;
use crate::types::{EventKey, GuildId, MemberId, MessageId};

/// A giveaway. `ended` flips exactly once, when its timer is consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Giveaway {
    pub key: EventKey,
    /// Secondary message (ping / image) posted alongside the giveaway.
    pub extra_message_id: Option<MessageId>,
    pub prize: String,
    pub host_id: MemberId,
    /// Member who sponsored (donated) the prize.
    pub sponsor_id: Option<MemberId>,
    pub winner_count: u32,
    pub entrants: BTreeSet<MemberId>,
    /// Draw order is preserved.
    pub winners: Vec<MemberId>,
    pub ended: bool,
    pub ends_at: DateTime<Utc>,
    pub rules: EligibilityRules,
    /// Counted messages per member while the giveaway is open.
    pub messages: BTreeMap<MemberId, u32>,
    pub donation: Option<DonationLink>,
    pub created_at: DateTime<Utc>,
}

impl Giveaway {
    pub fn new(
        key: EventKey,
        host_id: MemberId,
        prize: &str,
        winner_count: u32,
        ends_at: DateTime<Utc>,
        rules: EligibilityRules,
    ) -> Self {
        Self {
            key,
            extra_message_id: None,
            prize: prize.to_string(),
            host_id,
            sponsor_id: None,
            winner_count,
            entrants: BTreeSet::new(),
            winners: Vec::new(),
            ended: false,
            ends_at,
            rules,
            messages: BTreeMap::new(),
            donation: None,
            created_at: Utc::now(),
        }
    }

    /// Schedule-time validation.
    pub fn validate(&self) -> Result<()> {
        if self.winner_count == 0 {
            return Err(GiftboxError::InvalidRules("winner count must be at least 1".into()));
        }
        if self.prize.trim().is_empty() {
            return Err(GiftboxError::InvalidRules("prize must not be empty".into()));
        }
        if let Some(link) = &self.donation {
            if link.amount <= 0 {
                return Err(GiftboxError::InvalidRules("donation credit must be positive".into()));
            }
            if link.target == CreditTarget::Sponsor && self.sponsor_id.is_none() {
                return Err(GiftboxError::InvalidRules(
                    "donation credit targets the sponsor but none is set".into(),
                ));
            }
        }
        self.rules.validate()
    }

    pub fn message_count(&self, member: MemberId) -> u32 {
        self.messages.get(&member).copied().unwrap_or(0)
    }

    /// Donation ledger credits owed when the giveaway ends with `winners`.
    pub fn donation_credits(&self, winners: &[MemberId]) -> Vec<(MemberId, i64)> {
        let Some(link) = &self.donation else {
            return Vec::new();
        };
        match link.target {
            CreditTarget::Host => vec![(self.host_id, link.amount)],
            CreditTarget::Sponsor => self
                .sponsor_id
                .map(|s| vec![(s, link.amount)])
                .unwrap_or_default(),
            CreditTarget::Winners => winners.iter().map(|w| (*w, link.amount)).collect(),
        }
    }
}

/// Donation category credited when a giveaway ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationLink {
    pub category: String,
    pub amount: i64,
    pub target: CreditTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditTarget {
    Host,
    Sponsor,
    Winners,
}

/// Giveaways hosted per (guild, host).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    pub guild_id: GuildId,
    pub host_id: MemberId,
    pub count: u64,
}

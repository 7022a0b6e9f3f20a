//! Durable expiry timers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use giftbox_core::giveaway::Giveaway;
use giftbox_core::types::{EventKey, MemberId};

/// What a timer drives when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Ends the giveaway with the same key.
    Giveaway,
    /// Plain countdown; announces that it ran out.
    Reminder,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Giveaway => "giveaway",
            TimerKind::Reminder => "reminder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "giveaway" => Some(TimerKind::Giveaway),
            "reminder" => Some(TimerKind::Reminder),
            _ => None,
        }
    }
}

/// One pending expiration. At most one per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    pub key: EventKey,
    pub author_id: MemberId,
    pub kind: TimerKind,
    /// Kept so a reminder can be announced after a restart.
    pub title: String,
    pub expires_at: DateTime<Utc>,
}

impl Timer {
    pub fn for_giveaway(giveaway: &Giveaway) -> Self {
        Self {
            key: giveaway.key,
            author_id: giveaway.host_id,
            kind: TimerKind::Giveaway,
            title: giveaway.prize.clone(),
            expires_at: giveaway.ends_at,
        }
    }

    pub fn reminder(key: EventKey, author_id: MemberId, title: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            key,
            author_id,
            kind: TimerKind::Reminder,
            title: title.to_string(),
            expires_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use giftbox_core::rules::EligibilityRules;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [TimerKind::Giveaway, TimerKind::Reminder] {
            assert_eq!(TimerKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TimerKind::parse("cron"), None);
    }

    #[test]
    fn test_for_giveaway_and_due() {
        let ends_at = Utc::now() + chrono::Duration::seconds(30);
        let gw = Giveaway::new(EventKey::new(1, 2, 3), 9, "Nitro", 1, ends_at, EligibilityRules::default());
        let timer = Timer::for_giveaway(&gw);
        assert_eq!(timer.kind, TimerKind::Giveaway);
        assert_eq!(timer.author_id, 9);
        assert_eq!(timer.title, "Nitro");
        assert!(!timer.is_due(Utc::now()));
        assert!(timer.is_due(ends_at));
    }
}

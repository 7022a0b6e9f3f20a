//! Announcement rendering and best-effort delivery.
//! Delivery failures are logged here and never propagate: by the time anything
//! is announced the selection is already committed.

use std::time::Duration;

use giftbox_core::giveaway::Giveaway;
use giftbox_core::settings::GuildConfig;
use giftbox_core::templates::{self, mention, mention_list};
use giftbox_core::traits::{Announcement, ChatPlatform};
use giftbox_core::types::{ChannelId, MemberId, RoleId};

use crate::lifecycle::DrawOutcome;
use crate::timers::Timer;

fn reply(giveaway: &Giveaway, content: String) -> Announcement {
    Announcement {
        channel_id: giveaway.key.channel_id,
        reply_to: Some(giveaway.key.message_id),
        content,
    }
}

fn shortfall(outcome: &DrawOutcome) -> String {
    format!(
        "\nOnly {} of {} winner(s) could be picked: not enough eligible entrants.",
        outcome.winners.len(),
        outcome.requested
    )
}

fn winner_text(template: &str, giveaway: &Giveaway, outcome: &DrawOutcome) -> String {
    if outcome.winners.is_empty() {
        return templates::no_winners(&giveaway.prize);
    }
    let winners = mention_list(&outcome.winners);
    let mut text = templates::render(
        template,
        &[("winners", winners.as_str()), ("prize", giveaway.prize.as_str())],
    );
    if outcome.insufficient {
        text.push_str(&shortfall(outcome));
    }
    text
}

/// Reply to the giveaway message with its winners.
pub fn end_announcement(giveaway: &Giveaway, outcome: &DrawOutcome, guild: &GuildConfig) -> Announcement {
    reply(giveaway, winner_text(&guild.end_message, giveaway, outcome))
}

pub fn reroll_announcement(giveaway: &Giveaway, outcome: &DrawOutcome, guild: &GuildConfig) -> Announcement {
    reply(giveaway, winner_text(&guild.reroll_message, giveaway, outcome))
}

pub fn winner_dm(giveaway: &Giveaway, guild: &GuildConfig, winner: MemberId, winners: &[MemberId]) -> String {
    let (winner, winners) = (mention(winner), mention_list(winners));
    let text = templates::render(
        &guild.dm_message,
        &[
            ("winner", winner.as_str()),
            ("winners", winners.as_str()),
            ("prize", giveaway.prize.as_str()),
        ],
    );
    format!("{text}\n{}", giveaway.key.jump_url())
}

pub fn host_dm(giveaway: &Giveaway, guild: &GuildConfig, winners: &[MemberId]) -> String {
    let listed = if winners.is_empty() {
        "nobody".to_string()
    } else {
        mention_list(winners)
    };
    let text = templates::render(
        &guild.dm_host_message,
        &[("winners", listed.as_str()), ("prize", giveaway.prize.as_str())],
    );
    format!("{text}\n{}", giveaway.key.jump_url())
}

/// Summary for the guild's logging channel, if one is configured.
pub fn log_announcement(giveaway: &Giveaway, guild: &GuildConfig, outcome: &DrawOutcome) -> Option<Announcement> {
    let channel_id = guild.logging?;
    let winners = if outcome.winners.is_empty() {
        "none".to_string()
    } else {
        mention_list(&outcome.winners)
    };
    Some(Announcement {
        channel_id,
        reply_to: None,
        content: format!(
            "{}\nPrize: {}\nHost: {}\nWinners: {}\nEntrants: {} ({} eligible)\n{}",
            guild.gw_end_header,
            templates::bold(&giveaway.prize),
            mention(giveaway.host_id),
            winners,
            giveaway.entrants.len(),
            outcome.eligible,
            giveaway.key.jump_url()
        ),
    })
}

/// Body of the message that advertises an open giveaway.
/// `ping` leads the message as a role mention when set.
pub fn giveaway_message(giveaway: &Giveaway, guild: &GuildConfig, ping: Option<RoleId>) -> String {
    let mut lines = Vec::new();
    if let Some(role) = ping {
        lines.push(templates::role_mention(role));
    }
    lines.extend([
        guild.gw_header.clone(),
        templates::bold(&giveaway.prize),
        format!("Ends: <t:{}:R>", giveaway.ends_at.timestamp()),
        format!("Hosted by: {}", mention(giveaway.host_id)),
        format!("Winners: {}", giveaway.winner_count),
    ]);
    if let Some(sponsor) = giveaway.sponsor_id {
        lines.push(format!("Donated by: {}", mention(sponsor)));
    }

    let rules = &giveaway.rules;
    let roles = |set: &std::collections::BTreeSet<u64>| {
        set.iter().map(|r| templates::role_mention(*r)).collect::<Vec<_>>().join(", ")
    };
    if !rules.required_roles.is_empty() {
        lines.push(format!("Required roles: {}", roles(&rules.required_roles)));
    }
    if !rules.blacklisted_roles.is_empty() {
        lines.push(format!("Blacklisted roles: {}", roles(&rules.blacklisted_roles)));
    }
    if !rules.bypass_roles.is_empty() {
        lines.push(format!("Bypass roles: {}", roles(&rules.bypass_roles)));
    }
    for (role, multiplier) in &rules.multiplier_roles {
        lines.push(format!("{}: {multiplier}x entries", templates::role_mention(*role)));
    }
    if let Some(n) = rules.message_threshold() {
        lines.push(format!("Messages required: {n}"));
    }
    if let Some(n) = rules.activity_total.filter(|n| *n > 0) {
        lines.push(format!("Activity required: {n}"));
    }
    if let Some(n) = rules.activity_recent.filter(|n| *n > 0) {
        lines.push(format!("Recent activity required: {n}"));
    }
    lines.join("\n")
}

pub fn reminder_announcement(timer: &Timer) -> Announcement {
    Announcement {
        channel_id: timer.key.channel_id,
        reply_to: Some(timer.key.message_id),
        content: format!("{} {}", mention(timer.author_id), templates::timer_ended(&timer.title)),
    }
}

pub fn channel_message(channel_id: ChannelId, content: String) -> Announcement {
    Announcement {
        channel_id,
        reply_to: None,
        content,
    }
}

/// Post an announcement. Returns whether it was delivered.
pub async fn deliver(platform: &dyn ChatPlatform, announcement: &Announcement, limit: Duration) -> bool {
    match tokio::time::timeout(limit, platform.announce(announcement)).await {
        Ok(Ok(())) => {
            tracing::debug!("📢 Announced in channel {}", announcement.channel_id);
            true
        }
        Ok(Err(e)) => {
            tracing::warn!(
                "⚠️ {} announcement to channel {} failed: {e}",
                platform.name(),
                announcement.channel_id
            );
            false
        }
        Err(_) => {
            tracing::warn!(
                "⚠️ {} announcement to channel {} timed out after {}s",
                platform.name(),
                announcement.channel_id,
                limit.as_secs()
            );
            false
        }
    }
}

/// Direct-message a member. Returns whether it was delivered.
pub async fn deliver_dm(platform: &dyn ChatPlatform, member: MemberId, text: &str, limit: Duration) -> bool {
    match tokio::time::timeout(limit, platform.direct_message(member, text)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!("⚠️ DM to {member} failed: {e}");
            false
        }
        Err(_) => {
            tracing::warn!("⚠️ DM to {member} timed out after {}s", limit.as_secs());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use giftbox_core::rules::EligibilityRules;
    use giftbox_core::types::EventKey;

    fn giveaway() -> Giveaway {
        let mut gw = Giveaway::new(
            EventKey::new(1, 2, 3),
            9,
            "Nitro",
            3,
            Utc::now(),
            EligibilityRules::default(),
        );
        gw.entrants.extend([4, 5]);
        gw
    }

    fn outcome(winners: Vec<MemberId>, requested: u32) -> DrawOutcome {
        DrawOutcome {
            insufficient: winners.len() < requested as usize,
            eligible: winners.len(),
            winners,
            requested,
            excluded: Vec::new(),
        }
    }

    #[test]
    fn test_end_announcement() {
        let guild = GuildConfig::new(1);
        let gw = giveaway();

        let full = end_announcement(&gw, &outcome(vec![4, 5, 6], 3), &guild);
        assert_eq!(full.content, "Congratulations <@4>, <@5>, <@6>! You won Nitro!");
        assert_eq!(full.reply_to, Some(3));
        assert_eq!(full.channel_id, 2);

        let short = end_announcement(&gw, &outcome(vec![4, 5], 3), &guild);
        assert!(short.content.contains("Only 2 of 3 winner(s)"));

        let none = end_announcement(&gw, &outcome(vec![], 3), &guild);
        assert_eq!(none.content, "Could not pick any winners for the giveaway of **Nitro**!");
    }

    #[test]
    fn test_dms_use_guild_templates() {
        let mut guild = GuildConfig::new(1);
        guild.dm_message = "GG {winner}, {prize} is yours".into();
        let gw = giveaway();

        let dm = winner_dm(&gw, &guild, 4, &[4]);
        assert!(dm.starts_with("GG <@4>, Nitro is yours"));
        assert!(dm.ends_with("https://discord.com/channels/1/2/3"));

        let host = host_dm(&gw, &guild, &[]);
        assert!(host.contains("Winners: nobody"));
    }

    #[test]
    fn test_log_announcement_needs_channel() {
        let mut guild = GuildConfig::new(1);
        let gw = giveaway();
        assert!(log_announcement(&gw, &guild, &outcome(vec![4], 1)).is_none());

        guild.logging = Some(77);
        let log = log_announcement(&gw, &guild, &outcome(vec![4], 1)).unwrap();
        assert_eq!(log.channel_id, 77);
        assert!(log.content.contains("Winners: <@4>"));
        assert!(log.content.contains("Entrants: 2 (1 eligible)"));
    }

    #[test]
    fn test_giveaway_message_lists_requirements() {
        let guild = GuildConfig::new(1);
        let mut gw = giveaway();
        gw.rules.required_roles.insert(10);
        gw.rules.multiplier_roles.insert(11, 2);
        gw.rules.messages_required = Some(5);

        let text = giveaway_message(&gw, &guild, None);
        assert!(text.starts_with("🎉 **GIVEAWAY** 🎉"));
        assert!(text.contains("Required roles: <@&10>"));
        assert!(text.contains("<@&11>: 2x entries"));
        assert!(text.contains("Messages required: 5"));
    }

    #[test]
    fn test_giveaway_message_pings_role_first() {
        let guild = GuildConfig::new(1);
        let text = giveaway_message(&giveaway(), &guild, Some(77));
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("<@&77>"));
        assert_eq!(lines.next(), Some("🎉 **GIVEAWAY** 🎉"));
    }

    #[test]
    fn test_reminder_announcement() {
        let timer = Timer::reminder(EventKey::new(1, 2, 3), 8, "Raid", Utc::now());
        let ann = reminder_announcement(&timer);
        assert_eq!(ann.content, "<@8> The timer for **Raid** has ended.");
        assert_eq!(ann.reply_to, Some(3));
    }
}

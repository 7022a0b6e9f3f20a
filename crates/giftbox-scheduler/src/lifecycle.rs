//! Lifecycle Coordinator: runs the end-of-event and reroll sequences and
//! every operator-facing operation on giveaways, raffles and donations.
//!
//! ```text
//! timer fired ─► re-read giveaway ─► ended? stop
//!                  └─► resolve roles/activity ─► filter ─► weigh ─► select
//!                        └─► persist ended + winners (+ donation credits)
//!                              └─► announce / DM / log (best effort)
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use giftbox_core::config::GiftboxConfig;
use giftbox_core::donation::{DonationAction, DonationConfig, RoleDelta};
use giftbox_core::error::{GiftboxError, Result};
use giftbox_core::giveaway::{DonationLink, Giveaway, HostStats};
use giftbox_core::rules::EligibilityRules;
use giftbox_core::settings::{ChannelConfig, GuildConfig};
use giftbox_core::templates::mention;
use giftbox_core::traits::{ActivityService, ActivitySnapshot, ChatPlatform};
use giftbox_core::types::{ChannelId, EventKey, GuildId, MemberId, MessageId, RoleId};
use giftbox_draw::eligibility::{self, Eligibility, ExclusionReason, MemberSnapshot};
use giftbox_draw::raffle::Raffle;
use giftbox_draw::selector::WeightedSelector;
use giftbox_draw::weights::resolve_weight;

use crate::engine::{TimerHandler, TimerSignal};
use crate::notify;
use crate::persistence::GiftboxDb;
use crate::timers::{Timer, TimerKind};

/// Result of one selection run. Too few eligible entrants is an outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrawOutcome {
    /// Draw order.
    pub winners: Vec<MemberId>,
    pub requested: u32,
    pub eligible: usize,
    pub excluded: Vec<(MemberId, ExclusionReason)>,
    pub insufficient: bool,
}

/// Which previous winners a reroll may not pick again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerollExclusion {
    PreviousWinners,
    Members(BTreeSet<MemberId>),
    Nobody,
}

/// Everything needed to schedule a giveaway.
#[derive(Debug, Clone)]
pub struct GiveawayRequest {
    pub key: EventKey,
    pub host_id: MemberId,
    pub prize: String,
    pub winner_count: u32,
    pub ends_at: DateTime<Utc>,
    pub extra_message_id: Option<MessageId>,
    pub sponsor_id: Option<MemberId>,
    /// Layered over the guild/channel role defaults.
    pub rules: EligibilityRules,
    pub donation: Option<DonationLink>,
}

impl GiveawayRequest {
    pub fn new(key: EventKey, host_id: MemberId, prize: &str, winner_count: u32, ends_at: DateTime<Utc>) -> Self {
        Self {
            key,
            host_id,
            prize: prize.to_string(),
            winner_count,
            ends_at,
            extra_message_id: None,
            sponsor_id: None,
            rules: EligibilityRules::default(),
            donation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deputy {
    Member(MemberId),
    Role(RoleId),
}

/// New ledger total plus the autorole adjustments it implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonationUpdate {
    pub total: i64,
    pub roles: RoleDelta,
}

pub struct Coordinator {
    db: Arc<GiftboxDb>,
    platform: Arc<dyn ChatPlatform>,
    activity: Arc<dyn ActivityService>,
    signal: TimerSignal,
    config: GiftboxConfig,
    selector: Mutex<WeightedSelector>,
    /// Caps member lookups in flight across all draws.
    lookups: Arc<Semaphore>,
    /// Last counted message per (giveaway, member).
    cooldowns: Mutex<HashMap<(EventKey, MemberId), Instant>>,
}

const COOLDOWN_PRUNE_AT: usize = 4096;

impl Coordinator {
    pub fn new(
        db: Arc<GiftboxDb>,
        platform: Arc<dyn ChatPlatform>,
        activity: Arc<dyn ActivityService>,
        signal: TimerSignal,
        config: GiftboxConfig,
    ) -> Self {
        let lookups = Arc::new(Semaphore::new(config.notify.lookup_limit()));
        Self {
            db,
            platform,
            activity,
            signal,
            config,
            selector: Mutex::new(WeightedSelector::new()),
            lookups,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the random source, e.g. with a seeded one.
    pub fn with_selector(mut self, selector: WeightedSelector) -> Self {
        self.selector = Mutex::new(selector);
        self
    }

    pub fn db(&self) -> &Arc<GiftboxDb> {
        &self.db
    }

    fn notify_timeout(&self) -> Duration {
        self.config.notify.timeout()
    }

    // ─── Configs ──────────────────────────────────────────────

    pub fn guild_config(&self, guild_id: GuildId) -> Result<GuildConfig> {
        self.db.guild_config(guild_id)
    }

    pub fn save_guild_config(&self, config: &GuildConfig) -> Result<()> {
        config.effective_rules(None).validate()?;
        self.db.save_guild_config(config)
    }

    pub fn set_channel_config(&self, config: &ChannelConfig) -> Result<()> {
        let guild = self.db.guild_config(config.guild_id)?;
        guild.effective_rules(Some(config)).validate()?;
        self.db.save_channel_config(config, self.config.limits.max_channel_configs)
    }

    pub fn remove_channel_config(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<bool> {
        self.db.delete_channel_config(guild_id, channel_id)
    }

    /// Start message for a giveaway, pinging the channel's or guild's role.
    pub fn giveaway_message(&self, giveaway: &Giveaway) -> Result<String> {
        let key = giveaway.key;
        let guild = self.db.guild_config(key.guild_id)?;
        let channel = self.db.channel_config(key.guild_id, key.channel_id)?;
        Ok(notify::giveaway_message(giveaway, &guild, guild.ping_for(channel.as_ref())))
    }

    /// Forget a guild entirely (the bot left it).
    pub fn delete_guild(&self, guild_id: GuildId) -> Result<()> {
        self.db.delete_guild(guild_id)?;
        self.signal.wake();
        tracing::info!("🧹 Removed all data for guild {guild_id}");
        Ok(())
    }

    // ─── Giveaway lifecycle ───────────────────────────────────

    /// Validate and persist a giveaway together with its timer.
    pub fn start_giveaway(&self, request: GiveawayRequest) -> Result<Giveaway> {
        let key = request.key;
        let guild = self.db.guild_config(key.guild_id)?;
        let channel = self.db.channel_config(key.guild_id, key.channel_id)?;
        let rules = guild.effective_rules(channel.as_ref()).overlay(request.rules);

        let mut giveaway = Giveaway::new(
            key,
            request.host_id,
            &request.prize,
            request.winner_count,
            request.ends_at,
            rules,
        );
        giveaway.extra_message_id = request.extra_message_id;
        giveaway.sponsor_id = request.sponsor_id;
        giveaway.donation = request.donation;
        giveaway.validate()?;
        if giveaway.ends_at <= Utc::now() {
            return Err(GiftboxError::InvalidRules("end time must be in the future".into()));
        }

        self.db.create_giveaway(&giveaway)?;
        self.signal.wake();
        tracing::info!(
            "🎉 Giveaway started: {} for '{}' ({} winner(s), ends {})",
            key,
            giveaway.prize,
            giveaway.winner_count,
            giveaway.ends_at.to_rfc3339()
        );
        Ok(giveaway)
    }

    pub fn join(&self, key: EventKey, member: MemberId) -> Result<bool> {
        let joined = self.db.add_entrant(key, member)?;
        if joined {
            tracing::debug!("➕ {member} joined {key}");
        }
        Ok(joined)
    }

    pub fn leave(&self, key: EventKey, member: MemberId) -> Result<bool> {
        let left = self.db.remove_entrant(key, member)?;
        if left {
            tracing::debug!("➖ {member} left {key}");
        }
        Ok(left)
    }

    /// Run the eligibility filter with live data, e.g. to refuse a join.
    pub async fn check_entry(&self, key: EventKey, member: MemberId) -> Result<Eligibility> {
        let giveaway = self
            .db
            .giveaway(key)?
            .ok_or_else(|| GiftboxError::NotFound(format!("giveaway {key}")))?;
        let snapshot = self.snapshot(&giveaway, member).await;
        Ok(eligibility::check(&snapshot, &giveaway.rules))
    }

    /// Count a message toward every open giveaway in the guild that tracks
    /// messages in `channel`. Returns how many giveaways counted it.
    pub fn record_message(&self, guild_id: GuildId, channel_id: ChannelId, member: MemberId) -> Result<usize> {
        let cooldown = Duration::from_secs(self.config.draw.message_cooldown_secs);
        let now = Instant::now();
        let mut counted = 0;

        for giveaway in self.db.open_giveaways(guild_id)? {
            if giveaway.rules.message_threshold().is_none() || !giveaway.rules.counts_channel(channel_id) {
                continue;
            }
            if !self.take_cooldown(giveaway.key, member, now, cooldown) {
                continue;
            }
            match self.db.bump_message_count(giveaway.key, member) {
                Ok(_) => counted += 1,
                // Ended or cancelled since the listing.
                Err(GiftboxError::InvalidState(_) | GiftboxError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(counted)
    }

    fn take_cooldown(&self, key: EventKey, member: MemberId, now: Instant, cooldown: Duration) -> bool {
        let mut map = self.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        if map.len() > COOLDOWN_PRUNE_AT {
            map.retain(|_, at| now.duration_since(*at) < cooldown);
        }
        match map.get(&(key, member)) {
            Some(last) if now.duration_since(*last) < cooldown => false,
            _ => {
                map.insert((key, member), now);
                true
            }
        }
    }

    /// End an open giveaway early by making its timer due now. The end itself
    /// still runs through the timer engine.
    pub fn end_now(&self, key: EventKey) -> Result<()> {
        let giveaway = self
            .db
            .giveaway(key)?
            .ok_or_else(|| GiftboxError::NotFound(format!("giveaway {key}")))?;
        if giveaway.ended {
            return Err(GiftboxError::InvalidState(format!("giveaway {key} has already ended")));
        }
        self.db.end_giveaway_at(key, Utc::now())?;
        self.signal.wake();
        tracing::info!("⏩ Giveaway {key} set to end now");
        Ok(())
    }

    /// End-of-event sequence. `Ok(None)` when the giveaway is already ended or
    /// gone, so a duplicate fire changes nothing.
    pub async fn end(&self, key: EventKey) -> Result<Option<DrawOutcome>> {
        let mut retried = false;
        loop {
            let Some(giveaway) = self.db.giveaway(key)? else {
                tracing::debug!("⏭️ Giveaway {key} no longer exists");
                return Ok(None);
            };
            if giveaway.ended {
                tracing::debug!("⏭️ Giveaway {key} already ended");
                return Ok(None);
            }

            let outcome = self
                .draw(&giveaway, &BTreeSet::new(), giveaway.winner_count)
                .await;
            let credits = giveaway.donation_credits(&outcome.winners);
            let category = giveaway.donation.as_ref().map(|d| d.category.as_str());

            match self.db.finish_giveaway(key, &outcome.winners, &credits, category) {
                Ok(()) => {
                    if outcome.insufficient {
                        tracing::info!(
                            "🏁 Giveaway {key} ended with insufficient entrants: {} of {} winner(s)",
                            outcome.winners.len(),
                            outcome.requested
                        );
                    } else {
                        tracing::info!("🏁 Giveaway {key} ended with {} winner(s)", outcome.winners.len());
                    }
                    self.announce_end(&giveaway, &outcome).await;
                    return Ok(Some(outcome));
                }
                Err(e) if e.is_conflict() && !retried => {
                    tracing::warn!("⚠️ {e}; re-reading giveaway {key}");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn default_exclusion(&self) -> RerollExclusion {
        if self.config.draw.exclude_previous_winners {
            RerollExclusion::PreviousWinners
        } else {
            RerollExclusion::Nobody
        }
    }

    /// Pick new winners from the recorded entrants of an ended giveaway.
    /// With nobody left to pick, prior winners stay untouched.
    pub async fn reroll(&self, key: EventKey, count: Option<u32>, exclusion: RerollExclusion) -> Result<DrawOutcome> {
        let giveaway = self
            .db
            .giveaway(key)?
            .ok_or_else(|| GiftboxError::NotFound(format!("giveaway {key}")))?;
        if !giveaway.ended {
            return Err(GiftboxError::InvalidState(format!("giveaway {key} has not ended yet")));
        }

        let exclude = match exclusion {
            RerollExclusion::PreviousWinners => giveaway.winners.iter().copied().collect(),
            RerollExclusion::Members(members) => members,
            RerollExclusion::Nobody => BTreeSet::new(),
        };
        let count = count.unwrap_or(giveaway.winner_count).max(1);
        let outcome = self.draw(&giveaway, &exclude, count).await;

        if outcome.winners.is_empty() {
            tracing::info!("🎲 Reroll of {key}: no eligible entrants left, winners unchanged");
            return Ok(outcome);
        }

        self.db.replace_winners(key, &outcome.winners)?;
        tracing::info!("🎲 Reroll of {key}: {} new winner(s)", outcome.winners.len());

        let guild = self.guild_or_default(key.guild_id);
        notify::deliver(
            self.platform.as_ref(),
            &notify::reroll_announcement(&giveaway, &outcome, &guild),
            self.notify_timeout(),
        )
        .await;
        if guild.dm_winner {
            for winner in &outcome.winners {
                let text = notify::winner_dm(&giveaway, &guild, *winner, &outcome.winners);
                notify::deliver_dm(self.platform.as_ref(), *winner, &text, self.notify_timeout()).await;
            }
        }
        Ok(outcome)
    }

    /// Delete a giveaway and its timer. A racing end sees it gone and stops.
    pub fn cancel(&self, key: EventKey) -> Result<bool> {
        let removed = self.db.delete_giveaway(key)?;
        if removed {
            self.signal.wake();
            tracing::info!("🗑️ Giveaway {key} cancelled");
        }
        Ok(removed)
    }

    pub fn schedule_reminder(
        &self,
        key: EventKey,
        author_id: MemberId,
        title: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Timer> {
        if title.trim().is_empty() {
            return Err(GiftboxError::InvalidRules("timer title must not be empty".into()));
        }
        let timer = Timer::reminder(key, author_id, title, expires_at);
        self.db.save_timer(&timer)?;
        self.signal.wake();
        tracing::info!("📅 Reminder '{title}' scheduled for {}", expires_at.to_rfc3339());
        Ok(timer)
    }

    pub fn open_giveaways(&self, guild_id: GuildId) -> Result<Vec<Giveaway>> {
        self.db.open_giveaways(guild_id)
    }

    pub fn top_hosts(&self, guild_id: GuildId, limit: usize) -> Result<Vec<HostStats>> {
        self.db.top_hosts(guild_id, limit)
    }

    // ─── Selection ────────────────────────────────────────────

    /// Filter, weigh and select from one consistent entrant snapshot.
    async fn draw(&self, giveaway: &Giveaway, exclude: &BTreeSet<MemberId>, count: u32) -> DrawOutcome {
        let candidates: Vec<MemberId> = giveaway
            .entrants
            .iter()
            .filter(|m| !exclude.contains(m))
            .copied()
            .collect();
        let snapshots = self.resolve_members(giveaway, &candidates).await;

        let mut pool = Vec::with_capacity(snapshots.len());
        let mut excluded = Vec::new();
        for snapshot in snapshots {
            match eligibility::check(&snapshot, &giveaway.rules) {
                Eligibility::Eligible => {
                    let bonus = if giveaway.sponsor_id == Some(snapshot.member_id) {
                        self.config.draw.sponsor_bonus
                    } else {
                        0
                    };
                    let roles = snapshot.roles.unwrap_or_default();
                    pool.push((
                        snapshot.member_id,
                        resolve_weight(&roles, &giveaway.rules.multiplier_roles, bonus),
                    ));
                }
                Eligibility::Excluded(reason) => {
                    tracing::debug!("🚫 {} excluded from {}: {reason}", snapshot.member_id, giveaway.key);
                    excluded.push((snapshot.member_id, reason));
                }
            }
        }

        let winners = {
            let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
            selector.select(&pool, count as usize)
        };

        DrawOutcome {
            insufficient: pool.len() < count as usize,
            eligible: pool.len(),
            requested: count,
            winners,
            excluded,
        }
    }

    async fn snapshot(&self, giveaway: &Giveaway, member: MemberId) -> MemberSnapshot {
        let guild_id = giveaway.key.guild_id;
        let roles = lookup_roles(self.platform.as_ref(), guild_id, member, self.notify_timeout()).await;
        let activity = if giveaway.rules.has_activity_thresholds() {
            lookup_activity(self.activity.as_ref(), guild_id, member, self.config.activity.timeout()).await
        } else {
            ActivitySnapshot::default()
        };
        MemberSnapshot {
            member_id: member,
            roles,
            messages: giveaway.message_count(member),
            activity,
        }
    }

    /// Look up every candidate concurrently, each call bounded by a timeout.
    async fn resolve_members(&self, giveaway: &Giveaway, members: &[MemberId]) -> Vec<MemberSnapshot> {
        let guild_id = giveaway.key.guild_id;
        let wants_activity = giveaway.rules.has_activity_thresholds();
        let role_limit = self.notify_timeout();
        let activity_limit = self.config.activity.timeout();

        let mut lookups = JoinSet::new();
        for member in members.iter().copied() {
            let platform = Arc::clone(&self.platform);
            let activity = Arc::clone(&self.activity);
            let permits = Arc::clone(&self.lookups);
            let messages = giveaway.message_count(member);
            lookups.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                let roles = lookup_roles(platform.as_ref(), guild_id, member, role_limit).await;
                let activity = if wants_activity {
                    lookup_activity(activity.as_ref(), guild_id, member, activity_limit).await
                } else {
                    ActivitySnapshot::default()
                };
                MemberSnapshot {
                    member_id: member,
                    roles,
                    messages,
                    activity,
                }
            });
        }

        let mut snapshots = Vec::with_capacity(members.len());
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!("⚠️ Member lookup task failed: {e}"),
            }
        }
        snapshots.sort_by_key(|s| s.member_id);
        snapshots
    }

    // ─── Notifications ────────────────────────────────────────

    fn guild_or_default(&self, guild_id: GuildId) -> GuildConfig {
        self.db.guild_config(guild_id).unwrap_or_else(|e| {
            tracing::warn!("⚠️ Using default templates for guild {guild_id}: {e}");
            GuildConfig::new(guild_id)
        })
    }

    async fn announce_end(&self, giveaway: &Giveaway, outcome: &DrawOutcome) {
        let guild = self.guild_or_default(giveaway.key.guild_id);
        let platform = self.platform.as_ref();
        let limit = self.notify_timeout();

        notify::deliver(platform, &notify::end_announcement(giveaway, outcome, &guild), limit).await;
        if guild.dm_winner {
            for winner in &outcome.winners {
                let text = notify::winner_dm(giveaway, &guild, *winner, &outcome.winners);
                notify::deliver_dm(platform, *winner, &text, limit).await;
            }
        }
        if guild.dm_host {
            let text = notify::host_dm(giveaway, &guild, &outcome.winners);
            notify::deliver_dm(platform, giveaway.host_id, &text, limit).await;
        }
        if let Some(log) = notify::log_announcement(giveaway, &guild, outcome) {
            notify::deliver(platform, &log, limit).await;
        }
    }

    // ─── Raffles ──────────────────────────────────────────────

    pub fn create_raffle(&self, guild_id: GuildId, name: &str) -> Result<Raffle> {
        if name.trim().is_empty() {
            return Err(GiftboxError::Raffle("raffle name must not be empty".into()));
        }
        let raffle = Raffle::new(guild_id, name);
        self.db.create_raffle(&raffle)?;
        tracing::info!("🎟️ Raffle '{name}' created in guild {guild_id}");
        Ok(raffle)
    }

    pub fn delete_raffle(&self, guild_id: GuildId, name: &str) -> Result<bool> {
        self.db.delete_raffle(guild_id, name)
    }

    pub fn raffle(&self, guild_id: GuildId, name: &str) -> Result<Raffle> {
        self.db
            .raffle(guild_id, name)?
            .ok_or_else(|| GiftboxError::NotFound(format!("raffle '{name}'")))
    }

    pub fn add_tickets(&self, guild_id: GuildId, name: &str, member: MemberId, amount: u64) -> Result<u64> {
        self.db.update_raffle(guild_id, name, |r| r.add_tickets(member, amount))
    }

    pub fn remove_tickets(&self, guild_id: GuildId, name: &str, member: MemberId, amount: u64) -> Result<u64> {
        self.db.update_raffle(guild_id, name, |r| r.remove_tickets(member, amount))
    }

    pub fn add_deputy(&self, guild_id: GuildId, name: &str, deputy: Deputy) -> Result<()> {
        let limits = &self.config.limits;
        self.db.update_raffle(guild_id, name, |r| match deputy {
            Deputy::Member(id) => r.add_deputy_member(id, limits.max_deputy_members),
            Deputy::Role(id) => r.add_deputy_role(id, limits.max_deputy_roles),
        })
    }

    pub fn remove_deputy(&self, guild_id: GuildId, name: &str, deputy: Deputy) -> Result<bool> {
        self.db.update_raffle(guild_id, name, |r| {
            Ok(match deputy {
                Deputy::Member(id) => r.remove_deputy_member(id),
                Deputy::Role(id) => r.remove_deputy_role(id),
            })
        })
    }

    /// Whether `member` may hand out tickets for the raffle.
    pub async fn is_deputy(&self, guild_id: GuildId, name: &str, member: MemberId) -> Result<bool> {
        let raffle = self.raffle(guild_id, name)?;
        if raffle.deputy_members.contains(&member) {
            return Ok(true);
        }
        let roles = lookup_roles(self.platform.as_ref(), guild_id, member, self.notify_timeout())
            .await
            .unwrap_or_default();
        Ok(raffle.is_deputy(member, &roles))
    }

    /// Draw (or with `redraw`, re-draw) the raffle winner.
    pub fn draw_raffle(&self, guild_id: GuildId, name: &str, redraw: bool) -> Result<MemberId> {
        let winner = self.db.update_raffle(guild_id, name, |r| {
            let mut selector = self.selector.lock().unwrap_or_else(|e| e.into_inner());
            r.draw(&mut selector, redraw)
        })?;
        tracing::info!("🎟️ Raffle '{name}' winner: {winner}");
        Ok(winner)
    }

    // ─── Donations ────────────────────────────────────────────

    pub fn set_donation_config(&self, config: &DonationConfig) -> Result<()> {
        if config.category.trim().is_empty() {
            return Err(GiftboxError::Donation("category must not be empty".into()));
        }
        self.db.save_donation_config(config)
    }

    pub fn remove_donation_config(&self, guild_id: GuildId, category: &str) -> Result<bool> {
        self.db.delete_donation_config(guild_id, category)
    }

    /// Amend a member's total and work out their autorole changes.
    pub async fn adjust_donation(
        &self,
        guild_id: GuildId,
        category: &str,
        member: MemberId,
        action: DonationAction,
    ) -> Result<DonationUpdate> {
        let config = self
            .db
            .donation_config(guild_id, category)?
            .ok_or_else(|| GiftboxError::NotFound(format!("donation category '{category}'")))?;
        let total = self.db.adjust_donation(guild_id, category, member, action)?;
        tracing::info!("💰 {member} now has {} in '{category}'", config.format_amount(total));

        let roles = match lookup_roles(self.platform.as_ref(), guild_id, member, self.notify_timeout()).await {
            Some(held) => config.role_changes(total, &held),
            None => RoleDelta::default(),
        };

        if let Some(channel) = config.logging {
            let verb = match action {
                DonationAction::Add(_) => "added to",
                DonationAction::Remove(_) => "removed from",
            };
            let amount = match action {
                DonationAction::Add(n) | DonationAction::Remove(n) => n,
            };
            let text = format!(
                "{} {verb} {}: total {}",
                config.format_amount(amount),
                mention(member),
                config.format_amount(total)
            );
            notify::deliver(
                self.platform.as_ref(),
                &notify::channel_message(channel, text),
                self.notify_timeout(),
            )
            .await;
        }

        Ok(DonationUpdate { total, roles })
    }

    pub fn reset_donations(&self, guild_id: GuildId, category: &str) -> Result<usize> {
        let removed = self.db.reset_donations(guild_id, category)?;
        tracing::info!("🧹 Reset '{category}' donations in guild {guild_id} ({removed} member(s))");
        Ok(removed)
    }

    pub fn donation_leaderboard(
        &self,
        guild_id: GuildId,
        category: &str,
        limit: usize,
    ) -> Result<Vec<giftbox_core::donation::Donation>> {
        self.db.donation_leaderboard(guild_id, category, limit)
    }
}

#[async_trait]
impl TimerHandler for Coordinator {
    async fn on_timer(&self, timer: &Timer) -> Result<()> {
        match timer.kind {
            TimerKind::Giveaway => self.end(timer.key).await.map(|_| ()),
            TimerKind::Reminder => {
                notify::deliver(
                    self.platform.as_ref(),
                    &notify::reminder_announcement(timer),
                    self.notify_timeout(),
                )
                .await;
                Ok(())
            }
        }
    }
}

/// Role set or `None` when unavailable; failures are logged, never fatal.
async fn lookup_roles(
    platform: &dyn ChatPlatform,
    guild_id: GuildId,
    member: MemberId,
    limit: Duration,
) -> Option<BTreeSet<RoleId>> {
    match tokio::time::timeout(limit, platform.member_roles(guild_id, member)).await {
        Ok(Ok(Some(roles))) => Some(roles),
        Ok(Ok(None)) => {
            tracing::debug!("👤 {member} is no longer in guild {guild_id}");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!("⚠️ Role lookup for {member} failed: {e}");
            None
        }
        Err(_) => {
            tracing::warn!("⚠️ Role lookup for {member} timed out after {}s", limit.as_secs());
            None
        }
    }
}

/// Activity totals; an unreachable service counts as zero.
async fn lookup_activity(
    service: &dyn ActivityService,
    guild_id: GuildId,
    member: MemberId,
    limit: Duration,
) -> ActivitySnapshot {
    match tokio::time::timeout(limit, service.snapshot(guild_id, member)).await {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            tracing::warn!("⚠️ Activity lookup for {member} failed: {e}");
            ActivitySnapshot::default()
        }
        Err(_) => {
            tracing::warn!("⚠️ Activity lookup for {member} timed out after {}s", limit.as_secs());
            ActivitySnapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TimerEngine;
    use giftbox_core::giveaway::CreditTarget;
    use giftbox_core::traits::Announcement;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakePlatform {
        roles: Mutex<HashMap<MemberId, BTreeSet<RoleId>>>,
        announcements: Mutex<Vec<Announcement>>,
        dms: Mutex<Vec<(MemberId, String)>>,
        broken_lookups: HashSet<MemberId>,
        fail_announce: bool,
    }

    impl FakePlatform {
        fn with_roles(roles: &[(MemberId, &[RoleId])]) -> Self {
            let platform = Self::default();
            {
                let mut map = platform.roles.lock().unwrap();
                for (member, held) in roles {
                    map.insert(*member, held.iter().copied().collect());
                }
            }
            platform
        }

        fn announcements(&self) -> Vec<Announcement> {
            self.announcements.lock().unwrap().clone()
        }

        fn dms(&self) -> Vec<(MemberId, String)> {
            self.dms.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatPlatform for FakePlatform {
        fn name(&self) -> &str {
            "fake"
        }

        async fn member_roles(&self, _guild: GuildId, member: MemberId) -> Result<Option<BTreeSet<RoleId>>> {
            if self.broken_lookups.contains(&member) {
                return Err(GiftboxError::Platform("lookup failed".into()));
            }
            Ok(Some(self.roles.lock().unwrap().get(&member).cloned().unwrap_or_default()))
        }

        async fn announce(&self, announcement: &Announcement) -> Result<()> {
            if self.fail_announce {
                return Err(GiftboxError::Platform("channel gone".into()));
            }
            self.announcements.lock().unwrap().push(announcement.clone());
            Ok(())
        }

        async fn direct_message(&self, member: MemberId, text: &str) -> Result<()> {
            self.dms.lock().unwrap().push((member, text.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeActivity {
        totals: HashMap<MemberId, ActivitySnapshot>,
    }

    #[async_trait]
    impl ActivityService for FakeActivity {
        async fn snapshot(&self, _guild: GuildId, member: MemberId) -> Result<ActivitySnapshot> {
            self.totals
                .get(&member)
                .copied()
                .ok_or_else(|| GiftboxError::Platform("activity service down".into()))
        }
    }

    fn coordinator_with(platform: Arc<FakePlatform>, config: GiftboxConfig) -> Coordinator {
        let db = Arc::new(GiftboxDb::open_in_memory().unwrap());
        let activity = Arc::new(FakeActivity {
            totals: HashMap::from([(1, ActivitySnapshot { total: 500, recent: 50 })]),
        });
        Coordinator::new(db, platform, activity, TimerSignal::new(), config)
            .with_selector(WeightedSelector::seeded(11))
    }

    fn coordinator(platform: Arc<FakePlatform>) -> Coordinator {
        coordinator_with(platform, GiftboxConfig::default())
    }

    fn key() -> EventKey {
        EventKey::new(1, 10, 100)
    }

    fn request(winner_count: u32) -> GiveawayRequest {
        GiveawayRequest::new(key(), 99, "Nitro", winner_count, Utc::now() + chrono::Duration::minutes(10))
    }

    fn start_with(coord: &Coordinator, req: GiveawayRequest, entrants: &[MemberId]) {
        coord.start_giveaway(req).unwrap();
        for member in entrants {
            coord.join(key(), *member).unwrap();
        }
    }

    #[tokio::test]
    async fn test_duplicate_end_is_noop() {
        let platform = Arc::new(FakePlatform::default());
        let coord = coordinator(platform.clone());
        start_with(&coord, request(1), &[1, 2, 3]);

        let outcome = coord.end(key()).await.unwrap().unwrap();
        assert_eq!(outcome.winners.len(), 1);
        assert!(!outcome.insufficient);
        let persisted = coord.db().giveaway(key()).unwrap().unwrap();
        assert!(persisted.ended);
        assert_eq!(persisted.winners, outcome.winners);

        assert!(coord.end(key()).await.unwrap().is_none());
        let again = coord.db().giveaway(key()).unwrap().unwrap();
        assert_eq!(again.winners, outcome.winners);
        assert_eq!(platform.announcements().len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_entrants_is_an_outcome() {
        let platform = Arc::new(FakePlatform::default());
        let coord = coordinator(platform.clone());
        start_with(&coord, request(5), &[1, 2]);

        let outcome = coord.end(key()).await.unwrap().unwrap();
        assert_eq!(outcome.winners.len(), 2);
        assert!(outcome.insufficient);
        assert!(platform.announcements()[0].content.contains("Only 2 of 5 winner(s)"));
    }

    #[tokio::test]
    async fn test_no_entrants_announces_no_winners() {
        let platform = Arc::new(FakePlatform::default());
        let coord = coordinator(platform.clone());
        start_with(&coord, request(1), &[]);

        let outcome = coord.end(key()).await.unwrap().unwrap();
        assert!(outcome.winners.is_empty());
        assert_eq!(
            platform.announcements()[0].content,
            "Could not pick any winners for the giveaway of **Nitro**!"
        );
    }

    #[tokio::test]
    async fn test_eligibility_applied_at_end() {
        let platform = Arc::new(FakePlatform::with_roles(&[(1, &[9]), (2, &[7, 9]), (3, &[])]));
        let coord = coordinator(platform);
        let mut req = request(3);
        req.rules.blacklisted_roles.insert(9);
        req.rules.bypass_roles.insert(7);
        req.rules.required_roles.insert(5);
        start_with(&coord, req, &[1, 2, 3]);

        let outcome = coord.end(key()).await.unwrap().unwrap();
        assert_eq!(outcome.winners, vec![2]);
        assert!(outcome.insufficient);
        assert_eq!(
            outcome.excluded,
            vec![(1, ExclusionReason::BlacklistedRole), (3, ExclusionReason::MissingRequiredRole)]
        );
    }

    #[tokio::test]
    async fn test_lookup_failures_exclude_member() {
        let mut platform = FakePlatform::default();
        platform.broken_lookups.insert(2);
        let coord = coordinator(Arc::new(platform));
        let mut req = request(2);
        req.rules.activity_total = Some(100);
        start_with(&coord, req, &[1, 2, 3]);

        let outcome = coord.end(key()).await.unwrap().unwrap();
        // 1 has activity, 2's roles are unavailable, 3's activity lookup errors.
        assert_eq!(outcome.winners, vec![1]);
        assert!(outcome.excluded.contains(&(2, ExclusionReason::DataUnavailable)));
        assert!(outcome.excluded.contains(&(3, ExclusionReason::InsufficientActivityTotal)));
    }

    #[tokio::test]
    async fn test_reroll_excludes_previous_winners() {
        let platform = Arc::new(FakePlatform::default());
        let coord = coordinator(platform.clone());
        start_with(&coord, request(1), &[1, 2, 3]);

        coord.end(key()).await.unwrap();
        for _ in 0..2 {
            let previous = coord.db().giveaway(key()).unwrap().unwrap().winners;
            let outcome = coord
                .reroll(key(), None, RerollExclusion::PreviousWinners)
                .await
                .unwrap();
            assert_eq!(outcome.winners.len(), 1);
            assert!(!previous.contains(&outcome.winners[0]));
        }
        assert_eq!(platform.announcements().len(), 3);
    }

    #[tokio::test]
    async fn test_reroll_without_alternatives_keeps_winners() {
        let platform = Arc::new(FakePlatform::default());
        let coord = coordinator(platform.clone());
        start_with(&coord, request(1), &[4]);

        assert_eq!(coord.end(key()).await.unwrap().unwrap().winners, vec![4]);
        let outcome = coord.reroll(key(), None, coord.default_exclusion()).await.unwrap();
        assert!(outcome.winners.is_empty());
        assert!(outcome.insufficient);
        assert_eq!(coord.db().giveaway(key()).unwrap().unwrap().winners, vec![4]);
        assert_eq!(platform.announcements().len(), 1);
    }

    #[tokio::test]
    async fn test_reroll_requires_ended() {
        let coord = coordinator(Arc::new(FakePlatform::default()));
        start_with(&coord, request(1), &[1]);
        let err = coord.reroll(key(), None, RerollExclusion::Nobody).await.unwrap_err();
        assert!(matches!(err, GiftboxError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_announce_failure_does_not_unwind_end() {
        let platform = Arc::new(FakePlatform {
            fail_announce: true,
            ..Default::default()
        });
        let coord = coordinator(platform.clone());
        start_with(&coord, request(1), &[1]);

        assert!(coord.end(key()).await.unwrap().is_some());
        assert!(coord.db().giveaway(key()).unwrap().unwrap().ended);
        // DMs still went out.
        assert_eq!(platform.dms().len(), 2);
    }

    #[tokio::test]
    async fn test_dm_toggles() {
        let platform = Arc::new(FakePlatform::default());
        let coord = coordinator(platform.clone());
        let mut guild = coord.guild_config(1).unwrap();
        guild.dm_winner = false;
        coord.save_guild_config(&guild).unwrap();
        start_with(&coord, request(1), &[1]);

        coord.end(key()).await.unwrap();
        let dms = platform.dms();
        assert_eq!(dms.len(), 1);
        assert_eq!(dms[0].0, 99);
    }

    #[tokio::test]
    async fn test_donation_credited_once() {
        let coord = coordinator(Arc::new(FakePlatform::default()));
        let mut req = request(1);
        req.donation = Some(DonationLink {
            category: "coins".into(),
            amount: 30,
            target: CreditTarget::Host,
        });
        start_with(&coord, req, &[1]);

        coord.end(key()).await.unwrap();
        coord.end(key()).await.unwrap();
        assert_eq!(coord.db().donation(1, "coins", 99).unwrap(), 30);
    }

    #[tokio::test]
    async fn test_check_entry() {
        let platform = Arc::new(FakePlatform::with_roles(&[(1, &[5])]));
        let coord = coordinator(platform);
        let mut req = request(1);
        req.rules.required_roles.insert(5);
        start_with(&coord, req, &[]);

        assert!(coord.check_entry(key(), 1).await.unwrap().is_eligible());
        assert_eq!(
            coord.check_entry(key(), 2).await.unwrap(),
            Eligibility::Excluded(ExclusionReason::MissingRequiredRole)
        );
    }

    #[tokio::test]
    async fn test_record_message_cooldown_and_scope() {
        let coord = coordinator(Arc::new(FakePlatform::default()));
        let mut req = request(1);
        req.rules.messages_required = Some(2);
        req.rules.message_channels.insert(10);
        start_with(&coord, req, &[1]);

        assert_eq!(coord.record_message(1, 10, 1).unwrap(), 1);
        assert_eq!(coord.record_message(1, 10, 1).unwrap(), 0);
        assert_eq!(coord.record_message(1, 11, 2).unwrap(), 0);
        assert_eq!(coord.db().giveaway(key()).unwrap().unwrap().message_count(1), 1);

        let outcome = coord.end(key()).await.unwrap().unwrap();
        assert!(outcome.winners.is_empty());
        assert_eq!(outcome.excluded, vec![(1, ExclusionReason::InsufficientMessages)]);
    }

    #[tokio::test]
    async fn test_message_threshold_met_without_cooldown() {
        let mut config = GiftboxConfig::default();
        config.draw.message_cooldown_secs = 0;
        let coord = coordinator_with(Arc::new(FakePlatform::default()), config);
        let mut req = request(1);
        req.rules.messages_required = Some(2);
        start_with(&coord, req, &[1]);

        coord.record_message(1, 55, 1).unwrap();
        coord.record_message(1, 56, 1).unwrap();
        assert_eq!(coord.end(key()).await.unwrap().unwrap().winners, vec![1]);
    }

    #[tokio::test]
    async fn test_cancel_and_end_now() {
        let coord = coordinator(Arc::new(FakePlatform::default()));
        start_with(&coord, request(1), &[1]);

        coord.end_now(key()).unwrap();
        let timer = coord.db().timer(key()).unwrap().unwrap();
        assert!(timer.is_due(Utc::now()));
        let gw = coord.db().giveaway(key()).unwrap().unwrap();
        assert_eq!(gw.ends_at, timer.expires_at);
        assert!(gw.ends_at <= Utc::now());

        assert!(coord.cancel(key()).unwrap());
        assert_eq!(coord.db().host_count(1, 99).unwrap(), 0);
        assert!(coord.db().timer(key()).unwrap().is_none());
        assert!(coord.end(key()).await.unwrap().is_none());
        assert!(coord.end_now(key()).is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_requests() {
        let coord = coordinator(Arc::new(FakePlatform::default()));
        assert!(coord.start_giveaway(request(0)).is_err());

        let mut req = request(1);
        req.ends_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(coord.start_giveaway(req).is_err());

        let mut req = request(1);
        req.rules.multiplier_roles.insert(3, 0);
        assert!(matches!(coord.start_giveaway(req), Err(GiftboxError::InvalidRules(_))));
        assert_eq!(coord.db().timer_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_channel_defaults_flow_into_giveaway() {
        let coord = coordinator(Arc::new(FakePlatform::default()));
        let mut guild = coord.guild_config(1).unwrap();
        guild.multiplier_roles.insert(4, 3);
        coord.save_guild_config(&guild).unwrap();
        let mut channel = ChannelConfig::new(1, 10);
        channel.required_roles.insert(8);
        coord.set_channel_config(&channel).unwrap();

        let gw = coord.start_giveaway(request(1)).unwrap();
        assert_eq!(gw.rules.multiplier_roles.get(&4), Some(&3));
        assert_eq!(gw.rules.required_roles, BTreeSet::from([8]));
    }

    #[tokio::test]
    async fn test_reminder_fires_through_handler() {
        let platform = Arc::new(FakePlatform::default());
        let coord = coordinator(platform.clone());
        let timer = coord
            .schedule_reminder(EventKey::new(1, 2, 3), 5, "Raid", Utc::now())
            .unwrap();

        coord.on_timer(&timer).await.unwrap();
        assert_eq!(
            platform.announcements()[0].content,
            "<@5> The timer for **Raid** has ended."
        );
    }

    #[tokio::test]
    async fn test_reminder_cannot_take_over_giveaway() {
        let coord = coordinator(Arc::new(FakePlatform::default()));
        start_with(&coord, request(1), &[1, 2]);

        let clash = coord.schedule_reminder(key(), 5, "Raid", Utc::now());
        assert!(matches!(clash, Err(GiftboxError::Conflict(_))));
        let timer = coord.db().timer(key()).unwrap().unwrap();
        assert_eq!(timer.kind, TimerKind::Giveaway);

        let reminder_key = EventKey::new(1, 10, 101);
        coord.schedule_reminder(reminder_key, 5, "Raid", Utc::now()).unwrap();
        assert!(matches!(
            coord.schedule_reminder(reminder_key, 5, "Again", Utc::now()),
            Err(GiftboxError::Conflict(_))
        ));

        let outcome = coord.end(key()).await.unwrap().unwrap();
        assert_eq!(outcome.winners.len(), 1);
    }

    /// Records how many member lookups overlap.
    #[derive(Default)]
    struct CountingPlatform {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ChatPlatform for CountingPlatform {
        fn name(&self) -> &str {
            "counting"
        }

        async fn member_roles(&self, _guild: GuildId, _member: MemberId) -> Result<Option<BTreeSet<RoleId>>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(BTreeSet::new()))
        }

        async fn announce(&self, _announcement: &Announcement) -> Result<()> {
            Ok(())
        }

        async fn direct_message(&self, _member: MemberId, _text: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_member_lookups_are_bounded() {
        let platform = Arc::new(CountingPlatform::default());
        let mut config = GiftboxConfig::default();
        config.notify.max_concurrent_lookups = 4;
        let db = Arc::new(GiftboxDb::open_in_memory().unwrap());
        let coord = Coordinator::new(
            db,
            platform.clone(),
            Arc::new(FakeActivity::default()),
            TimerSignal::new(),
            config,
        );
        let entrants: Vec<MemberId> = (1..=40).collect();
        start_with(&coord, request(3), &entrants);

        let outcome = coord.end(key()).await.unwrap().unwrap();
        assert_eq!(outcome.winners.len(), 3);
        assert_eq!(outcome.eligible, 40);
        let peak = platform.peak.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak {peak} exceeded the lookup limit");
        assert!(peak > 1);
    }

    #[tokio::test]
    async fn test_start_message_pings_configured_role() {
        let coord = coordinator(Arc::new(FakePlatform::default()));
        let mut guild = coord.guild_config(1).unwrap();
        guild.ping = Some(50);
        coord.save_guild_config(&guild).unwrap();

        let gw = coord.start_giveaway(request(1)).unwrap();
        assert!(coord.giveaway_message(&gw).unwrap().starts_with("<@&50>\n"));

        let mut channel = ChannelConfig::new(1, 10);
        channel.ping = Some(51);
        coord.set_channel_config(&channel).unwrap();
        assert!(coord.giveaway_message(&gw).unwrap().starts_with("<@&51>\n"));

        let elsewhere = EventKey::new(2, 10, 100);
        let mut req = request(1);
        req.key = elsewhere;
        let other = coord.start_giveaway(req).unwrap();
        assert!(coord.giveaway_message(&other).unwrap().starts_with("🎉"));
    }

    #[tokio::test]
    async fn test_raffle_flow() {
        let platform = Arc::new(FakePlatform::with_roles(&[(20, &[70])]));
        let coord = coordinator(platform);
        coord.create_raffle(1, "summer").unwrap();
        assert!(coord.create_raffle(1, "summer").is_err());

        coord.add_deputy(1, "summer", Deputy::Role(70)).unwrap();
        assert!(coord.is_deputy(1, "summer", 20).await.unwrap());
        assert!(!coord.is_deputy(1, "summer", 21).await.unwrap());

        coord.add_tickets(1, "summer", 5, 3).unwrap();
        coord.add_tickets(1, "summer", 6, 1).unwrap();
        assert_eq!(coord.remove_tickets(1, "summer", 6, 1).unwrap(), 0);

        assert_eq!(coord.draw_raffle(1, "summer", false).unwrap(), 5);
        assert!(coord.draw_raffle(1, "summer", false).is_err());
        assert_eq!(coord.raffle(1, "summer").unwrap().winner, Some(5));
    }

    #[tokio::test]
    async fn test_donation_autoroles() {
        let platform = Arc::new(FakePlatform::with_roles(&[(5, &[100])]));
        let coord = coordinator(platform.clone());
        let mut config = DonationConfig::new(1, "coins");
        config.roles.insert(1_000, 100);
        config.roles.insert(50, 200);
        config.logging = Some(42);
        coord.set_donation_config(&config).unwrap();

        let update = coord
            .adjust_donation(1, "coins", 5, DonationAction::Add(60))
            .await
            .unwrap();
        assert_eq!(update.total, 60);
        assert_eq!(update.roles.add, BTreeSet::from([200]));
        assert_eq!(update.roles.remove, BTreeSet::from([100]));
        assert_eq!(platform.announcements()[0].channel_id, 42);

        assert!(
            coord
                .adjust_donation(1, "gems", 5, DonationAction::Add(1))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_engine_ends_giveaway_exactly_once() {
        let platform = Arc::new(FakePlatform::default());
        let coord = Arc::new(coordinator(platform.clone()));
        let signal = coord.signal.clone();
        let engine = Arc::new(TimerEngine::new(
            coord.db().clone(),
            coord.clone(),
            GiftboxConfig::default().timers,
            signal,
        ));
        let handle = engine.spawn();

        start_with(&coord, request(1), &[1, 2]);
        coord.end_now(key()).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        engine.shutdown();
        handle.await.unwrap();

        let gw = coord.db().giveaway(key()).unwrap().unwrap();
        assert!(gw.ended);
        assert_eq!(gw.winners.len(), 1);
        assert_eq!(platform.announcements().len(), 1);
        assert!(coord.db().timer(key()).unwrap().is_none());
    }
}

//! # Giftbox: timed giveaways and ticket raffles
//!
//! Usage:
//!   giftbox run                                  # Start the timer engine
//!   giftbox start --guild 1 --channel 2 --message 3 --host 4 --prize Nitro --duration 1h
//!   giftbox reroll --guild 1 --channel 2 --message 3
//!   giftbox raffle draw --guild 1 --name summer
//!   giftbox init-config                          # Write a default config file

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use giftbox_core::config::GiftboxConfig;
use giftbox_core::donation::{DonationAction, DonationConfig};
use giftbox_core::error::GiftboxError;
use giftbox_core::giveaway::{CreditTarget, DonationLink};
use giftbox_core::traits::{Announcement, ChatPlatform};
use giftbox_core::types::{ChannelId, EventKey, GuildId, MemberId, MessageId, RoleId};
use giftbox_scheduler::{
    Coordinator, Deputy, DiscordPlatform, GiftboxDb, GiveawayRequest, HttpActivityService,
    RerollExclusion, TimerEngine, TimerSignal,
};

#[derive(Parser)]
#[command(name = "giftbox", version, about = "🎉 Giftbox: timed giveaways and ticket raffles")]
struct Cli {
    /// Config file (default: ~/.giftbox/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct KeyArgs {
    #[arg(long)]
    guild: GuildId,
    #[arg(long)]
    channel: ChannelId,
    /// Message the giveaway or timer is attached to
    #[arg(long)]
    message: MessageId,
}

impl KeyArgs {
    fn key(&self) -> EventKey {
        EventKey::new(self.guild, self.channel, self.message)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the timer engine until interrupted
    Run,
    /// Schedule a giveaway
    Start {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long)]
        host: MemberId,
        #[arg(long)]
        prize: String,
        #[arg(long, default_value = "1")]
        winners: u32,
        /// e.g. 90s, 30m, 1h30m, 2d
        #[arg(long)]
        duration: String,
        #[arg(long)]
        sponsor: Option<MemberId>,
        #[arg(long, value_delimiter = ',')]
        required: Vec<RoleId>,
        #[arg(long, value_delimiter = ',')]
        blacklist: Vec<RoleId>,
        #[arg(long, value_delimiter = ',')]
        bypass: Vec<RoleId>,
        /// role=multiplier, comma separated
        #[arg(long, value_delimiter = ',')]
        multiplier: Vec<String>,
        #[arg(long)]
        messages: Option<u32>,
        /// Channels where messages count (default: all)
        #[arg(long, value_delimiter = ',')]
        message_channels: Vec<ChannelId>,
        #[arg(long)]
        activity_total: Option<u64>,
        #[arg(long)]
        activity_recent: Option<u64>,
        /// Donation category credited when the giveaway ends
        #[arg(long, requires = "donate_amount")]
        donate_category: Option<String>,
        #[arg(long)]
        donate_amount: Option<i64>,
        /// host, sponsor or winners
        #[arg(long, default_value = "host")]
        credit: String,
    },
    Join {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long)]
        member: MemberId,
    },
    Leave {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long)]
        member: MemberId,
    },
    /// Count a chat message toward open giveaways
    Message {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        channel: ChannelId,
        #[arg(long)]
        member: MemberId,
    },
    /// End a giveaway now (picked up by the running engine)
    End {
        #[command(flatten)]
        key: KeyArgs,
    },
    Reroll {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long)]
        count: Option<u32>,
        /// Allow previous winners to win again
        #[arg(long)]
        allow_previous: bool,
    },
    Cancel {
        #[command(flatten)]
        key: KeyArgs,
    },
    /// List open giveaways
    List {
        #[arg(long)]
        guild: GuildId,
    },
    /// Host leaderboard
    Top {
        #[arg(long)]
        guild: GuildId,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Reminder replying to a message when it expires
    Reminder {
        #[command(flatten)]
        key: KeyArgs,
        #[arg(long)]
        author: MemberId,
        #[arg(long)]
        title: String,
        #[arg(long)]
        duration: String,
    },
    #[command(subcommand)]
    Raffle(RaffleCommand),
    #[command(subcommand)]
    Donation(DonationCommand),
    /// Drop every record of a guild
    ForgetGuild {
        #[arg(long)]
        guild: GuildId,
    },
    /// Write the default config file
    InitConfig,
}

#[derive(Subcommand)]
enum RaffleCommand {
    Create {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        name: String,
    },
    Delete {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        name: String,
    },
    Show {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        name: String,
    },
    Add {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        member: MemberId,
        #[arg(long, default_value = "1")]
        amount: u64,
    },
    Remove {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        member: MemberId,
        #[arg(long, default_value = "1")]
        amount: u64,
    },
    Deputy {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        name: String,
        #[arg(long, conflicts_with = "role")]
        member: Option<MemberId>,
        #[arg(long)]
        role: Option<RoleId>,
        #[arg(long)]
        remove: bool,
    },
    Draw {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        redraw: bool,
    },
}

#[derive(Subcommand)]
enum DonationCommand {
    Setup {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        category: String,
        #[arg(long)]
        symbol: Option<String>,
        /// amount=role, comma separated
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,
        #[arg(long)]
        logging: Option<ChannelId>,
    },
    Add {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        category: String,
        #[arg(long)]
        member: MemberId,
        #[arg(long)]
        amount: i64,
    },
    Remove {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        category: String,
        #[arg(long)]
        member: MemberId,
        #[arg(long)]
        amount: i64,
    },
    Reset {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        category: String,
    },
    Top {
        #[arg(long)]
        guild: GuildId,
        #[arg(long)]
        category: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

/// Used when no bot token is configured: prints announcements and knows no roles.
struct ConsolePlatform;

#[async_trait]
impl ChatPlatform for ConsolePlatform {
    fn name(&self) -> &str {
        "console"
    }

    async fn member_roles(
        &self,
        _guild: GuildId,
        _member: MemberId,
    ) -> giftbox_core::Result<Option<BTreeSet<RoleId>>> {
        Ok(Some(BTreeSet::new()))
    }

    async fn announce(&self, announcement: &Announcement) -> giftbox_core::Result<()> {
        println!("📢 #{}: {}", announcement.channel_id, announcement.content);
        Ok(())
    }

    async fn direct_message(&self, member: MemberId, text: &str) -> giftbox_core::Result<()> {
        println!("✉️  @{member}: {text}");
        Ok(())
    }
}

/// Parse `1d2h30m15s` style durations.
fn parse_duration(input: &str) -> Result<chrono::Duration> {
    let mut total = 0i64;
    let mut digits = String::new();
    for c in input.trim().chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            'w' => 604_800,
            _ => anyhow::bail!("unknown duration unit '{c}' in '{input}'"),
        };
        let n: i64 = digits
            .parse()
            .with_context(|| format!("missing number before '{c}' in '{input}'"))?;
        total = total.saturating_add(n.saturating_mul(unit));
        digits.clear();
    }
    if !digits.is_empty() {
        anyhow::bail!("duration '{input}' needs a unit (s, m, h, d, w)");
    }
    if total <= 0 {
        anyhow::bail!("duration '{input}' must be positive");
    }
    Ok(chrono::Duration::seconds(total))
}

fn ends_in(duration: &str) -> Result<DateTime<Utc>> {
    Ok(Utc::now() + parse_duration(duration)?)
}

/// `a=b` pairs from the command line.
fn parse_pairs<K: std::str::FromStr + Ord, V: std::str::FromStr>(items: &[String]) -> Result<BTreeMap<K, V>> {
    items
        .iter()
        .map(|item| {
            let (k, v) = item
                .split_once('=')
                .with_context(|| format!("expected key=value, got '{item}'"))?;
            let k = k.trim().parse().map_err(|_| anyhow::anyhow!("bad key in '{item}'"))?;
            let v = v.trim().parse().map_err(|_| anyhow::anyhow!("bad value in '{item}'"))?;
            Ok((k, v))
        })
        .collect()
}

fn parse_credit(s: &str) -> Result<CreditTarget> {
    match s {
        "host" => Ok(CreditTarget::Host),
        "sponsor" => Ok(CreditTarget::Sponsor),
        "winners" => Ok(CreditTarget::Winners),
        other => anyhow::bail!("unknown credit target '{other}' (host, sponsor, winners)"),
    }
}

fn load_config(path: Option<&str>) -> Result<GiftboxConfig> {
    let config = match path {
        Some(p) => GiftboxConfig::load_from(&PathBuf::from(shellexpand::tilde(p).to_string()))?,
        None => GiftboxConfig::load()?,
    };
    Ok(config)
}

fn open_db(config: &GiftboxConfig) -> Result<Arc<GiftboxDb>> {
    let path = config.database.expanded_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = GiftboxDb::open(&path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Arc::new(db))
}

fn platform(config: &GiftboxConfig) -> Result<Arc<dyn ChatPlatform>> {
    if config.notify.discord_token.is_empty() {
        tracing::warn!("⚠️ No Discord token configured; announcements go to stdout");
        return Ok(Arc::new(ConsolePlatform));
    }
    Ok(Arc::new(DiscordPlatform::new(&config.notify)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "giftbox=debug,giftbox_scheduler=debug,giftbox_draw=debug"
    } else {
        "giftbox=info,giftbox_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Command::InitConfig = cli.command {
        let path = match &cli.config {
            Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
            None => GiftboxConfig::default_path(),
        };
        GiftboxConfig::default().save_to(&path)?;
        println!("✅ Wrote {}", path.display());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let db = open_db(&config)?;
    let signal = TimerSignal::new();
    let coordinator = Arc::new(Coordinator::new(
        db.clone(),
        platform(&config)?,
        Arc::new(HttpActivityService::new(config.activity.clone())?),
        signal.clone(),
        config.clone(),
    ));

    match cli.command {
        Command::Run => {
            let engine = Arc::new(TimerEngine::new(db.clone(), coordinator.clone(), config.timers.clone(), signal));
            tracing::info!("🎉 Giftbox engine started ({} pending timer(s))", db.timer_count()?);
            let handle = engine.spawn();
            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down");
            engine.shutdown();
            handle.await?;
            let stats = engine.stats();
            tracing::info!(
                "📊 fired={} consumed={} retried={}",
                stats.fired,
                stats.consumed,
                stats.retried
            );
        }
        Command::Start {
            key,
            host,
            prize,
            winners,
            duration,
            sponsor,
            required,
            blacklist,
            bypass,
            multiplier,
            messages,
            message_channels,
            activity_total,
            activity_recent,
            donate_category,
            donate_amount,
            credit,
        } => {
            let mut req = GiveawayRequest::new(key.key(), host, &prize, winners, ends_in(&duration)?);
            req.sponsor_id = sponsor;
            req.rules.required_roles = required.into_iter().collect();
            req.rules.blacklisted_roles = blacklist.into_iter().collect();
            req.rules.bypass_roles = bypass.into_iter().collect();
            req.rules.multiplier_roles = parse_pairs(&multiplier)?;
            req.rules.messages_required = messages;
            req.rules.message_channels = message_channels.into_iter().collect();
            req.rules.activity_total = activity_total;
            req.rules.activity_recent = activity_recent;
            if let (Some(category), Some(amount)) = (donate_category, donate_amount) {
                req.donation = Some(DonationLink {
                    category,
                    amount,
                    target: parse_credit(&credit)?,
                });
            }
            let giveaway = coordinator.start_giveaway(req)?;
            println!("{}", coordinator.giveaway_message(&giveaway)?);
        }
        Command::Join { key, member } => {
            if coordinator.join(key.key(), member)? {
                println!("✅ {member} entered");
            } else {
                println!("ℹ️  {member} had already entered");
            }
        }
        Command::Leave { key, member } => {
            if coordinator.leave(key.key(), member)? {
                println!("✅ {member} left");
            } else {
                println!("ℹ️  {member} was not entered");
            }
        }
        Command::Message { guild, channel, member } => {
            let counted = coordinator.record_message(guild, channel, member)?;
            println!("Counted toward {counted} giveaway(s)");
        }
        Command::End { key } => {
            coordinator.end_now(key.key())?;
            println!("⏩ Giveaway will end on the engine's next pass");
        }
        Command::Reroll { key, count, allow_previous } => {
            let exclusion = if allow_previous {
                RerollExclusion::Nobody
            } else {
                coordinator.default_exclusion()
            };
            let outcome = coordinator.reroll(key.key(), count, exclusion).await?;
            if outcome.winners.is_empty() {
                println!("No eligible entrants left; winners unchanged");
            } else {
                println!("🎲 New winner(s): {:?}", outcome.winners);
            }
        }
        Command::Cancel { key } => {
            if coordinator.cancel(key.key())? {
                println!("🗑️ Cancelled");
            } else {
                println!("ℹ️  No such giveaway");
            }
        }
        Command::List { guild } => {
            for gw in coordinator.open_giveaways(guild)? {
                println!(
                    "{}  {}  winners={} entrants={} ends={}",
                    gw.key,
                    gw.prize,
                    gw.winner_count,
                    gw.entrants.len(),
                    gw.ends_at.to_rfc3339()
                );
            }
        }
        Command::Top { guild, limit } => {
            for (rank, host) in coordinator.top_hosts(guild, limit)?.iter().enumerate() {
                println!("{}. {} ({} giveaway(s))", rank + 1, host.host_id, host.count);
            }
        }
        Command::Reminder { key, author, title, duration } => {
            let timer = coordinator.schedule_reminder(key.key(), author, &title, ends_in(&duration)?)?;
            println!("⏰ '{}' fires at {}", timer.title, timer.expires_at.to_rfc3339());
        }
        Command::Raffle(cmd) => raffle(&coordinator, cmd).await?,
        Command::Donation(cmd) => donation(&coordinator, cmd).await?,
        Command::ForgetGuild { guild } => {
            coordinator.delete_guild(guild)?;
            println!("🧹 Guild {guild} forgotten");
        }
        Command::InitConfig => {}
    }

    Ok(())
}

async fn raffle(coordinator: &Coordinator, cmd: RaffleCommand) -> Result<()> {
    match cmd {
        RaffleCommand::Create { guild, name } => {
            coordinator.create_raffle(guild, &name)?;
            println!("🎟️ Raffle '{name}' created");
        }
        RaffleCommand::Delete { guild, name } => {
            if !coordinator.delete_raffle(guild, &name)? {
                anyhow::bail!(GiftboxError::NotFound(format!("raffle '{name}'")));
            }
            println!("🗑️ Raffle '{name}' deleted");
        }
        RaffleCommand::Show { guild, name } => {
            let raffle = coordinator.raffle(guild, &name)?;
            println!("🎟️ {} ({} tickets)", raffle.name, raffle.total_tickets());
            for (member, tickets) in &raffle.tickets {
                println!("   {member}: {tickets}");
            }
            if let Some(winner) = raffle.winner {
                println!("   Winner: {winner}");
            }
        }
        RaffleCommand::Add { guild, name, member, amount } => {
            let total = coordinator.add_tickets(guild, &name, member, amount)?;
            println!("{member} now holds {total} ticket(s)");
        }
        RaffleCommand::Remove { guild, name, member, amount } => {
            let total = coordinator.remove_tickets(guild, &name, member, amount)?;
            println!("{member} now holds {total} ticket(s)");
        }
        RaffleCommand::Deputy { guild, name, member, role, remove } => {
            let deputy = match (member, role) {
                (Some(m), _) => Deputy::Member(m),
                (None, Some(r)) => Deputy::Role(r),
                (None, None) => anyhow::bail!("pass --member or --role"),
            };
            if remove {
                coordinator.remove_deputy(guild, &name, deputy)?;
            } else {
                coordinator.add_deputy(guild, &name, deputy)?;
            }
            println!("✅ Deputies updated");
        }
        RaffleCommand::Draw { guild, name, redraw } => {
            let winner = coordinator.draw_raffle(guild, &name, redraw)?;
            println!("🎉 Winner of '{name}': {winner}");
        }
    }
    Ok(())
}

async fn donation(coordinator: &Coordinator, cmd: DonationCommand) -> Result<()> {
    match cmd {
        DonationCommand::Setup { guild, category, symbol, roles, logging } => {
            let mut config = DonationConfig::new(guild, &category);
            if let Some(symbol) = symbol {
                config.symbol = symbol;
            }
            config.roles = parse_pairs(&roles)?;
            config.logging = logging;
            coordinator.set_donation_config(&config)?;
            println!("✅ Donation category '{category}' saved");
        }
        DonationCommand::Add { guild, category, member, amount } => {
            let update = coordinator
                .adjust_donation(guild, &category, member, DonationAction::Add(amount))
                .await?;
            print_update(member, &update);
        }
        DonationCommand::Remove { guild, category, member, amount } => {
            let update = coordinator
                .adjust_donation(guild, &category, member, DonationAction::Remove(amount))
                .await?;
            print_update(member, &update);
        }
        DonationCommand::Reset { guild, category } => {
            let n = coordinator.reset_donations(guild, &category)?;
            println!("🧹 Reset {n} member(s)");
        }
        DonationCommand::Top { guild, category, limit } => {
            for (rank, d) in coordinator.donation_leaderboard(guild, &category, limit)?.iter().enumerate() {
                println!("{}. {}: {}", rank + 1, d.member_id, d.amount);
            }
        }
    }
    Ok(())
}

fn print_update(member: MemberId, update: &giftbox_scheduler::DonationUpdate) {
    println!("💰 {member} total: {}", update.total);
    if !update.roles.add.is_empty() {
        println!("   Grant roles: {:?}", update.roles.add);
    }
    if !update.roles.remove.is_empty() {
        println!("   Revoke roles: {:?}", update.roles.remove);
    }
}

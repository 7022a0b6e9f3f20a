//! SQLite-backed persistence for giveaways, entrants, timers, configs,
//! donations, raffles and host stats. Every multi-record change runs in one
//! transaction so restarts never observe half an operation.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use giftbox_core::donation::{Donation, DonationAction, DonationConfig};
use giftbox_core::error::{GiftboxError, Result};
use giftbox_core::giveaway::{DonationLink, Giveaway, HostStats};
use giftbox_core::settings::{ChannelConfig, GuildConfig};
use giftbox_core::types::{ChannelId, EventKey, GuildId, MemberId};
use giftbox_draw::raffle::Raffle;

use crate::timers::{Timer, TimerKind};

/// SQLite-backed store shared by the engine and the coordinator.
pub struct GiftboxDb {
    conn: Mutex<Connection>,
}

fn db_err(context: &str, e: rusqlite::Error) -> GiftboxError {
    GiftboxError::Storage(format!("{context}: {e}"))
}

// SQLite integers are signed. The cast is a bit-for-bit reinterpretation, so
// ids above i64::MAX are stored negative and come back unchanged through
// `from_sql_id`. Only SQL-side ordering of such ids differs, and no query
// orders by an id.
fn sql_id(id: u64) -> i64 {
    id as i64
}

fn from_sql_id(id: i64) -> u64 {
    id as u64
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Raw giveaway row before the JSON columns are decoded.
struct GiveawayRow {
    key: EventKey,
    extra_message_id: Option<i64>,
    prize: String,
    host_id: i64,
    sponsor_id: Option<i64>,
    winner_count: u32,
    winners: String,
    ended: bool,
    ends_at: i64,
    rules: String,
    donation: Option<String>,
    created_at: i64,
}

const GIVEAWAY_COLUMNS: &str = "guild_id, channel_id, message_id, extra_message_id, prize, host_id, \
     sponsor_id, winner_count, winners, ended, ends_at, rules, donation, created_at";

fn row_to_giveaway(row: &rusqlite::Row) -> rusqlite::Result<GiveawayRow> {
    Ok(GiveawayRow {
        key: EventKey::new(
            from_sql_id(row.get(0)?),
            from_sql_id(row.get(1)?),
            from_sql_id(row.get(2)?),
        ),
        extra_message_id: row.get(3)?,
        prize: row.get(4)?,
        host_id: row.get(5)?,
        sponsor_id: row.get(6)?,
        winner_count: row.get(7)?,
        winners: row.get(8)?,
        ended: row.get::<_, i32>(9)? != 0,
        ends_at: row.get(10)?,
        rules: row.get(11)?,
        donation: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn row_to_timer(row: &rusqlite::Row) -> rusqlite::Result<(EventKey, i64, String, String, i64)> {
    Ok((
        EventKey::new(
            from_sql_id(row.get(0)?),
            from_sql_id(row.get(1)?),
            from_sql_id(row.get(2)?),
        ),
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn build_timer(raw: (EventKey, i64, String, String, i64)) -> Result<Timer> {
    let (key, author_id, kind, title, expires_at) = raw;
    let kind = TimerKind::parse(&kind)
        .ok_or_else(|| GiftboxError::Storage(format!("unknown timer kind '{kind}' for {key}")))?;
    Ok(Timer {
        key,
        author_id: from_sql_id(author_id),
        kind,
        title,
        expires_at: from_millis(expires_at),
    })
}

const TIMER_COLUMNS: &str = "guild_id, channel_id, message_id, author_id, kind, title, expires_at";

impl GiftboxDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| db_err("DB pragma", e))?;
        Self::init(conn)
    }

    /// Throwaway database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("DB open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| db_err("DB pragma", e))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| GiftboxError::Storage(format!("Lock: {e}")))
    }

    /// Create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS guild_configs (
                guild_id INTEGER PRIMARY KEY,
                config TEXT NOT NULL            -- JSON GuildConfig
            );

            CREATE TABLE IF NOT EXISTS channel_configs (
                guild_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                config TEXT NOT NULL,           -- JSON ChannelConfig
                PRIMARY KEY (guild_id, channel_id)
            );

            CREATE TABLE IF NOT EXISTS giveaways (
                guild_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                extra_message_id INTEGER,
                prize TEXT NOT NULL,
                host_id INTEGER NOT NULL,
                sponsor_id INTEGER,
                winner_count INTEGER NOT NULL,
                winners TEXT NOT NULL DEFAULT '[]',   -- JSON array, draw order
                ended INTEGER NOT NULL DEFAULT 0,
                ends_at INTEGER NOT NULL,             -- unix millis
                rules TEXT NOT NULL,                  -- JSON EligibilityRules
                donation TEXT,                        -- JSON DonationLink
                created_at INTEGER NOT NULL,
                PRIMARY KEY (guild_id, channel_id, message_id)
            );

            CREATE TABLE IF NOT EXISTS entrants (
                guild_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                member_id INTEGER NOT NULL,
                PRIMARY KEY (guild_id, channel_id, message_id, member_id),
                FOREIGN KEY (guild_id, channel_id, message_id)
                    REFERENCES giveaways(guild_id, channel_id, message_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS message_counts (
                guild_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                member_id INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (guild_id, channel_id, message_id, member_id),
                FOREIGN KEY (guild_id, channel_id, message_id)
                    REFERENCES giveaways(guild_id, channel_id, message_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS timers (
                guild_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                author_id INTEGER NOT NULL,
                kind TEXT NOT NULL,                   -- 'giveaway', 'reminder'
                title TEXT NOT NULL DEFAULT '',
                expires_at INTEGER NOT NULL,          -- unix millis
                PRIMARY KEY (guild_id, channel_id, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_timers_expires ON timers(expires_at);

            CREATE TABLE IF NOT EXISTS stats (
                guild_id INTEGER NOT NULL,
                host_id INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (guild_id, host_id)
            );

            CREATE TABLE IF NOT EXISTS donation_configs (
                guild_id INTEGER NOT NULL,
                category TEXT NOT NULL,
                config TEXT NOT NULL,           -- JSON DonationConfig
                PRIMARY KEY (guild_id, category)
            );

            CREATE TABLE IF NOT EXISTS donations (
                member_id INTEGER NOT NULL,
                guild_id INTEGER NOT NULL,
                category TEXT NOT NULL,
                amount INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (member_id, guild_id, category)
            );

            CREATE TABLE IF NOT EXISTS raffles (
                guild_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                winner INTEGER,
                deputy_roles TEXT NOT NULL DEFAULT '[]',
                deputy_members TEXT NOT NULL DEFAULT '[]',
                tickets TEXT NOT NULL DEFAULT '{}',   -- JSON member -> count
                PRIMARY KEY (guild_id, name)
            );
         ",
            )
            .map_err(|e| db_err("Migration", e))?;
        Ok(())
    }

    // ─── Guild & Channel Configs ──────────────────────────────

    /// Guild config, created with defaults on first read.
    pub fn guild_config(&self, guild_id: GuildId) -> Result<GuildConfig> {
        let conn = self.lock()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT config FROM guild_configs WHERE guild_id = ?1",
                [sql_id(guild_id)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Load guild config", e))?;

        match stored {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => {
                let config = GuildConfig::new(guild_id);
                conn.execute(
                    "INSERT OR IGNORE INTO guild_configs (guild_id, config) VALUES (?1, ?2)",
                    params![sql_id(guild_id), serde_json::to_string(&config)?],
                )
                .map_err(|e| db_err("Create guild config", e))?;
                Ok(config)
            }
        }
    }

    pub fn save_guild_config(&self, config: &GuildConfig) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO guild_configs (guild_id, config) VALUES (?1, ?2)",
                params![sql_id(config.guild_id), serde_json::to_string(config)?],
            )
            .map_err(|e| db_err("Save guild config", e))?;
        Ok(())
    }

    pub fn channel_config(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<Option<ChannelConfig>> {
        let stored: Option<String> = self
            .lock()?
            .query_row(
                "SELECT config FROM channel_configs WHERE guild_id = ?1 AND channel_id = ?2",
                params![sql_id(guild_id), sql_id(channel_id)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Load channel config", e))?;
        stored.map(|json| serde_json::from_str(&json).map_err(Into::into)).transpose()
    }

    pub fn channel_configs(&self, guild_id: GuildId) -> Result<Vec<ChannelConfig>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT config FROM channel_configs WHERE guild_id = ?1 ORDER BY channel_id")
            .map_err(|e| db_err("List channel configs", e))?;
        let rows = stmt
            .query_map([sql_id(guild_id)], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("List channel configs", e))?;
        let mut configs = Vec::new();
        for json in rows {
            let json = json.map_err(|e| db_err("List channel configs", e))?;
            configs.push(serde_json::from_str(&json)?);
        }
        Ok(configs)
    }

    /// Insert or replace a channel override. New channels beyond `limit` are refused.
    pub fn save_channel_config(&self, config: &ChannelConfig, limit: usize) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;

        let exists: bool = tx
            .query_row(
                "SELECT COUNT(*) FROM channel_configs WHERE guild_id = ?1 AND channel_id = ?2",
                params![sql_id(config.guild_id), sql_id(config.channel_id)],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| db_err("Count channel configs", e))?
            > 0;
        if !exists {
            let count: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM channel_configs WHERE guild_id = ?1",
                    [sql_id(config.guild_id)],
                    |row| row.get(0),
                )
                .map_err(|e| db_err("Count channel configs", e))?;
            if count as usize >= limit {
                return Err(GiftboxError::InvalidState(format!(
                    "guild {} already has {limit} channel configs",
                    config.guild_id
                )));
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO channel_configs (guild_id, channel_id, config) VALUES (?1, ?2, ?3)",
            params![
                sql_id(config.guild_id),
                sql_id(config.channel_id),
                serde_json::to_string(config)?
            ],
        )
        .map_err(|e| db_err("Save channel config", e))?;
        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(())
    }

    pub fn delete_channel_config(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<bool> {
        let n = self
            .lock()?
            .execute(
                "DELETE FROM channel_configs WHERE guild_id = ?1 AND channel_id = ?2",
                params![sql_id(guild_id), sql_id(channel_id)],
            )
            .map_err(|e| db_err("Delete channel config", e))?;
        Ok(n > 0)
    }

    // ─── Giveaways & Entry Store ──────────────────────────────

    /// Insert a giveaway, its timer and the host's stats increment atomically.
    pub fn create_giveaway(&self, giveaway: &Giveaway) -> Result<()> {
        let key = giveaway.key;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;

        let inserted = tx
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO giveaways ({GIVEAWAY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    sql_id(key.guild_id),
                    sql_id(key.channel_id),
                    sql_id(key.message_id),
                    giveaway.extra_message_id.map(sql_id),
                    giveaway.prize,
                    sql_id(giveaway.host_id),
                    giveaway.sponsor_id.map(sql_id),
                    giveaway.winner_count,
                    serde_json::to_string(&giveaway.winners)?,
                    giveaway.ended as i32,
                    to_millis(giveaway.ends_at),
                    serde_json::to_string(&giveaway.rules)?,
                    giveaway.donation.as_ref().map(serde_json::to_string).transpose()?,
                    to_millis(giveaway.created_at),
                ],
            )
            .map_err(|e| db_err("Insert giveaway", e))?;
        if inserted == 0 {
            return Err(GiftboxError::Conflict(format!("giveaway {key} already exists")));
        }

        for member in &giveaway.entrants {
            insert_entrant(&tx, key, *member)?;
        }
        for (member, count) in &giveaway.messages {
            tx.execute(
                "INSERT OR REPLACE INTO message_counts (guild_id, channel_id, message_id, member_id, count)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    sql_id(key.guild_id),
                    sql_id(key.channel_id),
                    sql_id(key.message_id),
                    sql_id(*member),
                    count
                ],
            )
            .map_err(|e| db_err("Insert message count", e))?;
        }

        if !giveaway.ended {
            insert_timer(&tx, &Timer::for_giveaway(giveaway))?;
        }

        tx.execute(
            "INSERT INTO stats (guild_id, host_id, count) VALUES (?1, ?2, 1)
             ON CONFLICT(guild_id, host_id) DO UPDATE SET count = count + 1",
            params![sql_id(key.guild_id), sql_id(giveaway.host_id)],
        )
        .map_err(|e| db_err("Increment stats", e))?;

        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(())
    }

    /// One consistent read of a giveaway with its entrants and message counts.
    pub fn giveaway(&self, key: EventKey) -> Result<Option<Giveaway>> {
        let conn = self.lock()?;
        load_giveaway(&conn, key)
    }

    /// Open giveaways in a guild, soonest ending first.
    pub fn open_giveaways(&self, guild_id: GuildId) -> Result<Vec<Giveaway>> {
        let conn = self.lock()?;
        let keys = {
            let mut stmt = conn
                .prepare(
                    "SELECT guild_id, channel_id, message_id FROM giveaways
                     WHERE guild_id = ?1 AND ended = 0 ORDER BY ends_at",
                )
                .map_err(|e| db_err("List giveaways", e))?;
            let rows = stmt
                .query_map([sql_id(guild_id)], |row| {
                    Ok(EventKey::new(
                        from_sql_id(row.get(0)?),
                        from_sql_id(row.get(1)?),
                        from_sql_id(row.get(2)?),
                    ))
                })
                .map_err(|e| db_err("List giveaways", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| db_err("List giveaways", e))?
        };

        let mut giveaways = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(gw) = load_giveaway(&conn, key)? {
                giveaways.push(gw);
            }
        }
        Ok(giveaways)
    }

    /// Add an entrant to an open giveaway. Returns false if already entered.
    pub fn add_entrant(&self, key: EventKey, member: MemberId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        require_open(&tx, key)?;
        let added = insert_entrant(&tx, key, member)?;
        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(added)
    }

    /// Remove an entrant from an open giveaway. Returns false if not entered.
    pub fn remove_entrant(&self, key: EventKey, member: MemberId) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        require_open(&tx, key)?;
        let n = tx
            .execute(
                "DELETE FROM entrants
                 WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3 AND member_id = ?4",
                params![
                    sql_id(key.guild_id),
                    sql_id(key.channel_id),
                    sql_id(key.message_id),
                    sql_id(member)
                ],
            )
            .map_err(|e| db_err("Remove entrant", e))?;
        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(n > 0)
    }

    /// Count one message toward an open giveaway. Returns the new count.
    pub fn bump_message_count(&self, key: EventKey, member: MemberId) -> Result<u32> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        require_open(&tx, key)?;
        let count: u32 = tx
            .query_row(
                "INSERT INTO message_counts (guild_id, channel_id, message_id, member_id, count)
                 VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT(guild_id, channel_id, message_id, member_id) DO UPDATE SET count = count + 1
                 RETURNING count",
                params![
                    sql_id(key.guild_id),
                    sql_id(key.channel_id),
                    sql_id(key.message_id),
                    sql_id(member)
                ],
                |row| row.get(0),
            )
            .map_err(|e| db_err("Bump message count", e))?;
        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(count)
    }

    /// Mark a giveaway ended with its winners and apply donation credits, all
    /// in one transaction. Fails with `Conflict` when it is already ended or gone.
    pub fn finish_giveaway(
        &self,
        key: EventKey,
        winners: &[MemberId],
        credits: &[(MemberId, i64)],
        category: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;

        let n = tx
            .execute(
                "UPDATE giveaways SET ended = 1, winners = ?4
                 WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3 AND ended = 0",
                params![
                    sql_id(key.guild_id),
                    sql_id(key.channel_id),
                    sql_id(key.message_id),
                    serde_json::to_string(winners)?
                ],
            )
            .map_err(|e| db_err("Finish giveaway", e))?;
        if n == 0 {
            return Err(GiftboxError::Conflict(format!(
                "giveaway {key} was ended or removed concurrently"
            )));
        }

        if let Some(category) = category {
            for (member, amount) in credits {
                credit_donation(&tx, key.guild_id, category, *member, *amount)?;
            }
        }

        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(())
    }

    /// Replace the winners of an ended giveaway (reroll).
    pub fn replace_winners(&self, key: EventKey, winners: &[MemberId]) -> Result<()> {
        let n = self
            .lock()?
            .execute(
                "UPDATE giveaways SET winners = ?4
                 WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3 AND ended = 1",
                params![
                    sql_id(key.guild_id),
                    sql_id(key.channel_id),
                    sql_id(key.message_id),
                    serde_json::to_string(winners)?
                ],
            )
            .map_err(|e| db_err("Replace winners", e))?;
        if n == 0 {
            return Err(GiftboxError::Conflict(format!("giveaway {key} is not ended")));
        }
        Ok(())
    }

    /// Delete a giveaway, its timer and entry data, and decrement the host's
    /// stats atomically. Returns false if it did not exist.
    pub fn delete_giveaway(&self, key: EventKey) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;

        let host: Option<i64> = tx
            .query_row(
                "SELECT host_id FROM giveaways WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
                params![sql_id(key.guild_id), sql_id(key.channel_id), sql_id(key.message_id)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Load giveaway", e))?;
        let Some(host) = host else {
            return Ok(false);
        };

        delete_timer_row(&tx, key)?;
        tx.execute(
            "DELETE FROM giveaways WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
            params![sql_id(key.guild_id), sql_id(key.channel_id), sql_id(key.message_id)],
        )
        .map_err(|e| db_err("Delete giveaway", e))?;
        tx.execute(
            "UPDATE stats SET count = MAX(count - 1, 0) WHERE guild_id = ?1 AND host_id = ?2",
            params![sql_id(key.guild_id), host],
        )
        .map_err(|e| db_err("Decrement stats", e))?;

        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(true)
    }

    // ─── Stats ────────────────────────────────────────────────

    pub fn host_count(&self, guild_id: GuildId, host_id: MemberId) -> Result<u64> {
        let count: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT count FROM stats WHERE guild_id = ?1 AND host_id = ?2",
                params![sql_id(guild_id), sql_id(host_id)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Load stats", e))?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }

    /// Hosts with the most giveaways, highest first.
    pub fn top_hosts(&self, guild_id: GuildId, limit: usize) -> Result<Vec<HostStats>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT host_id, count FROM stats WHERE guild_id = ?1 AND count > 0
                 ORDER BY count DESC, host_id LIMIT ?2",
            )
            .map_err(|e| db_err("Top hosts", e))?;
        let rows = stmt
            .query_map(params![sql_id(guild_id), limit as i64], |row| {
                Ok(HostStats {
                    guild_id,
                    host_id: from_sql_id(row.get(0)?),
                    count: row.get::<_, i64>(1)?.max(0) as u64,
                })
            })
            .map_err(|e| db_err("Top hosts", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Top hosts", e))
    }

    // ─── Timers ───────────────────────────────────────────────

    /// Insert a standalone timer. Fails with `Conflict` when the key already
    /// has a timer or belongs to a giveaway, so a giveaway's timer is never
    /// replaced.
    pub fn save_timer(&self, timer: &Timer) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        let key = timer.key;
        let giveaway: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM giveaways WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
                params![sql_id(key.guild_id), sql_id(key.channel_id), sql_id(key.message_id)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Load giveaway", e))?;
        if giveaway.is_some() {
            return Err(GiftboxError::Conflict(format!("message {key} already hosts a giveaway")));
        }
        insert_timer(&tx, timer)?;
        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(())
    }

    pub fn timer(&self, key: EventKey) -> Result<Option<Timer>> {
        let raw = self
            .lock()?
            .query_row(
                &format!(
                    "SELECT {TIMER_COLUMNS} FROM timers
                     WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3"
                ),
                params![sql_id(key.guild_id), sql_id(key.channel_id), sql_id(key.message_id)],
                row_to_timer,
            )
            .optional()
            .map_err(|e| db_err("Load timer", e))?;
        raw.map(build_timer).transpose()
    }

    /// Consume a fired timer. Only the row with the fired expiry is removed;
    /// a timer moved while its handler ran stays scheduled. Returns false when
    /// nothing matched.
    pub fn consume_timer(&self, timer: &Timer) -> Result<bool> {
        let key = timer.key;
        let n = self
            .lock()?
            .execute(
                "DELETE FROM timers
                 WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3 AND expires_at = ?4",
                params![
                    sql_id(key.guild_id),
                    sql_id(key.channel_id),
                    sql_id(key.message_id),
                    to_millis(timer.expires_at)
                ],
            )
            .map_err(|e| db_err("Consume timer", e))?;
        Ok(n > 0)
    }

    /// Move an open giveaway's end, and its timer, to `at`.
    pub fn end_giveaway_at(&self, key: EventKey, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        let (g, c, m) = (sql_id(key.guild_id), sql_id(key.channel_id), sql_id(key.message_id));

        let ended: Option<bool> = tx
            .query_row(
                "SELECT ended FROM giveaways WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
                params![g, c, m],
                |row| Ok(row.get::<_, i32>(0)? != 0),
            )
            .optional()
            .map_err(|e| db_err("Load giveaway", e))?;
        match ended {
            None => return Err(GiftboxError::NotFound(format!("giveaway {key}"))),
            Some(true) => {
                return Err(GiftboxError::InvalidState(format!("giveaway {key} has already ended")));
            }
            Some(false) => {}
        }

        tx.execute(
            "UPDATE giveaways SET ends_at = ?4 WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
            params![g, c, m, to_millis(at)],
        )
        .map_err(|e| db_err("Move giveaway end", e))?;
        let n = tx
            .execute(
                "UPDATE timers SET expires_at = ?4 WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
                params![g, c, m, to_millis(at)],
            )
            .map_err(|e| db_err("Reschedule timer", e))?;
        if n == 0 {
            return Err(GiftboxError::NotFound(format!("timer for giveaway {key}")));
        }

        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(())
    }

    /// Every timer expiring at or before `now`, oldest first.
    pub fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>> {
        self.query_timers(
            &format!("SELECT {TIMER_COLUMNS} FROM timers WHERE expires_at <= ?1 ORDER BY expires_at"),
            to_millis(now),
        )
    }

    /// The earliest timer expiring strictly after `now`.
    pub fn next_timer_after(&self, now: DateTime<Utc>) -> Result<Option<Timer>> {
        Ok(self
            .query_timers(
                &format!(
                    "SELECT {TIMER_COLUMNS} FROM timers WHERE expires_at > ?1 ORDER BY expires_at LIMIT 1"
                ),
                to_millis(now),
            )?
            .into_iter()
            .next())
    }

    pub fn timer_count(&self) -> Result<usize> {
        let n: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM timers", [], |row| row.get(0))
            .map_err(|e| db_err("Count timers", e))?;
        Ok(n as usize)
    }

    fn query_timers(&self, sql: &str, arg: i64) -> Result<Vec<Timer>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(|e| db_err("Load timers", e))?;
        let rows = stmt
            .query_map([arg], row_to_timer)
            .map_err(|e| db_err("Load timers", e))?;
        let mut timers = Vec::new();
        for raw in rows {
            timers.push(build_timer(raw.map_err(|e| db_err("Load timers", e))?)?);
        }
        Ok(timers)
    }

    // ─── Donations ────────────────────────────────────────────

    pub fn save_donation_config(&self, config: &DonationConfig) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO donation_configs (guild_id, category, config) VALUES (?1, ?2, ?3)",
                params![sql_id(config.guild_id), config.category, serde_json::to_string(config)?],
            )
            .map_err(|e| db_err("Save donation config", e))?;
        Ok(())
    }

    pub fn donation_config(&self, guild_id: GuildId, category: &str) -> Result<Option<DonationConfig>> {
        let stored: Option<String> = self
            .lock()?
            .query_row(
                "SELECT config FROM donation_configs WHERE guild_id = ?1 AND category = ?2",
                params![sql_id(guild_id), category],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Load donation config", e))?;
        stored.map(|json| serde_json::from_str(&json).map_err(Into::into)).transpose()
    }

    pub fn donation_configs(&self, guild_id: GuildId) -> Result<Vec<DonationConfig>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT config FROM donation_configs WHERE guild_id = ?1 ORDER BY category")
            .map_err(|e| db_err("List donation configs", e))?;
        let rows = stmt
            .query_map([sql_id(guild_id)], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("List donation configs", e))?;
        let mut configs = Vec::new();
        for json in rows {
            let json = json.map_err(|e| db_err("List donation configs", e))?;
            configs.push(serde_json::from_str(&json)?);
        }
        Ok(configs)
    }

    /// Remove a category and every total recorded under it.
    pub fn delete_donation_config(&self, guild_id: GuildId, category: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        let n = tx
            .execute(
                "DELETE FROM donation_configs WHERE guild_id = ?1 AND category = ?2",
                params![sql_id(guild_id), category],
            )
            .map_err(|e| db_err("Delete donation config", e))?;
        tx.execute(
            "DELETE FROM donations WHERE guild_id = ?1 AND category = ?2",
            params![sql_id(guild_id), category],
        )
        .map_err(|e| db_err("Delete donations", e))?;
        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(n > 0)
    }

    pub fn donation(&self, guild_id: GuildId, category: &str, member: MemberId) -> Result<i64> {
        let conn = self.lock()?;
        donation_amount(&conn, guild_id, category, member)
    }

    /// Apply a manager's amendment inside one transaction. Returns the new total.
    pub fn adjust_donation(
        &self,
        guild_id: GuildId,
        category: &str,
        member: MemberId,
        action: DonationAction,
    ) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        let balance = donation_amount(&tx, guild_id, category, member)?;
        let total = action.apply(balance)?;
        tx.execute(
            "INSERT INTO donations (member_id, guild_id, category, amount) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(member_id, guild_id, category) DO UPDATE SET amount = excluded.amount",
            params![sql_id(member), sql_id(guild_id), category, total],
        )
        .map_err(|e| db_err("Save donation", e))?;
        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(total)
    }

    /// Zero a category. Returns how many member totals were removed.
    pub fn reset_donations(&self, guild_id: GuildId, category: &str) -> Result<usize> {
        self.lock()?
            .execute(
                "DELETE FROM donations WHERE guild_id = ?1 AND category = ?2",
                params![sql_id(guild_id), category],
            )
            .map_err(|e| db_err("Reset donations", e))
    }

    pub fn donation_leaderboard(&self, guild_id: GuildId, category: &str, limit: usize) -> Result<Vec<Donation>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT member_id, amount FROM donations
                 WHERE guild_id = ?1 AND category = ?2 AND amount > 0
                 ORDER BY amount DESC, member_id LIMIT ?3",
            )
            .map_err(|e| db_err("Donation leaderboard", e))?;
        let rows = stmt
            .query_map(params![sql_id(guild_id), category, limit as i64], |row| {
                Ok(Donation {
                    member_id: from_sql_id(row.get(0)?),
                    guild_id,
                    category: category.to_string(),
                    amount: row.get(1)?,
                })
            })
            .map_err(|e| db_err("Donation leaderboard", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Donation leaderboard", e))
    }

    // ─── Raffles ──────────────────────────────────────────────

    pub fn create_raffle(&self, raffle: &Raffle) -> Result<()> {
        let n = self
            .lock()?
            .execute(
                "INSERT OR IGNORE INTO raffles (guild_id, name, winner, deputy_roles, deputy_members, tickets)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sql_id(raffle.guild_id),
                    raffle.name,
                    raffle.winner.map(sql_id),
                    serde_json::to_string(&raffle.deputy_roles)?,
                    serde_json::to_string(&raffle.deputy_members)?,
                    serde_json::to_string(&raffle.tickets)?,
                ],
            )
            .map_err(|e| db_err("Create raffle", e))?;
        if n == 0 {
            return Err(GiftboxError::Conflict(format!("raffle '{}' already exists", raffle.name)));
        }
        Ok(())
    }

    pub fn raffle(&self, guild_id: GuildId, name: &str) -> Result<Option<Raffle>> {
        let conn = self.lock()?;
        load_raffle(&conn, guild_id, name)
    }

    /// Read-modify-write a raffle in one transaction. Nothing is written when
    /// `f` fails.
    pub fn update_raffle<T>(
        &self,
        guild_id: GuildId,
        name: &str,
        f: impl FnOnce(&mut Raffle) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        let mut raffle = load_raffle(&tx, guild_id, name)?
            .ok_or_else(|| GiftboxError::NotFound(format!("raffle '{name}'")))?;
        let value = f(&mut raffle)?;
        write_raffle(&tx, &raffle)?;
        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(value)
    }

    pub fn raffle_names(&self, guild_id: GuildId) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT name FROM raffles WHERE guild_id = ?1 ORDER BY name")
            .map_err(|e| db_err("List raffles", e))?;
        let rows = stmt
            .query_map([sql_id(guild_id)], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("List raffles", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("List raffles", e))
    }

    pub fn delete_raffle(&self, guild_id: GuildId, name: &str) -> Result<bool> {
        let n = self
            .lock()?
            .execute(
                "DELETE FROM raffles WHERE guild_id = ?1 AND name = ?2",
                params![sql_id(guild_id), name],
            )
            .map_err(|e| db_err("Delete raffle", e))?;
        Ok(n > 0)
    }

    // ─── Guild removal ────────────────────────────────────────

    /// Remove everything stored for a guild in one transaction.
    pub fn delete_guild(&self, guild_id: GuildId) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| db_err("Begin", e))?;
        for table in [
            "timers",
            "message_counts",
            "entrants",
            "giveaways",
            "channel_configs",
            "guild_configs",
            "donations",
            "donation_configs",
            "raffles",
            "stats",
        ] {
            tx.execute(&format!("DELETE FROM {table} WHERE guild_id = ?1"), [sql_id(guild_id)])
                .map_err(|e| db_err(&format!("Delete guild rows from {table}"), e))?;
        }
        tx.commit().map_err(|e| db_err("Commit", e))?;
        Ok(())
    }
}

fn load_giveaway(conn: &Connection, key: EventKey) -> Result<Option<Giveaway>> {
    let (g, c, m) = (sql_id(key.guild_id), sql_id(key.channel_id), sql_id(key.message_id));
    let row = conn
        .query_row(
            &format!(
                "SELECT {GIVEAWAY_COLUMNS} FROM giveaways
                 WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3"
            ),
            params![g, c, m],
            row_to_giveaway,
        )
        .optional()
        .map_err(|e| db_err("Load giveaway", e))?;
    let Some(row) = row else {
        return Ok(None);
    };

    let mut entrants = BTreeSet::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT member_id FROM entrants WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
            )
            .map_err(|e| db_err("Load entrants", e))?;
        let rows = stmt
            .query_map(params![g, c, m], |row| row.get::<_, i64>(0))
            .map_err(|e| db_err("Load entrants", e))?;
        for member in rows {
            entrants.insert(from_sql_id(member.map_err(|e| db_err("Load entrants", e))?));
        }
    }

    let mut messages = BTreeMap::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT member_id, count FROM message_counts
                 WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
            )
            .map_err(|e| db_err("Load message counts", e))?;
        let rows = stmt
            .query_map(params![g, c, m], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, u32>(1)?)))
            .map_err(|e| db_err("Load message counts", e))?;
        for entry in rows {
            let (member, count) = entry.map_err(|e| db_err("Load message counts", e))?;
            messages.insert(from_sql_id(member), count);
        }
    }

    Ok(Some(Giveaway {
        key: row.key,
        extra_message_id: row.extra_message_id.map(from_sql_id),
        prize: row.prize,
        host_id: from_sql_id(row.host_id),
        sponsor_id: row.sponsor_id.map(from_sql_id),
        winner_count: row.winner_count,
        entrants,
        winners: serde_json::from_str(&row.winners)?,
        ended: row.ended,
        ends_at: from_millis(row.ends_at),
        rules: serde_json::from_str(&row.rules)?,
        messages,
        donation: row
            .donation
            .as_deref()
            .map(serde_json::from_str::<DonationLink>)
            .transpose()?,
        created_at: from_millis(row.created_at),
    }))
}

/// Fails with `NotFound` or `InvalidState` unless the giveaway is open.
fn require_open(conn: &Connection, key: EventKey) -> Result<()> {
    let ended: Option<i32> = conn
        .query_row(
            "SELECT ended FROM giveaways WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
            params![sql_id(key.guild_id), sql_id(key.channel_id), sql_id(key.message_id)],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| db_err("Load giveaway", e))?;
    match ended {
        None => Err(GiftboxError::NotFound(format!("giveaway {key}"))),
        Some(0) => Ok(()),
        Some(_) => Err(GiftboxError::InvalidState(format!("giveaway {key} has ended"))),
    }
}

fn insert_entrant(conn: &Connection, key: EventKey, member: MemberId) -> Result<bool> {
    let n = conn
        .execute(
            "INSERT OR IGNORE INTO entrants (guild_id, channel_id, message_id, member_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                sql_id(key.guild_id),
                sql_id(key.channel_id),
                sql_id(key.message_id),
                sql_id(member)
            ],
        )
        .map_err(|e| db_err("Add entrant", e))?;
    Ok(n > 0)
}

/// At most one timer per key; an existing one is a `Conflict`.
fn insert_timer(conn: &Connection, timer: &Timer) -> Result<()> {
    let n = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO timers ({TIMER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ),
        params![
            sql_id(timer.key.guild_id),
            sql_id(timer.key.channel_id),
            sql_id(timer.key.message_id),
            sql_id(timer.author_id),
            timer.kind.as_str(),
            timer.title,
            to_millis(timer.expires_at),
        ],
    )
    .map_err(|e| db_err("Save timer", e))?;
    if n == 0 {
        return Err(GiftboxError::Conflict(format!("timer {} already exists", timer.key)));
    }
    Ok(())
}

fn delete_timer_row(conn: &Connection, key: EventKey) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM timers WHERE guild_id = ?1 AND channel_id = ?2 AND message_id = ?3",
            params![sql_id(key.guild_id), sql_id(key.channel_id), sql_id(key.message_id)],
        )
        .map_err(|e| db_err("Delete timer", e))?;
    Ok(n > 0)
}

fn donation_amount(conn: &Connection, guild_id: GuildId, category: &str, member: MemberId) -> Result<i64> {
    let amount: Option<i64> = conn
        .query_row(
            "SELECT amount FROM donations WHERE member_id = ?1 AND guild_id = ?2 AND category = ?3",
            params![sql_id(member), sql_id(guild_id), category],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| db_err("Load donation", e))?;
    Ok(amount.unwrap_or(0))
}

fn credit_donation(conn: &Connection, guild_id: GuildId, category: &str, member: MemberId, amount: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO donations (member_id, guild_id, category, amount) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(member_id, guild_id, category) DO UPDATE SET amount = amount + excluded.amount",
        params![sql_id(member), sql_id(guild_id), category, amount],
    )
    .map_err(|e| db_err("Credit donation", e))?;
    Ok(())
}

fn load_raffle(conn: &Connection, guild_id: GuildId, name: &str) -> Result<Option<Raffle>> {
    let raw = conn
        .query_row(
            "SELECT winner, deputy_roles, deputy_members, tickets FROM raffles
             WHERE guild_id = ?1 AND name = ?2",
            params![sql_id(guild_id), name],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| db_err("Load raffle", e))?;

    let Some((winner, roles, members, tickets)) = raw else {
        return Ok(None);
    };
    Ok(Some(Raffle {
        guild_id,
        name: name.to_string(),
        winner: winner.map(from_sql_id),
        deputy_roles: serde_json::from_str(&roles)?,
        deputy_members: serde_json::from_str(&members)?,
        tickets: serde_json::from_str(&tickets)?,
    }))
}

fn write_raffle(conn: &Connection, raffle: &Raffle) -> Result<()> {
    let n = conn
        .execute(
            "UPDATE raffles SET winner = ?3, deputy_roles = ?4, deputy_members = ?5, tickets = ?6
             WHERE guild_id = ?1 AND name = ?2",
            params![
                sql_id(raffle.guild_id),
                raffle.name,
                raffle.winner.map(sql_id),
                serde_json::to_string(&raffle.deputy_roles)?,
                serde_json::to_string(&raffle.deputy_members)?,
                serde_json::to_string(&raffle.tickets)?,
            ],
        )
        .map_err(|e| db_err("Save raffle", e))?;
    if n == 0 {
        return Err(GiftboxError::NotFound(format!("raffle '{}'", raffle.name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use giftbox_core::giveaway::CreditTarget;
    use giftbox_core::rules::EligibilityRules;

    fn giveaway(message_id: u64, host: MemberId, minutes: i64) -> Giveaway {
        Giveaway::new(
            EventKey::new(1, 10, message_id),
            host,
            "Nitro",
            1,
            Utc::now() + chrono::Duration::minutes(minutes),
            EligibilityRules::default(),
        )
    }

    #[test]
    fn test_create_giveaway_writes_timer_and_stats() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let mut gw = giveaway(100, 7, 5);
        gw.rules.multiplier_roles.insert(3, 2);
        db.create_giveaway(&gw).unwrap();

        let loaded = db.giveaway(gw.key).unwrap().unwrap();
        assert_eq!(loaded.prize, "Nitro");
        assert_eq!(loaded.rules.multiplier_roles.get(&3), Some(&2));
        assert_eq!(loaded.ends_at.timestamp_millis(), gw.ends_at.timestamp_millis());
        assert!(db.timer(gw.key).unwrap().is_some());
        assert_eq!(db.host_count(1, 7).unwrap(), 1);

        assert!(db.create_giveaway(&gw).unwrap_err().is_conflict());
        assert_eq!(db.host_count(1, 7).unwrap(), 1);
    }

    #[test]
    fn test_stats_follow_create_and_delete() {
        let db = GiftboxDb::open_in_memory().unwrap();
        db.create_giveaway(&giveaway(1, 7, 5)).unwrap();
        db.create_giveaway(&giveaway(2, 7, 5)).unwrap();
        db.create_giveaway(&giveaway(3, 8, 5)).unwrap();
        assert_eq!(db.host_count(1, 7).unwrap(), 2);

        assert!(db.delete_giveaway(EventKey::new(1, 10, 1)).unwrap());
        assert!(!db.delete_giveaway(EventKey::new(1, 10, 1)).unwrap());
        assert_eq!(db.host_count(1, 7).unwrap(), 1);
        assert!(db.timer(EventKey::new(1, 10, 1)).unwrap().is_none());

        let top = db.top_hosts(1, 10).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].count, 1);
    }

    #[test]
    fn test_entrants_and_messages() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let gw = giveaway(1, 7, 5);
        db.create_giveaway(&gw).unwrap();

        assert!(db.add_entrant(gw.key, 50).unwrap());
        assert!(!db.add_entrant(gw.key, 50).unwrap());
        assert!(db.add_entrant(gw.key, 51).unwrap());
        assert!(db.remove_entrant(gw.key, 51).unwrap());
        assert_eq!(db.bump_message_count(gw.key, 50).unwrap(), 1);
        assert_eq!(db.bump_message_count(gw.key, 50).unwrap(), 2);

        let loaded = db.giveaway(gw.key).unwrap().unwrap();
        assert_eq!(loaded.entrants, BTreeSet::from([50]));
        assert_eq!(loaded.message_count(50), 2);

        let missing = EventKey::new(1, 10, 999);
        assert!(matches!(db.add_entrant(missing, 1), Err(GiftboxError::NotFound(_))));
    }

    #[test]
    fn test_finish_is_conditional() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let gw = giveaway(1, 7, 5);
        db.create_giveaway(&gw).unwrap();

        db.finish_giveaway(gw.key, &[5, 6], &[], None).unwrap();
        let err = db.finish_giveaway(gw.key, &[9], &[], None).unwrap_err();
        assert!(err.is_conflict());

        let loaded = db.giveaway(gw.key).unwrap().unwrap();
        assert!(loaded.ended);
        assert_eq!(loaded.winners, vec![5, 6]);
        assert!(matches!(db.add_entrant(gw.key, 1), Err(GiftboxError::InvalidState(_))));

        db.replace_winners(gw.key, &[8]).unwrap();
        assert_eq!(db.giveaway(gw.key).unwrap().unwrap().winners, vec![8]);
    }

    #[test]
    fn test_finish_credits_donations_once() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let mut gw = giveaway(1, 7, 5);
        gw.donation = Some(DonationLink {
            category: "coins".into(),
            amount: 25,
            target: CreditTarget::Winners,
        });
        db.create_giveaway(&gw).unwrap();

        let credits = gw.donation_credits(&[5]);
        db.finish_giveaway(gw.key, &[5], &credits, Some("coins")).unwrap();
        assert!(db.finish_giveaway(gw.key, &[5], &credits, Some("coins")).is_err());
        assert_eq!(db.donation(1, "coins", 5).unwrap(), 25);
    }

    #[test]
    fn test_timer_queries() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let now = Utc::now();
        let past = Timer::reminder(EventKey::new(1, 1, 1), 2, "past", now - chrono::Duration::seconds(5));
        let future = Timer::reminder(EventKey::new(1, 1, 2), 2, "future", now + chrono::Duration::seconds(60));
        db.save_timer(&past).unwrap();
        db.save_timer(&future).unwrap();

        let due = db.due_timers(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].title, "past");
        assert_eq!(db.next_timer_after(now).unwrap().unwrap().title, "future");

        assert!(db.save_timer(&future).unwrap_err().is_conflict());
        assert!(db.consume_timer(&past).unwrap());
        assert!(!db.consume_timer(&past).unwrap());
        assert_eq!(db.timer_count().unwrap(), 1);
    }

    #[test]
    fn test_consume_keeps_moved_timer() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let gw = giveaway(1, 7, 5);
        db.create_giveaway(&gw).unwrap();
        let fired = db.timer(gw.key).unwrap().unwrap();

        let now = Utc::now();
        db.end_giveaway_at(gw.key, now).unwrap();
        assert!(!db.consume_timer(&fired).unwrap());
        let moved = db.timer(gw.key).unwrap().unwrap();
        assert_eq!(moved.expires_at.timestamp_millis(), now.timestamp_millis());
        assert!(db.consume_timer(&moved).unwrap());
    }

    #[test]
    fn test_reminder_cannot_replace_giveaway_timer() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let gw = giveaway(1, 7, 5);
        db.create_giveaway(&gw).unwrap();

        let reminder = Timer::reminder(gw.key, 2, "Raid", Utc::now());
        assert!(db.save_timer(&reminder).unwrap_err().is_conflict());
        assert_eq!(db.timer(gw.key).unwrap().unwrap().kind, TimerKind::Giveaway);

        // And the other way round: a reminder blocks a giveaway on its message.
        let other = giveaway(2, 7, 5);
        db.save_timer(&Timer::reminder(other.key, 2, "Raid", Utc::now())).unwrap();
        assert!(db.create_giveaway(&other).unwrap_err().is_conflict());
        assert!(db.giveaway(other.key).unwrap().is_none());
        assert_eq!(db.host_count(1, 7).unwrap(), 1);
    }

    #[test]
    fn test_end_giveaway_at_moves_both() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let gw = giveaway(1, 7, 5);
        db.create_giveaway(&gw).unwrap();
        let now = Utc::now();

        db.end_giveaway_at(gw.key, now).unwrap();
        let stored = db.giveaway(gw.key).unwrap().unwrap();
        assert_eq!(stored.ends_at.timestamp_millis(), now.timestamp_millis());
        assert!(db.timer(gw.key).unwrap().unwrap().is_due(now));

        db.finish_giveaway(gw.key, &[], &[], None).unwrap();
        assert!(matches!(db.end_giveaway_at(gw.key, now), Err(GiftboxError::InvalidState(_))));
        assert!(matches!(
            db.end_giveaway_at(EventKey::new(9, 9, 9), now),
            Err(GiftboxError::NotFound(_))
        ));
    }

    #[test]
    fn test_ids_above_i64_max_roundtrip() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let guild = u64::MAX - 1;
        assert_eq!(db.guild_config(guild).unwrap().guild_id, guild);

        let gw = giveaway_in(guild);
        db.create_giveaway(&gw).unwrap();
        db.add_entrant(gw.key, u64::MAX).unwrap();
        let stored = db.giveaway(gw.key).unwrap().unwrap();
        assert_eq!(stored.key, gw.key);
        assert!(stored.entrants.contains(&u64::MAX));
        assert_eq!(db.open_giveaways(guild).unwrap().len(), 1);
    }

    #[test]
    fn test_guild_and_channel_configs() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let mut config = db.guild_config(3).unwrap();
        assert_eq!(config, GuildConfig::new(3));
        config.dm_host = false;
        db.save_guild_config(&config).unwrap();
        assert!(!db.guild_config(3).unwrap().dm_host);

        db.save_channel_config(&ChannelConfig::new(3, 1), 2).unwrap();
        db.save_channel_config(&ChannelConfig::new(3, 2), 2).unwrap();
        db.save_channel_config(&ChannelConfig::new(3, 2), 2).unwrap();
        assert!(db.save_channel_config(&ChannelConfig::new(3, 4), 2).is_err());
        assert_eq!(db.channel_configs(3).unwrap().len(), 2);
        assert!(db.delete_channel_config(3, 1).unwrap());
        assert!(db.channel_config(3, 1).unwrap().is_none());
    }

    #[test]
    fn test_donation_ledger() {
        let db = GiftboxDb::open_in_memory().unwrap();
        assert_eq!(db.adjust_donation(1, "coins", 5, DonationAction::Add(100)).unwrap(), 100);
        assert_eq!(db.adjust_donation(1, "coins", 5, DonationAction::Remove(40)).unwrap(), 60);
        assert!(db.adjust_donation(1, "coins", 5, DonationAction::Remove(61)).is_err());
        db.adjust_donation(1, "coins", 6, DonationAction::Add(500)).unwrap();

        let board = db.donation_leaderboard(1, "coins", 10).unwrap();
        assert_eq!(board.iter().map(|d| d.member_id).collect::<Vec<_>>(), vec![6, 5]);
        assert_eq!(db.reset_donations(1, "coins").unwrap(), 2);
        assert_eq!(db.donation(1, "coins", 6).unwrap(), 0);
    }

    #[test]
    fn test_raffle_roundtrip() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let mut raffle = Raffle::new(1, "summer");
        db.create_raffle(&raffle).unwrap();
        assert!(db.create_raffle(&raffle).unwrap_err().is_conflict());

        db.update_raffle(1, "summer", |r| {
            r.add_tickets(9, 3)?;
            r.winner = Some(9);
            Ok(())
        })
        .unwrap();
        raffle.add_tickets(9, 3).unwrap();
        raffle.winner = Some(9);
        assert_eq!(db.raffle(1, "summer").unwrap().unwrap(), raffle);
        assert_eq!(db.raffle_names(1).unwrap(), vec!["summer".to_string()]);
        let left = db
            .update_raffle(1, "summer", |r| r.remove_tickets(9, 1))
            .unwrap();
        assert_eq!(left, 2);
        assert!(db.update_raffle(1, "summer", |r| r.remove_tickets(9, 5)).is_err());
        assert_eq!(db.raffle(1, "summer").unwrap().unwrap().tickets_of(9), 2);

        assert!(db.delete_raffle(1, "summer").unwrap());
        assert!(db.update_raffle(1, "summer", |_| Ok(())).is_err());
    }

    #[test]
    fn test_delete_guild_cascades() {
        let db = GiftboxDb::open_in_memory().unwrap();
        let gw = giveaway(1, 7, 5);
        db.create_giveaway(&gw).unwrap();
        db.add_entrant(gw.key, 3).unwrap();
        db.guild_config(1).unwrap();
        db.save_donation_config(&DonationConfig::new(1, "coins")).unwrap();
        db.adjust_donation(1, "coins", 3, DonationAction::Add(1)).unwrap();
        db.create_raffle(&Raffle::new(1, "r")).unwrap();
        db.create_giveaway(&giveaway_in(2)).unwrap();

        db.delete_guild(1).unwrap();
        assert!(db.giveaway(gw.key).unwrap().is_none());
        assert_eq!(db.host_count(1, 7).unwrap(), 0);
        assert!(db.raffle(1, "r").unwrap().is_none());
        assert!(db.donation_configs(1).unwrap().is_empty());
        assert_eq!(db.timer_count().unwrap(), 1);
    }

    fn giveaway_in(guild: GuildId) -> Giveaway {
        let mut gw = giveaway(1, 7, 5);
        gw.key.guild_id = guild;
        gw
    }

    #[test]
    fn test_reopen_file_keeps_state() {
        let path = std::env::temp_dir().join(format!("giftbox-db-{}.db", uuid::Uuid::new_v4()));
        {
            let db = GiftboxDb::open(&path).unwrap();
            db.create_giveaway(&giveaway(1, 7, -1)).unwrap();
        }
        let db = GiftboxDb::open(&path).unwrap();
        assert_eq!(db.due_timers(Utc::now()).unwrap().len(), 1);
        drop(db);
        std::fs::remove_file(&path).ok();
        std::fs::remove_file(path.with_extension("db-wal")).ok();
        std::fs::remove_file(path.with_extension("db-shm")).ok();
    }
}

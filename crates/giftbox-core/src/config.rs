//! Giftbox configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GiftboxError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GiftboxConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub draw: DrawConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl GiftboxConfig {
    /// Load config from the default path (~/.giftbox/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GiftboxError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| GiftboxError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| GiftboxError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Giftbox home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".giftbox")
    }

    /// Secrets in the environment win over the file.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(token) = std::env::var("GIFTBOX_DISCORD_TOKEN") {
            if !token.is_empty() {
                self.notify.discord_token = token;
            }
        }
        if let Ok(key) = std::env::var("GIFTBOX_ACTIVITY_KEY") {
            if !key.is_empty() {
                self.activity.api_key = key;
            }
        }
        self
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.giftbox/giftbox.db".into() }

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn expanded_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Timer engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Upper bound on how long the dispatch loop sleeps between storage polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Delay before a timer whose processing failed is dispatched again.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Hard cap on one end-of-event run.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
}

fn default_poll_interval() -> u64 { 30 }
fn default_retry_delay() -> u64 { 15 }
fn default_dispatch_timeout() -> u64 { 120 }

impl TimerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs.max(1))
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            retry_delay_secs: default_retry_delay(),
            dispatch_timeout_secs: default_dispatch_timeout(),
        }
    }
}

/// Winner selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawConfig {
    /// Added to the sponsor's weight after multipliers when the sponsor enters.
    #[serde(default)]
    pub sponsor_bonus: u64,
    /// Reroll excludes every previous winner unless told otherwise.
    #[serde(default = "bool_true")]
    pub exclude_previous_winners: bool,
    /// Per (member, giveaway) cooldown on counted messages.
    #[serde(default = "default_message_cooldown")]
    pub message_cooldown_secs: u64,
}

fn bool_true() -> bool { true }
fn default_message_cooldown() -> u64 { 5 }

impl Default for DrawConfig {
    fn default() -> Self {
        Self {
            sponsor_bonus: 0,
            exclude_previous_winners: true,
            message_cooldown_secs: default_message_cooldown(),
        }
    }
}

/// Chat platform delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub discord_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Member lookups in flight at once while resolving a draw.
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,
}

fn default_notify_timeout() -> u64 { 10 }
fn default_max_concurrent_lookups() -> usize { 8 }
fn default_api_base() -> String { "https://discord.com/api/v10".into() }

impl NotifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn lookup_limit(&self) -> usize {
        self.max_concurrent_lookups.max(1)
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_notify_timeout(),
            discord_token: String::new(),
            api_base: default_api_base(),
            max_concurrent_lookups: default_max_concurrent_lookups(),
        }
    }
}

/// External activity-metric service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Empty disables lookups; thresholds then always fail.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_activity_timeout")]
    pub timeout_secs: u64,
}

fn default_activity_timeout() -> u64 { 5 }

impl ActivityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn enabled(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            timeout_secs: default_activity_timeout(),
        }
    }
}

/// Per-guild caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_channel_configs")]
    pub max_channel_configs: usize,
    #[serde(default = "default_max_deputy_members")]
    pub max_deputy_members: usize,
    #[serde(default = "default_max_deputy_roles")]
    pub max_deputy_roles: usize,
}

fn default_max_channel_configs() -> usize { 25 }
fn default_max_deputy_members() -> usize { 25 }
fn default_max_deputy_roles() -> usize { 10 }

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_channel_configs: default_max_channel_configs(),
            max_deputy_members: default_max_deputy_members(),
            max_deputy_roles: default_max_deputy_roles(),
        }
    }
}

//! # Giftbox Core
//!
//! Shared data model, configuration, errors and collaborator traits for the
//! giveaway and raffle engine.

pub mod config;
pub mod donation;
pub mod error;
pub mod giveaway;
pub mod rules;
pub mod settings;
pub mod templates;
pub mod traits;
pub mod types;

pub use config::GiftboxConfig;
pub use donation::{Donation, DonationAction, DonationConfig, RoleDelta};
pub use error::{GiftboxError, Result};
pub use giveaway::{CreditTarget, DonationLink, Giveaway, HostStats};
pub use rules::EligibilityRules;
pub use settings::{ChannelConfig, GuildConfig};
pub use traits::{ActivityService, ActivitySnapshot, Announcement, ChatPlatform};
pub use types::{ChannelId, EventKey, GuildId, MemberId, MessageId, RoleId};

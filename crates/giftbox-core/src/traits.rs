//! Collaborator interfaces: the chat platform and the activity-metric service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::Result;
use crate::types::{ChannelId, GuildId, MemberId, MessageId, RoleId};

/// A message posted to a channel, optionally as a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub channel_id: ChannelId,
    pub reply_to: Option<MessageId>,
    pub content: String,
}

/// Chat platform client. Every call must return within a bounded time;
/// callers additionally wrap them in timeouts.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn name(&self) -> &str;

    /// Role set of a guild member. `Ok(None)` when the member has left.
    async fn member_roles(&self, guild: GuildId, member: MemberId) -> Result<Option<BTreeSet<RoleId>>>;

    async fn announce(&self, announcement: &Announcement) -> Result<()>;

    /// Best-effort direct message.
    async fn direct_message(&self, member: MemberId, text: &str) -> Result<()>;
}

/// Overall and recent-window activity totals for a member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub total: u64,
    pub recent: u64,
}

#[async_trait]
pub trait ActivityService: Send + Sync {
    async fn snapshot(&self, guild: GuildId, member: MemberId) -> Result<ActivitySnapshot>;
}

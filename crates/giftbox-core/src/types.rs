//! Identifiers shared across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Chat platform snowflakes.
pub type GuildId = u64;
pub type ChannelId = u64;
pub type MessageId = u64;
pub type MemberId = u64;
pub type RoleId = u64;

/// Uniquely identifies a giveaway and the timer that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

impl EventKey {
    pub fn new(guild_id: GuildId, channel_id: ChannelId, message_id: MessageId) -> Self {
        Self {
            guild_id,
            channel_id,
            message_id,
        }
    }

    /// Link to the message on Discord.
    pub fn jump_url(&self) -> String {
        format!(
            "https://discord.com/channels/{}/{}/{}",
            self.guild_id, self.channel_id, self.message_id
        )
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.guild_id, self.channel_id, self.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_url() {
        let key = EventKey::new(1, 2, 3);
        assert_eq!(key.to_string(), "1/2/3");
        assert_eq!(key.jump_url(), "https://discord.com/channels/1/2/3");
    }
}

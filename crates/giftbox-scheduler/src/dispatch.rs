//! Discord REST implementation of the chat platform.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;

use giftbox_core::config::NotifyConfig;
use giftbox_core::error::{GiftboxError, Result};
use giftbox_core::traits::{Announcement, ChatPlatform};
use giftbox_core::types::{GuildId, MemberId, RoleId};

/// Longest rate-limit wait honoured before the single retry.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

pub struct DiscordPlatform {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

impl DiscordPlatform {
    pub fn new(config: &NotifyConfig) -> Result<Self> {
        if config.discord_token.is_empty() {
            return Err(GiftboxError::Config(
                "notify.discord_token is not set (or GIFTBOX_DISCORD_TOKEN)".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GiftboxError::Platform(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            token: config.discord_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    /// Sends a request, retrying once after a 429 using the advertised wait.
    async fn send(&self, build: impl Fn() -> reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = build()
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| GiftboxError::Platform(format!("Discord request failed: {e}")))?;
        if response.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }

        let header = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok());
        let wait = retry_after(header);
        tracing::warn!("⏳ Discord rate limited, retrying in {}ms", wait.as_millis());
        tokio::time::sleep(wait).await;

        build()
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| GiftboxError::Platform(format!("Discord request failed: {e}")))
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{path}", self.api_base);
        let response = self.send(|| self.client.post(&url).json(body)).await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(GiftboxError::Platform(format!(
                "Discord API error {status}: {error_text}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| GiftboxError::Platform(format!("Invalid Discord response: {e}")))
    }
}

/// Seconds from a `Retry-After` header, fractional allowed; one second when
/// absent or unreadable.
fn retry_after(header: Option<&str>) -> Duration {
    header
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::from_secs_f64(secs).min(MAX_RETRY_AFTER))
        .unwrap_or(Duration::from_secs(1))
}

/// Role ids from a guild member object; Discord sends snowflakes as strings.
fn parse_roles(member: &serde_json::Value) -> Result<BTreeSet<RoleId>> {
    let roles = member["roles"]
        .as_array()
        .ok_or_else(|| GiftboxError::Platform("member object has no roles".into()))?;
    roles
        .iter()
        .map(|r| {
            r.as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| GiftboxError::Platform(format!("bad role id: {r}")))
        })
        .collect()
}

fn message_body(announcement: &Announcement) -> serde_json::Value {
    let mut body = serde_json::json!({
        "content": announcement.content,
        "allowed_mentions": { "parse": ["users", "roles"] },
    });
    if let Some(message_id) = announcement.reply_to {
        body["message_reference"] = serde_json::json!({
            "message_id": message_id.to_string(),
            "fail_if_not_exists": false,
        });
    }
    body
}

#[async_trait]
impl ChatPlatform for DiscordPlatform {
    fn name(&self) -> &str {
        "discord"
    }

    async fn member_roles(&self, guild_id: GuildId, member: MemberId) -> Result<Option<BTreeSet<RoleId>>> {
        let url = format!("{}/guilds/{guild_id}/members/{member}", self.api_base);
        let response = self.send(|| self.client.get(&url)).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(GiftboxError::Platform(format!(
                "Discord member lookup failed: {}",
                response.status()
            )));
        }
        let member: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GiftboxError::Platform(format!("Invalid Discord response: {e}")))?;
        parse_roles(&member).map(Some)
    }

    async fn announce(&self, announcement: &Announcement) -> Result<()> {
        self.post(
            &format!("/channels/{}/messages", announcement.channel_id),
            &message_body(announcement),
        )
        .await?;
        Ok(())
    }

    async fn direct_message(&self, member: MemberId, text: &str) -> Result<()> {
        let channel = self
            .post(
                "/users/@me/channels",
                &serde_json::json!({ "recipient_id": member.to_string() }),
            )
            .await?;
        let channel_id = channel["id"]
            .as_str()
            .ok_or_else(|| GiftboxError::Platform("DM channel has no id".into()))?;
        self.post(
            &format!("/channels/{channel_id}/messages"),
            &serde_json::json!({ "content": text }),
        )
        .await?;
        Ok(())
    }
}

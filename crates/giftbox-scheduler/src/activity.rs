//! HTTP client for the external activity-metric service.

use async_trait::async_trait;

use giftbox_core::config::ActivityConfig;
use giftbox_core::error::{GiftboxError, Result};
use giftbox_core::traits::{ActivityService, ActivitySnapshot};
use giftbox_core::types::{GuildId, MemberId};

pub struct HttpActivityService {
    client: reqwest::Client,
    config: ActivityConfig,
}

impl HttpActivityService {
    pub fn new(config: ActivityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GiftboxError::Platform(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

/// Accepts `{total, recent}` or the leveling-bot style `{exp, weekly_exp}`.
fn parse_snapshot(body: &serde_json::Value) -> Result<ActivitySnapshot> {
    let field = |a: &str, b: &str| body[a].as_u64().or_else(|| body[b].as_u64());
    let total = field("total", "exp")
        .ok_or_else(|| GiftboxError::Platform("activity response has no total".into()))?;
    Ok(ActivitySnapshot {
        total,
        recent: field("recent", "weekly_exp").unwrap_or(0),
    })
}

#[async_trait]
impl ActivityService for HttpActivityService {
    async fn snapshot(&self, guild_id: GuildId, member: MemberId) -> Result<ActivitySnapshot> {
        if !self.config.enabled() {
            return Ok(ActivitySnapshot::default());
        }
        let url = format!(
            "{}/guild/{guild_id}/member/{member}",
            self.config.endpoint.trim_end_matches('/')
        );
        let mut request = self.client.get(&url);
        if !self.config.api_key.is_empty() {
            request = request.header("Authorization", self.config.api_key.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|e| GiftboxError::Platform(format!("Activity request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ActivitySnapshot::default());
        }
        if !response.status().is_success() {
            return Err(GiftboxError::Platform(format!(
                "Activity service error {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GiftboxError::Platform(format!("Invalid activity response: {e}")))?;
        parse_snapshot(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_shapes() {
        let plain = parse_snapshot(&serde_json::json!({ "total": 10, "recent": 3 })).unwrap();
        assert_eq!(plain, ActivitySnapshot { total: 10, recent: 3 });

        let leveling = parse_snapshot(&serde_json::json!({ "exp": 900, "weekly_exp": 40 })).unwrap();
        assert_eq!(leveling, ActivitySnapshot { total: 900, recent: 40 });

        let no_recent = parse_snapshot(&serde_json::json!({ "total": 5 })).unwrap();
        assert_eq!(no_recent.recent, 0);

        assert!(parse_snapshot(&serde_json::json!({ "level": 2 })).is_err());
    }

    #[tokio::test]
    async fn test_disabled_service_returns_zeros() {
        let service = HttpActivityService::new(ActivityConfig::default()).unwrap();
        assert_eq!(service.snapshot(1, 2).await.unwrap(), ActivitySnapshot::default());
    }
}

//! Discord-backed action executor.
//!
//! Carries out engine and scheduler decisions through serenity's HTTP client.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serenity::async_trait;
use serenity::builder::EditMember;
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId, MessageId, RoleId, UserId};
use serenity::model::Timestamp;

use crate::actions::{ActionExecutor, ModerationNotice};
use crate::clock::SharedClock;
use crate::config::SettingsStore;
use crate::error::{BulwarkError, Result};

/// Discord embed limits.
const MAX_EMBED_FIELDS: usize = 25;
const MAX_FIELD_VALUE: usize = 1024;
const MAX_DESCRIPTION: usize = 4096;

/// Executor that talks to the Discord REST API.
pub struct DiscordExecutor {
    http: Arc<Http>,
    mod_channel: ChannelId,
    settings: SettingsStore,
    clock: SharedClock,
}

impl DiscordExecutor {
    pub fn new(
        http: Arc<Http>,
        mod_channel_id: u64,
        settings: SettingsStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            http,
            mod_channel: ChannelId::new(mod_channel_id),
            settings,
            clock,
        }
    }

    /// When a timeout starting now would end.
    fn timeout_deadline(&self, duration: chrono::Duration) -> Result<Timestamp> {
        timeout_until(self.clock.now(), duration)
    }

    async fn send_to_channel(&self, channel: ChannelId, text: &str) -> Result<()> {
        self.http
            .send_message(channel, vec![], &serde_json::json!({ "content": text }))
            .await
            .map_err(discord_error)?;
        Ok(())
    }

    async fn send_dm(&self, user: UserId, text: &str) -> Result<()> {
        let channel = user.create_dm_channel(&*self.http).await.map_err(discord_error)?;
        self.send_to_channel(channel.id, text).await
    }
}

fn discord_error(e: serenity::Error) -> BulwarkError {
    BulwarkError::Discord(Box::new(e))
}

/// Embed payload for a moderator notice, trimmed to Discord's limits.
pub fn notice_payload(notice: &ModerationNotice) -> serde_json::Value {
    let fields: Vec<serde_json::Value> = notice
        .fields
        .iter()
        .take(MAX_EMBED_FIELDS)
        .map(|(name, value)| {
            serde_json::json!({
                "name": name,
                "value": truncate(value, MAX_FIELD_VALUE),
                "inline": value.len() <= 32,
            })
        })
        .collect();

    serde_json::json!({
        "embeds": [{
            "title": notice.title,
            "description": truncate(&notice.description, MAX_DESCRIPTION),
            "fields": fields,
        }]
    })
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit - 1).collect();
    out.push('…');
    out
}

/// Discord timestamp at which a timeout ends.
fn timeout_until(now: DateTime<Utc>, duration: chrono::Duration) -> Result<Timestamp> {
    Timestamp::from_unix_timestamp((now + duration).timestamp())
        .map_err(|e| BulwarkError::InternalState(format!("Invalid timestamp: {}", e)))
}

#[async_trait]
impl ActionExecutor for DiscordExecutor {
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<()> {
        self.http
            .delete_message(
                ChannelId::new(channel_id),
                MessageId::new(message_id),
                Some("Spam pressure exceeded"),
            )
            .await
            .map_err(discord_error)?;
        Ok(())
    }

    async fn silence_user(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()> {
        let Some(role) = self.settings.snapshot().member_role else {
            return Err(BulwarkError::Config(
                "MemberRole is not set, cannot silence".to_string(),
            ));
        };
        self.remove_role(guild_id, user_id, role, reason).await?;

        tracing::info!(guild_id = guild_id, user_id = user_id, "User silenced");
        Ok(())
    }

    async fn timeout_user(
        &self,
        guild_id: u64,
        user_id: u64,
        duration: chrono::Duration,
        reason: &str,
    ) -> Result<()> {
        let until = self.timeout_deadline(duration)?;
        let edit_member = EditMember::new()
            .disable_communication_until(until.to_string())
            .audit_log_reason(reason);

        self.http
            .edit_member(
                GuildId::new(guild_id),
                UserId::new(user_id),
                &edit_member,
                Some(reason),
            )
            .await
            .map_err(discord_error)?;

        tracing::info!(
            guild_id = guild_id,
            user_id = user_id,
            minutes = duration.num_minutes(),
            "User timed out"
        );
        Ok(())
    }

    async fn post_moderation_notice(&self, notice: &ModerationNotice) -> Result<()> {
        self.http
            .send_message(self.mod_channel, vec![], &notice_payload(notice))
            .await
            .map_err(discord_error)?;
        Ok(())
    }

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<()> {
        self.http
            .add_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await
            .map_err(discord_error)?;
        Ok(())
    }

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<()> {
        self.http
            .remove_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await
            .map_err(discord_error)?;
        Ok(())
    }

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()> {
        self.http
            .ban_user(GuildId::new(guild_id), UserId::new(user_id), 0, Some(reason))
            .await
            .map_err(discord_error)?;

        tracing::info!(guild_id = guild_id, user_id = user_id, "User banned");
        Ok(())
    }

    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()> {
        self.http
            .remove_ban(GuildId::new(guild_id), UserId::new(user_id), Some(reason))
            .await
            .map_err(discord_error)?;

        tracing::info!(guild_id = guild_id, user_id = user_id, "User unbanned");
        Ok(())
    }

    async fn send_message(&self, target_id: u64, text: &str) -> Result<()> {
        // Channel and user ids share one snowflake space; try the channel first.
        match self.send_to_channel(ChannelId::new(target_id), text).await {
            Ok(()) => Ok(()),
            Err(channel_err) => {
                tracing::debug!(target_id = target_id, error = %channel_err, "Not a channel, trying DM");
                self.send_dm(UserId::new(target_id), text)
                    .await
                    .map_err(|_| channel_err)
            }
        }
    }
}

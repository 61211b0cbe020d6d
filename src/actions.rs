//! Action executor seam between the engines and the chat platform.
//!
//! The engines decide; an `ActionExecutor` carries the decision out. Every
//! call goes through [`bounded`] so a slow platform cannot stall events or ticks.

use std::future::Future;
use std::time::Duration;

use serenity::async_trait;

use crate::error::{BulwarkError, Result};

/// A notice posted to the moderator channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationNotice {
    pub title: String,
    pub description: String,
    /// Ordered name/value pairs rendered as fields.
    pub fields: Vec<(String, String)>,
}

impl ModerationNotice {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Plain-text rendering used by text-only channels and logs.
    pub fn render(&self) -> String {
        let mut out = format!("**{}**\n{}", self.title, self.description);
        for (name, value) in &self.fields {
            out.push_str(&format!("\n**{}:** {}", name, value));
        }
        out
    }
}

/// Platform operations the engines and scheduled jobs rely on.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<()>;

    /// Remove the member role so the user can no longer talk.
    async fn silence_user(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()>;

    async fn timeout_user(
        &self,
        guild_id: u64,
        user_id: u64,
        duration: chrono::Duration,
        reason: &str,
    ) -> Result<()>;

    async fn post_moderation_notice(&self, notice: &ModerationNotice) -> Result<()>;

    async fn add_role(&self, guild_id: u64, user_id: u64, role_id: u64, reason: &str)
        -> Result<()>;

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<()>;

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()>;

    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()>;

    /// Send text to a channel, or a DM when `target_id` is a user.
    async fn send_message(&self, target_id: u64, text: &str) -> Result<()>;

    /// Advance the guild banner to the next configured image.
    async fn rotate_banner(&self, guild_id: u64) -> Result<()> {
        tracing::debug!(guild_id = guild_id, "No banners configured, skipping rotation");
        Ok(())
    }

    /// Post a suggestion into a quiet channel.
    async fn post_bored_command(&self, channel_id: u64) -> Result<()> {
        tracing::debug!(channel_id = channel_id, "No bored commands configured");
        Ok(())
    }
}

/// Run an executor call with an upper bound on how long it may take.
pub async fn bounded<F>(action: &'static str, timeout: Duration, call: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(BulwarkError::ActionTimeout {
            action,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::actions::{bounded, ModerationNotice};
    use crate::error::BulwarkError;

    #[test]
    fn notice_renders_fields_in_order() {
        let notice = ModerationNotice::new("Spam", "User silenced")
            .with_field("User", "<@1>")
            .with_field("Pressure", "70.0");
        assert_eq!(
            notice.render(),
            "**Spam**\nUser silenced\n**User:** <@1>\n**Pressure:** 70.0"
        );
    }

    #[tokio::test]
    async fn bounded_passes_through_result() {
        let result = bounded("send_message", Duration::from_secs(1), async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn bounded_times_out_slow_call() {
        let result = bounded("send_message", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(BulwarkError::ActionTimeout {
                action: "send_message",
                timeout_ms: 10
            })
        ));
    }
}

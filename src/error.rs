//! Error types for Bulwark.
//!
//! All errors are explicitly typed using thiserror. No panics in production code.

use thiserror::Error;

use crate::timeparse::TimeParseError;

/// Central error type for all Bulwark operations.
#[derive(Debug, Error)]
pub enum BulwarkError {
    /// Discord API error from serenity.
    #[error("Discord API error: {0}")]
    Discord(#[from] Box<serenity::Error>),

    /// Configuration error (missing env vars, invalid thresholds).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal state error (lock poisoning, invalid state transitions).
    #[error("Internal state error: {0}")]
    InternalState(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An action executor rejected or failed an action.
    #[error("Action failed: {0}")]
    Action(String),

    /// An action executor did not answer in time.
    #[error("Action {action} timed out after {timeout_ms}ms")]
    ActionTimeout {
        /// Name of the action that timed out.
        action: &'static str,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Free-form time text could not be parsed.
    #[error("{0}")]
    TimeParse(#[from] TimeParseError),
}

impl BulwarkError {
    /// Log error with full context using tracing.
    pub fn log_with_context(&self, context: &ErrorContext) {
        let summary = match self {
            // User input problems are expected
            Self::TimeParse(_) => {
                tracing::debug!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Rejected time expression"
                );
                return;
            }
            Self::Database(_) | Self::InternalState(_) => "Critical error occurred",
            Self::Discord(_) | Self::Action(_) | Self::ActionTimeout { .. } => {
                "Moderation action failed"
            }
            Self::Config(_) => "Configuration error",
            Self::Json(_) => "Data processing error",
        };

        tracing::error!(
            error = %self,
            critical = self.is_critical(),
            request_id = %context.request_id,
            user_id = ?context.user_id,
            guild_id = ?context.guild_id,
            operation = %context.operation,
            "{}",
            summary
        );
    }

    /// Check if this error is critical and requires alerting.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Database(_) | Self::InternalState(_))
    }
}

/// Context information for error logging.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Unique request identifier for correlation
    pub request_id: String,
    /// User ID if available
    pub user_id: Option<u64>,
    /// Guild ID if available
    pub guild_id: Option<u64>,
    /// Operation being performed
    pub operation: String,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            guild_id: None,
            operation: operation.into(),
        }
    }

    pub fn with_user_id(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_guild_id(mut self, guild_id: u64) -> Self {
        self.guild_id = Some(guild_id);
        self
    }
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_config() {
        let err = BulwarkError::Config("DISCORD_TOKEN not set".to_string());
        assert_eq!(err.to_string(), "Configuration error: DISCORD_TOKEN not set");
    }

    #[test]
    fn error_display_action_timeout() {
        let err = BulwarkError::ActionTimeout {
            action: "delete_message",
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "Action delete_message timed out after 5000ms"
        );
    }

    #[test]
    fn error_is_critical() {
        assert!(BulwarkError::Database("test".to_string()).is_critical());
        assert!(BulwarkError::InternalState("test".to_string()).is_critical());
        assert!(!BulwarkError::Action("missing role".to_string()).is_critical());
        assert!(!BulwarkError::Config("test".to_string()).is_critical());
    }

    #[test]
    fn error_context_builder() {
        let ctx = ErrorContext::new("tick")
            .with_user_id(12345)
            .with_guild_id(67890);

        assert_eq!(ctx.operation, "tick");
        assert_eq!(ctx.user_id, Some(12345));
        assert_eq!(ctx.guild_id, Some(67890));
        assert!(uuid::Uuid::parse_str(&ctx.request_id).is_ok());
    }

    #[test]
    fn time_parse_error_displays_verbatim() {
        let parse = TimeParseError::new("ten", "not a positive integer", 1);
        let err = BulwarkError::from(parse.clone());
        assert_eq!(err.to_string(), parse.to_string());
        assert!(!err.is_critical());
    }

    #[test]
    fn logging_does_not_panic_for_any_variant() {
        let ctx = ErrorContext::new("log").with_user_id(1).with_guild_id(2);
        BulwarkError::Database("locked".to_string()).log_with_context(&ctx);
        BulwarkError::Action("missing role".to_string()).log_with_context(&ctx);
        BulwarkError::from(TimeParseError::new("x", "not a time", 0)).log_with_context(&ctx);
    }

    #[test]
    fn error_context_generates_request_id() {
        let ctx1 = ErrorContext::new("op1");
        let ctx2 = ErrorContext::new("op2");
        assert_ne!(ctx1.request_id, ctx2.request_id);
    }
}

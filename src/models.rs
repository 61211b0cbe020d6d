//! Core data models shared by the engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Punctuation that does not count as unusual.
const COMMON_PUNCTUATION: &[char] = &[
    '.', ',', '!', '?', '\'', '"', '-', ':', ';', '(', ')', '/', '&', '*', '@', '#', '<', '>',
    '_', '%', '+', '=',
];

/// A message observed from the gateway.
#[derive(Debug, Clone)]
pub struct ObservedMessage {
    pub message_id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    pub guild_id: Option<u64>,
    pub author_role_ids: Vec<u64>,
    pub content: String,
    pub mention_count: u32,
    pub attachment_count: u32,
}

/// Features of a single message that feed the pressure score.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Length in characters.
    pub length: u32,
    pub newlines: u32,
    pub mentions: u32,
    /// Embeds plus attachments.
    pub attachments: u32,
    /// Identical (case-insensitive) to the author's previous message.
    pub is_repeat: bool,
    /// Characters that are not whitespace, letters, digits, or common punctuation.
    pub unusual_chars: u32,
}

impl MessageMetadata {
    /// Extract metadata from raw message text.
    ///
    /// `previous_hash` is the content hash of the author's previous message.
    pub fn analyze(
        content: &str,
        mentions: u32,
        attachments: u32,
        previous_hash: Option<&str>,
    ) -> Self {
        let hash = content_hash(content);
        Self {
            length: content.chars().count() as u32,
            newlines: content.matches('\n').count() as u32,
            mentions,
            attachments,
            is_repeat: previous_hash.is_some_and(|prev| prev == hash),
            unusual_chars: count_unusual_chars(content),
        }
    }
}

/// A message kept for bulk deletion after a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: u64,
    pub channel_id: u64,
    pub timestamp: DateTime<Utc>,
}

/// A member join kept in the raid window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRecord {
    pub user_id: u64,
    pub joined_at: DateTime<Utc>,
}

/// SHA-256 of the trimmed, lowercased content, hex encoded.
///
/// ```
/// use bulwark::models::content_hash;
///
/// assert_eq!(content_hash("Hello"), content_hash("  hello "));
/// assert_ne!(content_hash("hello"), content_hash("hello!"));
/// ```
pub fn content_hash(content: &str) -> String {
    let normalized = content.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Count characters outside whitespace, letters, digits and common punctuation.
pub fn count_unusual_chars(content: &str) -> u32 {
    content
        .chars()
        .filter(|c| {
            !c.is_whitespace() && !c.is_alphanumeric() && !COMMON_PUNCTUATION.contains(c)
        })
        .count() as u32
}

#[cfg(test)]
mod tests {
    use crate::models::{content_hash, count_unusual_chars, MessageMetadata};

    #[test]
    fn analyze_counts_length_and_lines() {
        let meta = MessageMetadata::analyze("one\ntwo\nthree", 2, 1, None);
        assert_eq!(meta.length, 13);
        assert_eq!(meta.newlines, 2);
        assert_eq!(meta.mentions, 2);
        assert_eq!(meta.attachments, 1);
        assert!(!meta.is_repeat);
    }

    #[test]
    fn analyze_detects_case_insensitive_repeat() {
        let previous = content_hash("BUY NOW");
        let meta = MessageMetadata::analyze("buy now", 0, 0, Some(&previous));
        assert!(meta.is_repeat);
    }

    #[test]
    fn plain_text_has_no_unusual_chars() {
        assert_eq!(count_unusual_chars("Hello, world! It's 5 o'clock."), 0);
    }

    #[test]
    fn symbols_are_unusual() {
        assert_eq!(count_unusual_chars("hi ☃☃ ▓"), 3);
    }

    #[test]
    fn non_latin_letters_are_not_unusual() {
        assert_eq!(count_unusual_chars("привет こんにちは"), 0);
    }

    #[test]
    fn length_counts_chars_not_bytes() {
        let meta = MessageMetadata::analyze("héllo", 0, 0, None);
        assert_eq!(meta.length, 5);
    }
}

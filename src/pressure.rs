//! Spam pressure engine.
//!
//! Every user carries a pressure score. Each message first decays the score
//! by the time since the previous message, then adds pressure for the
//! message's features. Crossing `SpamMaxPressure` from at-or-below is a
//! violation: recent messages are deleted, the user is silenced (or timed
//! out if silenced recently), and moderators get the breakdown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::actions::{bounded, ActionExecutor, ModerationNotice};
use crate::clock::SharedClock;
use crate::config::{ModerationSettings, SettingsStore};
use crate::error::ErrorContext;
use crate::models::{content_hash, MessageMetadata, MessageRecord, ObservedMessage};

/// Pressure after `elapsed_secs` of decay at `per_second`, never below zero.
///
/// ```
/// use bulwark::pressure::decay;
///
/// assert_eq!(decay(30.0, 2.5, 4.0), 20.0);
/// assert_eq!(decay(30.0, 60.0, 4.0), 0.0);
/// ```
pub fn decay(pressure: f64, elapsed_secs: f64, per_second: f64) -> f64 {
    (pressure - elapsed_secs.max(0.0) * per_second).max(0.0)
}

/// One contribution to a message's pressure.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureFactor {
    pub name: &'static str,
    pub amount: f64,
    pub explanation: String,
}

/// Audit trail of how a message was scored.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureBreakdown {
    /// Largest contributor first, base pressure last.
    pub factors: Vec<PressureFactor>,
    /// Pressure after this message.
    pub total: f64,
}

impl PressureBreakdown {
    fn score(meta: &MessageMetadata, settings: &ModerationSettings) -> Vec<PressureFactor> {
        let weighted = [
            (
                "Length",
                f64::from(meta.length) * settings.spam_length_pressure,
                format!("{} characters", meta.length),
            ),
            (
                "Lines",
                f64::from(meta.newlines) * settings.spam_line_pressure,
                format!("{} line breaks", meta.newlines),
            ),
            (
                "Mentions",
                f64::from(meta.mentions) * settings.spam_ping_pressure,
                format!("{} mentions", meta.mentions),
            ),
            (
                "Attachments",
                f64::from(meta.attachments) * settings.spam_image_pressure,
                format!("{} embeds or attachments", meta.attachments),
            ),
            (
                "Repeat",
                if meta.is_repeat {
                    settings.spam_repeat_pressure
                } else {
                    0.0
                },
                "same as previous message".to_string(),
            ),
            (
                "Unusual characters",
                f64::from(meta.unusual_chars) * settings.spam_unusual_character_pressure,
                format!("{} unusual characters", meta.unusual_chars),
            ),
        ];

        let mut factors: Vec<PressureFactor> = weighted
            .into_iter()
            .filter(|(_, amount, _)| *amount > 0.0)
            .map(|(name, amount, explanation)| PressureFactor {
                name,
                amount,
                explanation,
            })
            .collect();
        factors.sort_by(|a, b| b.amount.total_cmp(&a.amount));

        factors.push(PressureFactor {
            name: "Base",
            amount: settings.spam_base_pressure,
            explanation: "every message".to_string(),
        });
        factors
    }

    /// Pressure this message added.
    pub fn added(&self) -> f64 {
        self.factors.iter().map(|f| f.amount).sum()
    }

    /// The biggest factor other than base pressure, if any.
    pub fn top_factor(&self) -> Option<&PressureFactor> {
        self.factors.first().filter(|f| f.name != "Base")
    }
}

/// Result of scoring one message against a user's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Pressure after decay, before this message.
    pub previous: f64,
    pub total: f64,
    pub breakdown: PressureBreakdown,
    /// Crossed the maximum on this message.
    pub violated: bool,
}

/// Per-user spam state.
#[derive(Debug, Clone, Default)]
pub struct PressureState {
    pub current_pressure: f64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_hash: Option<String>,
    /// Messages still inside the delete lookback window.
    pub recent_messages: VecDeque<MessageRecord>,
    pub last_silenced_at: Option<DateTime<Utc>>,
}

impl PressureState {
    /// Pressure as of `now`.
    pub fn decayed(&self, now: DateTime<Utc>, settings: &ModerationSettings) -> f64 {
        match self.last_message_at {
            Some(last) => decay(
                self.current_pressure,
                seconds_between(last, now),
                settings.decay_per_second(),
            ),
            None => self.current_pressure,
        }
    }

    /// Decay, then add this message's pressure.
    pub fn observe(
        &mut self,
        meta: &MessageMetadata,
        now: DateTime<Utc>,
        settings: &ModerationSettings,
    ) -> Observation {
        let previous = self.decayed(now, settings);
        let factors = PressureBreakdown::score(meta, settings);
        let added: f64 = factors.iter().map(|f| f.amount).sum();
        let total = previous + added;

        self.current_pressure = total;
        self.last_message_at = Some(now);

        Observation {
            previous,
            total,
            violated: previous <= settings.spam_max_pressure && total > settings.spam_max_pressure,
            breakdown: PressureBreakdown { factors, total },
        }
    }

    /// Keep the message for lookback deletion and drop expired entries.
    fn remember(&mut self, record: MessageRecord, lookback: Duration) {
        self.recent_messages.push_back(record);
        let cutoff = record.timestamp - lookback;
        while self
            .recent_messages
            .front()
            .is_some_and(|m| m.timestamp < cutoff)
        {
            self.recent_messages.pop_front();
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// What happens to a user who violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sanction {
    /// Member role removed.
    Silence,
    /// Already silenced recently.
    Timeout { minutes: u64 },
}

/// Everything the engine decided about a message.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureOutcome {
    pub user_id: u64,
    pub observation: Observation,
    /// Bypassed user/role, ignored channel, or spam handling disabled.
    pub exempt: bool,
    pub sanction: Option<Sanction>,
    /// Offending message plus recent messages inside the lookback window.
    pub messages_to_delete: Vec<MessageRecord>,
}

/// Spam pressure engine with per-user locking.
pub struct PressureEngine {
    /// Each user has its own FIFO lock; users never block each other.
    states: DashMap<u64, Arc<Mutex<PressureState>>>,
    settings: SettingsStore,
    clock: SharedClock,
    executor: Arc<dyn ActionExecutor>,
    action_timeout: StdDuration,
}

impl PressureEngine {
    pub fn new(
        settings: SettingsStore,
        clock: SharedClock,
        executor: Arc<dyn ActionExecutor>,
        action_timeout: StdDuration,
    ) -> Self {
        Self {
            states: DashMap::new(),
            settings,
            clock,
            executor,
            action_timeout,
        }
    }

    fn state_for(&self, user_id: u64) -> Arc<Mutex<PressureState>> {
        self.states
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(PressureState::default())))
            .clone()
    }

    /// Score a message and decide on sanctions without acting on them.
    pub async fn observe(&self, message: &ObservedMessage) -> PressureOutcome {
        let settings = self.settings.snapshot();
        let state = self.state_for(message.author_id);
        let mut state = state.lock().await;
        let now = self.clock.now();

        let meta = MessageMetadata::analyze(
            &message.content,
            message.mention_count,
            message.attachment_count,
            state.last_message_hash.as_deref(),
        );
        let observation = state.observe(&meta, now, &settings);
        state.last_message_hash = Some(content_hash(&message.content));

        let lookback = Duration::seconds(settings.spam_message_delete_lookback as i64);
        state.remember(
            MessageRecord {
                message_id: message.message_id,
                channel_id: message.channel_id,
                timestamp: now,
            },
            lookback,
        );

        let exempt = is_exempt(message, &settings);
        let mut sanction = None;
        let mut messages_to_delete = Vec::new();

        if observation.violated && !exempt {
            let escalation = Duration::seconds(settings.spam_silence_escalation_window as i64);
            sanction = Some(match state.last_silenced_at {
                Some(at) if now - at <= escalation => Sanction::Timeout {
                    minutes: settings.spam_timeout_minutes,
                },
                _ => Sanction::Silence,
            });
            state.last_silenced_at = Some(now);
            messages_to_delete = state.recent_messages.drain(..).collect();
        } else if observation.violated {
            tracing::debug!(
                user_id = message.author_id,
                channel_id = message.channel_id,
                total = observation.total,
                "Exempt user exceeded spam pressure"
            );
        }

        PressureOutcome {
            user_id: message.author_id,
            observation,
            exempt,
            sanction,
            messages_to_delete,
        }
    }

    /// Score a message and carry out any sanction.
    pub async fn handle_message(&self, message: &ObservedMessage) -> PressureOutcome {
        let outcome = self.observe(message).await;
        if let (Some(sanction), Some(guild_id)) = (outcome.sanction, message.guild_id) {
            self.enforce(guild_id, message.channel_id, &outcome, sanction)
                .await;
        }
        outcome
    }

    async fn enforce(
        &self,
        guild_id: u64,
        channel_id: u64,
        outcome: &PressureOutcome,
        sanction: Sanction,
    ) {
        let user_id = outcome.user_id;
        let context = ErrorContext::new("spam_enforcement")
            .with_user_id(user_id)
            .with_guild_id(guild_id);

        tracing::warn!(
            user_id = user_id,
            guild_id = guild_id,
            pressure = outcome.observation.total,
            sanction = ?sanction,
            "Spam pressure exceeded"
        );

        for record in &outcome.messages_to_delete {
            let call = self
                .executor
                .delete_message(record.channel_id, record.message_id);
            if let Err(e) = bounded("delete_message", self.action_timeout, call).await {
                e.log_with_context(&context);
            }
        }

        let reason = format!("Spam pressure {:.1}", outcome.observation.total);
        let (result, verdict) = match sanction {
            Sanction::Silence => (
                bounded(
                    "silence_user",
                    self.action_timeout,
                    self.executor.silence_user(guild_id, user_id, &reason),
                )
                .await,
                "silenced".to_string(),
            ),
            Sanction::Timeout { minutes } => (
                bounded(
                    "timeout_user",
                    self.action_timeout,
                    self.executor.timeout_user(
                        guild_id,
                        user_id,
                        Duration::minutes(minutes as i64),
                        &reason,
                    ),
                )
                .await,
                format!("timed out for {} minutes (silenced again too soon)", minutes),
            ),
        };
        if let Err(e) = &result {
            e.log_with_context(&context);
        }

        let settings = self.settings.snapshot();
        let mut notice = ModerationNotice::new(
            "Spam detected",
            format!(
                "<@{}> reached pressure {:.1} (max {:.1}) and was {}.",
                user_id, outcome.observation.total, settings.spam_max_pressure, verdict
            ),
        )
        .with_field("Channel", format!("<#{}>", channel_id))
        .with_field(
            "Messages deleted",
            outcome.messages_to_delete.len().to_string(),
        );
        for factor in &outcome.observation.breakdown.factors {
            notice = notice.with_field(
                factor.name,
                format!("+{:.2} ({})", factor.amount, factor.explanation),
            );
        }
        if result.is_err() {
            notice = notice.with_field("Warning", "The sanction could not be applied");
        }

        let call = self.executor.post_moderation_notice(&notice);
        if let Err(e) = bounded("post_moderation_notice", self.action_timeout, call).await {
            e.log_with_context(&context);
        }
    }

    /// Current decayed pressure of a user.
    pub async fn pressure_of(&self, user_id: u64) -> f64 {
        let Some(state) = self.states.get(&user_id).map(|s| s.value().clone()) else {
            return 0.0;
        };
        let settings = self.settings.snapshot();
        let state = state.lock().await;
        state.decayed(self.clock.now(), &settings)
    }

    /// Clear a user's pressure and history.
    pub fn reset(&self, user_id: u64) {
        self.states.remove(&user_id);
    }

    /// Drop users whose pressure has fully decayed and who have no recent messages.
    ///
    /// Users busy in another task are kept.
    pub fn forget_idle(&self) -> usize {
        let settings = self.settings.snapshot();
        let now = self.clock.now();
        let lookback = Duration::seconds(settings.spam_message_delete_lookback as i64);
        let escalation = Duration::seconds(settings.spam_silence_escalation_window as i64);
        let before = self.states.len();

        self.states.retain(|_, state| match state.try_lock() {
            Ok(state) => {
                state.decayed(now, &settings) > 0.0
                    || state.last_message_at.is_some_and(|at| now - at < lookback)
                    || state.last_silenced_at.is_some_and(|at| now - at <= escalation)
            }
            Err(_) => true,
        });

        before - self.states.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.states.len()
    }
}

fn is_exempt(message: &ObservedMessage, settings: &ModerationSettings) -> bool {
    !settings.spam_enabled
        || message.guild_id.is_none()
        || settings.spam_bypass_users.contains(&message.author_id)
        || settings.spam_ignored_channels.contains(&message.channel_id)
        || message
            .author_role_ids
            .iter()
            .any(|role| settings.spam_bypass_roles.contains(role))
}


#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use crate::pressure::decay;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Decay is never negative and matches the linear formula.
        #[test]
        fn prop_decay_formula(
            pressure in 0.0f64..1000.0,
            elapsed in 0.0f64..10_000.0,
            rate in 0.001f64..100.0,
        ) {
            let decayed = decay(pressure, elapsed, rate);
            prop_assert!(decayed >= 0.0);
            prop_assert_eq!(decayed, (pressure - elapsed * rate).max(0.0));
        }

        /// Waiting longer never leaves more pressure.
        #[test]
        fn prop_decay_monotonic(
            pressure in 0.0f64..1000.0,
            a in 0.0f64..10_000.0,
            b in 0.0f64..10_000.0,
            rate in 0.001f64..100.0,
        ) {
            let (short, long) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(decay(pressure, long, rate) <= decay(pressure, short, rate));
        }
    }
}

//! Raid detection and response.
//!
//! Counts joins per guild inside a rolling window and walks a three-level
//! state machine. Escalation can jump straight to the level the join count
//! warrants; de-escalation happens one level per scheduled re-check.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::actions::{bounded, ActionExecutor, ModerationNotice};
use crate::clock::SharedClock;
use crate::config::{ModerationSettings, SettingsStore};
use crate::error::{ErrorContext, Result};
use crate::models::JoinRecord;
use crate::scheduler::{JobAction, RepeatType, ScheduledJob, Scheduler};

/// Raid severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum RaidLevel {
    #[default]
    None,
    Small,
    Large,
}

impl RaidLevel {
    /// One step down.
    pub fn lower(self) -> Self {
        match self {
            RaidLevel::Large => RaidLevel::Small,
            RaidLevel::Small | RaidLevel::None => RaidLevel::None,
        }
    }

    /// Joins inside the window needed to sustain this level.
    fn threshold(self, settings: &ModerationSettings) -> u32 {
        match self {
            RaidLevel::None => 0,
            RaidLevel::Small => settings.small_raid_size,
            RaidLevel::Large => settings.large_raid_size,
        }
    }

    fn recheck_after(self, settings: &ModerationSettings) -> Duration {
        match self {
            RaidLevel::Large => Duration::minutes(settings.large_raid_decay as i64),
            RaidLevel::Small | RaidLevel::None => {
                Duration::minutes(settings.small_raid_decay as i64)
            }
        }
    }
}

/// Per-guild raid state.
#[derive(Debug, Clone, Default)]
pub struct RaidState {
    pub recent_joins: VecDeque<JoinRecord>,
    pub level: RaidLevel,
    pub level_entered_at: Option<DateTime<Utc>>,
    /// The one pending re-check job for this guild.
    pub pending_check: Option<String>,
}

impl RaidState {
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self
            .recent_joins
            .front()
            .is_some_and(|j| j.joined_at < cutoff)
        {
            self.recent_joins.pop_front();
        }
    }

    fn join_count(&self) -> u32 {
        self.recent_joins.len() as u32
    }

    /// New joins to this guild are silenced on arrival.
    pub fn auto_silence(&self) -> bool {
        self.level == RaidLevel::Large
    }
}

/// Result of recording a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub level: RaidLevel,
    /// Set when this join escalated the raid.
    pub escalated_to: Option<RaidLevel>,
    /// Users silenced because of this join.
    pub silenced: Vec<u64>,
}

/// Raid detector for every guild the bot is in.
pub struct RaidDetector {
    guilds: RwLock<HashMap<u64, RaidState>>,
    settings: SettingsStore,
    clock: SharedClock,
    scheduler: Arc<Scheduler>,
    executor: Arc<dyn ActionExecutor>,
    action_timeout: StdDuration,
}

impl RaidDetector {
    pub fn new(
        settings: SettingsStore,
        clock: SharedClock,
        scheduler: Arc<Scheduler>,
        executor: Arc<dyn ActionExecutor>,
        action_timeout: StdDuration,
    ) -> Self {
        Self {
            guilds: RwLock::new(HashMap::new()),
            settings,
            clock,
            scheduler,
            executor,
            action_timeout,
        }
    }

    /// Record a member join and react to any escalation.
    pub async fn record_join(
        &self,
        guild_id: u64,
        user_id: u64,
        joined_at: DateTime<Utc>,
    ) -> Result<JoinOutcome> {
        let settings = self.settings.snapshot();
        if !settings.raid_protection_enabled {
            self.disable(guild_id).await?;
            return Ok(JoinOutcome {
                level: RaidLevel::None,
                escalated_to: None,
                silenced: Vec::new(),
            });
        }

        let now = self.clock.now();
        let window = Duration::seconds(settings.recent_join_decay as i64);

        let (level, escalated_to, count, joiners, silence_joiner) = {
            let mut guilds = self.guilds.write().await;
            let state = guilds.entry(guild_id).or_default();
            state.recent_joins.push_back(JoinRecord { user_id, joined_at });
            state.prune(now, window);
            let count = state.join_count();

            let target = if count >= settings.large_raid_size && state.level < RaidLevel::Large {
                Some(RaidLevel::Large)
            } else if count >= settings.small_raid_size && state.level < RaidLevel::Small {
                Some(RaidLevel::Small)
            } else {
                None
            };

            if let Some(target) = target {
                state.level = target;
                state.level_entered_at = Some(now);
            }

            let joiners: Vec<u64> = state.recent_joins.iter().map(|j| j.user_id).collect();
            let silence_joiner = target.is_none()
                && (state.auto_silence() || settings.auto_silence_new_joins);
            (state.level, target, count, joiners, silence_joiner)
        };

        if let Some(target) = escalated_to {
            let job_id = self.schedule_recheck(guild_id, target, now, &settings).await?;
            self.install_recheck(guild_id, target, job_id).await?;
        }

        let mut silenced = Vec::new();
        match escalated_to {
            Some(RaidLevel::Large) => {
                tracing::warn!(guild_id = guild_id, joins = count, "Large raid detected");
                for user in joiners {
                    if self.silence(guild_id, user).await {
                        silenced.push(user);
                    }
                }
                self.notify(
                    guild_id,
                    ModerationNotice::new(
                        "Large raid detected",
                        format!(
                            "{} members joined in the last {} seconds. New members are being silenced.",
                            count, settings.recent_join_decay
                        ),
                    )
                    .with_field("Level", "Large")
                    .with_field("Silenced", silenced.len().to_string()),
                )
                .await;
            }
            Some(_) => {
                tracing::warn!(guild_id = guild_id, joins = count, "Possible raid detected");
                self.notify(
                    guild_id,
                    ModerationNotice::new(
                        "Possible raid",
                        format!(
                            "{} members joined in the last {} seconds.",
                            count, settings.recent_join_decay
                        ),
                    )
                    .with_field("Level", "Small")
                    .with_field("Recent joins", mention_list(&joiners)),
                )
                .await;
            }
            None => {
                if silence_joiner && self.silence(guild_id, user_id).await {
                    silenced.push(user_id);
                }
            }
        }

        Ok(JoinOutcome {
            level,
            escalated_to,
            silenced,
        })
    }

    /// Scheduled re-check: step down one level if joins have slowed.
    pub async fn check_decay(&self, guild_id: u64) -> Result<RaidLevel> {
        let settings = self.settings.snapshot();
        if !settings.raid_protection_enabled {
            self.disable(guild_id).await?;
            return Ok(RaidLevel::None);
        }

        let now = self.clock.now();
        let window = Duration::seconds(settings.recent_join_decay as i64);

        let (previous, level, count, consumed) = {
            let mut guilds = self.guilds.write().await;
            let Some(state) = guilds.get_mut(&guild_id) else {
                return Ok(RaidLevel::None);
            };
            state.prune(now, window);
            let count = state.join_count();
            let previous = state.level;

            let consumed = state.pending_check.take();
            if previous == RaidLevel::None {
                drop(guilds);
                if let Some(job_id) = consumed {
                    self.scheduler.remove_job(&job_id).await?;
                }
                return Ok(RaidLevel::None);
            }

            let next = if count < previous.threshold(&settings) {
                previous.lower()
            } else {
                previous
            };
            if next != previous {
                state.level = next;
                state.level_entered_at = Some(now);
            }
            (previous, next, count, consumed)
        };

        // Drop the check that triggered this run
        if let Some(job_id) = consumed {
            self.scheduler.remove_job(&job_id).await?;
        }
        if level != RaidLevel::None {
            let job_id = self.schedule_recheck(guild_id, level, now, &settings).await?;
            self.install_recheck(guild_id, level, job_id).await?;
        }

        if level == previous {
            tracing::info!(guild_id = guild_id, joins = count, level = ?level, "Raid still active");
            return Ok(level);
        }

        tracing::info!(guild_id = guild_id, from = ?previous, to = ?level, "Raid de-escalated");

        let notice = if level == RaidLevel::None {
            ModerationNotice::new("Raid over", "Joins are back to normal.")
        } else {
            ModerationNotice::new(
                "Raid subsiding",
                "Joins have slowed. New members are no longer silenced.",
            )
            .with_field("Level", "Small")
        };
        self.notify(guild_id, notice.with_field("Recent joins", count.to_string()))
            .await;

        Ok(level)
    }

    /// Drop all raid state for a guild without notifying anyone.
    pub async fn disable(&self, guild_id: u64) -> Result<()> {
        let Some(state) = self.guilds.write().await.remove(&guild_id) else {
            return Ok(());
        };
        if let Some(job_id) = state.pending_check {
            self.scheduler.remove_job(&job_id).await?;
        }
        tracing::info!(guild_id = guild_id, level = ?state.level, "Raid state cleared");
        Ok(())
    }

    /// Whether new joins to this guild are silenced on arrival.
    ///
    /// `AutoSilenceNewJoins` is an operator override that applies to every
    /// guild; otherwise only a guild in a Large raid silences its joiners.
    pub async fn should_auto_silence(&self, guild_id: u64) -> bool {
        let settings = self.settings.snapshot();
        if !settings.raid_protection_enabled {
            return false;
        }
        settings.auto_silence_new_joins
            || self
                .guilds
                .read()
                .await
                .get(&guild_id)
                .is_some_and(RaidState::auto_silence)
    }

    pub async fn level(&self, guild_id: u64) -> RaidLevel {
        self.guilds
            .read()
            .await
            .get(&guild_id)
            .map(|s| s.level)
            .unwrap_or_default()
    }

    pub async fn pending_check(&self, guild_id: u64) -> Option<String> {
        self.guilds
            .read()
            .await
            .get(&guild_id)
            .and_then(|s| s.pending_check.clone())
    }

    /// Make `job_id` the guild's one pending check if the guild is still at
    /// `level`, otherwise drop it. Any check it replaces is removed.
    async fn install_recheck(&self, guild_id: u64, level: RaidLevel, job_id: String) -> Result<()> {
        let stale = {
            let mut guilds = self.guilds.write().await;
            match guilds.get_mut(&guild_id) {
                Some(state) if state.level == level => state.pending_check.replace(job_id),
                _ => Some(job_id),
            }
        };
        if let Some(stale) = stale {
            self.scheduler.remove_job(&stale).await?;
        }
        Ok(())
    }

    async fn schedule_recheck(
        &self,
        guild_id: u64,
        level: RaidLevel,
        now: DateTime<Utc>,
        settings: &ModerationSettings,
    ) -> Result<String> {
        let job = ScheduledJob::new(
            JobAction::RaidDecay { guild_id },
            now,
            (now + level.recheck_after(settings)).fixed_offset(),
            RepeatType::None,
        );
        self.scheduler.create_job(job).await
    }

    async fn silence(&self, guild_id: u64, user_id: u64) -> bool {
        let call = self
            .executor
            .silence_user(guild_id, user_id, "Raid protection");
        match bounded("silence_user", self.action_timeout, call).await {
            Ok(()) => true,
            Err(e) => {
                e.log_with_context(
                    &ErrorContext::new("raid_silence")
                        .with_guild_id(guild_id)
                        .with_user_id(user_id),
                );
                false
            }
        }
    }

    async fn notify(&self, guild_id: u64, notice: ModerationNotice) {
        let call = self.executor.post_moderation_notice(&notice);
        if let Err(e) = bounded("post_moderation_notice", self.action_timeout, call).await {
            e.log_with_context(&ErrorContext::new("raid_notice").with_guild_id(guild_id));
        }
    }
}

fn mention_list(users: &[u64]) -> String {
    const SHOWN: usize = 20;
    let mut out: Vec<String> = users.iter().take(SHOWN).map(|u| format!("<@{}>", u)).collect();
    if users.len() > SHOWN {
        out.push(format!("and {} more", users.len() - SHOWN));
    }
    out.join(" ")
}

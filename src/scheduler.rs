//! Durable job scheduler.
//!
//! Jobs are executed by a host-driven [`Scheduler::tick`]. Repeating jobs are
//! rescheduled from their previous execution time, never from `now`, so they
//! do not drift:
//!
//! ```text
//! Relative  execute_at + k * interval      (smallest k with result > now)
//! Daily     execute_at + k days            (wall-clock time kept)
//! Weekly    execute_at + 7k days
//! Yearly    execute_at with year + k       (years lacking the date are skipped)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serenity::async_trait;
use tokio::sync::Mutex;

use crate::database::Database;
use crate::error::Result;
use crate::timeparse::{ParsedDateTime, RepeatHint};

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum JobAction {
    AddRole {
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        #[serde(default)]
        reason: Option<String>,
    },
    RemoveRole {
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        #[serde(default)]
        reason: Option<String>,
    },
    Unban {
        guild_id: u64,
        user_id: u64,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Send text to a channel or, for user ids, a DM.
    Echo { target_id: u64, content: String },
    BannerRotation { guild_id: u64 },
    BoredCommands { channel_id: u64 },
    /// Re-check a guild's raid level.
    RaidDecay { guild_id: u64 },
}

impl JobAction {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddRole { .. } => "add_role",
            Self::RemoveRole { .. } => "remove_role",
            Self::Unban { .. } => "unban",
            Self::Echo { .. } => "echo",
            Self::BannerRotation { .. } => "banner_rotation",
            Self::BoredCommands { .. } => "bored_commands",
            Self::RaidDecay { .. } => "raid_decay",
        }
    }
}

/// Recurrence rule of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatType {
    #[default]
    None,
    Relative,
    Daily,
    Weekly,
    Yearly,
}

impl RepeatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Relative => "Relative",
            Self::Daily => "Daily",
            Self::Weekly => "Weekly",
            Self::Yearly => "Yearly",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "None" => Some(Self::None),
            "Relative" => Some(Self::Relative),
            "Daily" => Some(Self::Daily),
            "Weekly" => Some(Self::Weekly),
            "Yearly" => Some(Self::Yearly),
            _ => None,
        }
    }
}

impl From<Option<RepeatHint>> for RepeatType {
    fn from(hint: Option<RepeatHint>) -> Self {
        match hint {
            None => Self::None,
            Some(RepeatHint::Relative) => Self::Relative,
            Some(RepeatHint::Daily) => Self::Daily,
            Some(RepeatHint::Weekly) => Self::Weekly,
            Some(RepeatHint::Yearly) => Self::Yearly,
        }
    }
}

/// A pending job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Keeps the offset it was requested in, so daily jobs hold their wall-clock time.
    pub execute_at: DateTime<FixedOffset>,
    /// Serialized as `null` until the first execution of a repeating job.
    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
    pub action: JobAction,
    #[serde(default)]
    pub repeat_type: RepeatType,
    /// Interval of a `Relative` job, fixed at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval_seconds: Option<i64>,
}

impl ScheduledJob {
    pub fn new(
        action: JobAction,
        created_at: DateTime<Utc>,
        execute_at: DateTime<FixedOffset>,
        repeat_type: RepeatType,
    ) -> Self {
        let repeat_interval_seconds = (repeat_type == RepeatType::Relative)
            .then(|| (execute_at.with_timezone(&Utc) - created_at).num_seconds());

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at,
            execute_at,
            last_executed_at: None,
            action,
            repeat_type,
            repeat_interval_seconds,
        }
    }

    /// Build a job from parser output, mapping the repeat hint.
    pub fn from_parsed(parsed: &ParsedDateTime, action: JobAction, created_at: DateTime<Utc>) -> Self {
        Self::new(action, created_at, parsed.time, parsed.repeat.into())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execute_at <= now
    }

    /// Next execution strictly after `now`, or `None` if the job is finished.
    pub fn next_execution(&self, now: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
        match self.repeat_type {
            RepeatType::None => None,
            RepeatType::Relative => {
                let interval = self.repeat_interval_seconds.unwrap_or_else(|| {
                    (self.execute_at.with_timezone(&Utc) - self.created_at).num_seconds()
                });
                if interval <= 0 {
                    tracing::warn!(job_id = %self.id, interval, "Relative job has no positive interval");
                    return None;
                }
                let elapsed = (now - self.execute_at.with_timezone(&Utc)).num_seconds().max(0);
                let steps = elapsed / interval + 1;
                self.execute_at
                    .checked_add_signed(Duration::try_seconds(steps.checked_mul(interval)?)?)
            }
            RepeatType::Daily => advance_days(self.execute_at, 1, now),
            RepeatType::Weekly => advance_days(self.execute_at, 7, now),
            RepeatType::Yearly => advance_years(self.execute_at, now),
        }
    }
}

/// Add whole periods of `period_days` calendar days until past `now`.
fn advance_days(
    from: DateTime<FixedOffset>,
    period_days: u64,
    now: DateTime<Utc>,
) -> Option<DateTime<FixedOffset>> {
    let behind = (now - from.with_timezone(&Utc)).num_days().max(0) as u64;
    let mut periods = behind / period_days;
    loop {
        periods += 1;
        let next = from.checked_add_days(Days::new(periods * period_days))?;
        if next > now {
            return Some(next);
        }
    }
}

/// Same month, day and time in a later year; years without that date are skipped.
fn advance_years(from: DateTime<FixedOffset>, now: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
    // One year of slack for offsets that straddle New Year in UTC
    let first = (now.year() - from.year() - 1).max(1);
    (first..=first + 10)
        .filter_map(|k| from.with_year(from.year() + k))
        .find(|next| *next > now)
}

/// Executes the action of a due job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &ScheduledJob) -> Result<()>;
}

/// A job whose action failed during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: String,
    pub action: &'static str,
    pub error: String,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub executed: Vec<String>,
    pub failed: Vec<JobFailure>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.executed.is_empty() && self.failed.is_empty()
    }
}

/// Owns the pending job list.
pub struct Scheduler {
    jobs: Mutex<Vec<ScheduledJob>>,
    /// Serializes ticks.
    tick_lock: Mutex<()>,
    db: Option<Arc<Database>>,
}

impl Scheduler {
    /// In-memory scheduler.
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            tick_lock: Mutex::new(()),
            db: None,
        }
    }

    /// Scheduler that writes every change through to the database.
    pub fn with_database(db: Arc<Database>) -> Self {
        Self {
            db: Some(db),
            ..Self::new()
        }
    }

    /// Rebuild the scheduler from persisted jobs.
    pub async fn load(db: Arc<Database>) -> Result<Self> {
        let jobs = db.load_jobs().await?;
        tracing::info!(count = jobs.len(), "Loaded scheduled jobs");
        let scheduler = Self::with_database(db);
        *scheduler.jobs.lock().await = jobs;
        Ok(scheduler)
    }

    /// Add a job and return its id.
    pub async fn create_job(&self, job: ScheduledJob) -> Result<String> {
        if let Some(db) = &self.db {
            db.insert_job(&job).await?;
        }
        tracing::info!(
            job_id = %job.id,
            action = job.action.kind(),
            execute_at = %job.execute_at,
            repeat = ?job.repeat_type,
            "Job scheduled"
        );
        let id = job.id.clone();
        self.jobs.lock().await.push(job);
        Ok(id)
    }

    /// Cancel a job. Returns whether it existed.
    pub async fn remove_job(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(index) = jobs.iter().position(|j| j.id == id) else {
            return Ok(false);
        };
        if let Some(db) = &self.db {
            db.delete_job(id).await?;
        }
        jobs.remove(index);
        tracing::info!(job_id = %id, "Job removed");
        Ok(true)
    }

    /// All pending jobs in creation order.
    pub async fn list_jobs(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn get_job(&self, id: &str) -> Option<ScheduledJob> {
        self.jobs.lock().await.iter().find(|j| j.id == id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Execute every job due at `now` once, then reschedule or drop it.
    ///
    /// Actions run with the job list unlocked so handlers may create or
    /// remove jobs. A job removed while its action runs stays removed.
    pub async fn tick(&self, now: DateTime<Utc>, handler: &dyn JobHandler) -> TickReport {
        let _tick = self.tick_lock.lock().await;

        let due: Vec<ScheduledJob> = self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.is_due(now))
            .cloned()
            .collect();

        let mut report = TickReport::default();
        if due.is_empty() {
            return report;
        }

        for job in &due {
            match handler.run(job).await {
                Ok(()) => {
                    tracing::info!(job_id = %job.id, action = job.action.kind(), "Job executed");
                    report.executed.push(job.id.clone());
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job.id,
                        action = job.action.kind(),
                        error = %e,
                        "Job failed"
                    );
                    report.failed.push(JobFailure {
                        job_id: job.id.clone(),
                        action: job.action.kind(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut jobs = self.jobs.lock().await;
        for job in due {
            let Some(index) = jobs.iter().position(|j| j.id == job.id) else {
                continue;
            };
            // Failed jobs advance too; a broken action must not block later ticks
            match job.next_execution(now) {
                Some(next) => {
                    let entry = &mut jobs[index];
                    entry.execute_at = next;
                    entry.last_executed_at = Some(now);
                    if let Some(db) = &self.db {
                        if let Err(e) = db.update_job_times(entry).await {
                            tracing::error!(job_id = %entry.id, error = %e, "Failed to persist reschedule");
                        }
                    }
                }
                None => {
                    jobs.remove(index);
                    if let Some(db) = &self.db {
                        if let Err(e) = db.delete_job(&job.id).await {
                            tracing::error!(job_id = %job.id, error = %e, "Failed to delete finished job");
                        }
                    }
                }
            }
        }

        report
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod property_tests {
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    use crate::scheduler::{JobAction, RepeatType, ScheduledJob};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Relative rescheduling lands after `now` on the original interval grid.
        #[test]
        fn prop_relative_next_on_grid(
            interval in 1i64..100_000,
            late_by in 0i64..10_000_000,
        ) {
            let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let first = created + Duration::seconds(interval);
            let job = ScheduledJob::new(
                JobAction::BoredCommands { channel_id: 1 },
                created,
                first.fixed_offset(),
                RepeatType::Relative,
            );
            let now = first + Duration::seconds(late_by);
            let next = job.next_execution(now).unwrap();

            prop_assert!(next > now);
            prop_assert!(next <= now + Duration::seconds(interval));
            prop_assert_eq!((next - first.fixed_offset()).num_seconds() % interval, 0);
        }

        /// Daily rescheduling keeps the time of day and lands within a day.
        #[test]
        fn prop_daily_keeps_time_of_day(
            hour in 0u32..24,
            minute in 0u32..60,
            late_by in 0i64..100_000_000,
        ) {
            let first = Utc.with_ymd_and_hms(2020, 1, 1, hour, minute, 0).unwrap();
            let job = ScheduledJob::new(
                JobAction::BannerRotation { guild_id: 1 },
                first,
                first.fixed_offset(),
                RepeatType::Daily,
            );
            let now = first + Duration::seconds(late_by);
            let next = job.next_execution(now).unwrap();

            prop_assert!(next > now);
            prop_assert!(next <= now + Duration::days(1));
            prop_assert_eq!(next.time(), first.fixed_offset().time());
        }
    }
}

//! Executes scheduled job actions.

use std::sync::Arc;
use std::time::Duration;

use serenity::async_trait;

use crate::actions::{bounded, ActionExecutor};
use crate::error::Result;
use crate::raid::RaidDetector;
use crate::scheduler::{JobAction, JobHandler, ScheduledJob};

const DEFAULT_REASON: &str = "Scheduled action";

/// Runs each due job against the chat platform.
pub struct JobDispatcher {
    executor: Arc<dyn ActionExecutor>,
    raid: Arc<RaidDetector>,
    action_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        raid: Arc<RaidDetector>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            raid,
            action_timeout,
        }
    }
}

#[async_trait]
impl JobHandler for JobDispatcher {
    async fn run(&self, job: &ScheduledJob) -> Result<()> {
        let timeout = self.action_timeout;
        let executor = &self.executor;

        match &job.action {
            JobAction::AddRole {
                guild_id,
                user_id,
                role_id,
                reason,
            } => {
                let reason = reason.as_deref().unwrap_or(DEFAULT_REASON);
                bounded(
                    "add_role",
                    timeout,
                    executor.add_role(*guild_id, *user_id, *role_id, reason),
                )
                .await
            }
            JobAction::RemoveRole {
                guild_id,
                user_id,
                role_id,
                reason,
            } => {
                let reason = reason.as_deref().unwrap_or(DEFAULT_REASON);
                bounded(
                    "remove_role",
                    timeout,
                    executor.remove_role(*guild_id, *user_id, *role_id, reason),
                )
                .await
            }
            JobAction::Unban {
                guild_id,
                user_id,
                reason,
            } => {
                let reason = reason.as_deref().unwrap_or("Temporary ban expired");
                bounded("unban", timeout, executor.unban(*guild_id, *user_id, reason)).await
            }
            JobAction::Echo { target_id, content } => {
                bounded("send_message", timeout, executor.send_message(*target_id, content)).await
            }
            JobAction::BannerRotation { guild_id } => {
                bounded("rotate_banner", timeout, executor.rotate_banner(*guild_id)).await
            }
            JobAction::BoredCommands { channel_id } => {
                bounded(
                    "post_bored_command",
                    timeout,
                    executor.post_bored_command(*channel_id),
                )
                .await
            }
            JobAction::RaidDecay { guild_id } => {
                self.raid.check_decay(*guild_id).await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{Duration, TimeZone, Utc};

    use crate::actions::testing::{Recorded, RecordingExecutor};
    use crate::clock::{Clock, ManualClock};
    use crate::config::SettingsStore;
    use crate::dispatch::JobDispatcher;
    use crate::raid::{RaidDetector, RaidLevel};
    use crate::scheduler::{JobAction, RepeatType, ScheduledJob, Scheduler};

    struct Setup {
        scheduler: Arc<Scheduler>,
        executor: Arc<RecordingExecutor>,
        raid: Arc<RaidDetector>,
        dispatcher: JobDispatcher,
        clock: ManualClock,
    }

    fn setup() -> Setup {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let scheduler = Arc::new(Scheduler::new());
        let executor = Arc::new(RecordingExecutor::new());
        let raid = Arc::new(RaidDetector::new(
            SettingsStore::default(),
            Arc::new(clock.clone()),
            scheduler.clone(),
            executor.clone(),
            StdDuration::from_secs(1),
        ));
        let dispatcher = JobDispatcher::new(executor.clone(), raid.clone(), StdDuration::from_secs(1));
        Setup {
            scheduler,
            executor,
            raid,
            dispatcher,
            clock,
        }
    }

    impl Setup {
        async fn schedule(&self, action: JobAction, repeat: RepeatType) -> String {
            let now = self.clock.now();
            self.scheduler
                .create_job(ScheduledJob::new(
                    action,
                    now,
                    (now + Duration::minutes(1)).fixed_offset(),
                    repeat,
                ))
                .await
                .expect("create")
        }

        async fn tick_after(&self, wait: Duration) -> crate::scheduler::TickReport {
            self.clock.advance(wait);
            self.scheduler.tick(self.clock.now(), &self.dispatcher).await
        }
    }

    #[tokio::test]
    async fn each_action_reaches_the_executor() {
        let s = setup();
        s.schedule(
            JobAction::AddRole {
                guild_id: 1,
                user_id: 2,
                role_id: 3,
                reason: None,
            },
            RepeatType::None,
        )
        .await;
        s.schedule(
            JobAction::RemoveRole {
                guild_id: 1,
                user_id: 2,
                role_id: 4,
                reason: Some("probation".to_string()),
            },
            RepeatType::None,
        )
        .await;
        s.schedule(
            JobAction::Unban {
                guild_id: 1,
                user_id: 5,
                reason: None,
            },
            RepeatType::None,
        )
        .await;
        s.schedule(
            JobAction::Echo {
                target_id: 6,
                content: "stand-up in 5".to_string(),
            },
            RepeatType::None,
        )
        .await;
        s.schedule(JobAction::BannerRotation { guild_id: 1 }, RepeatType::Daily)
            .await;
        s.schedule(JobAction::BoredCommands { channel_id: 7 }, RepeatType::Weekly)
            .await;

        let report = s.tick_after(Duration::minutes(1)).await;
        assert_eq!(report.executed.len(), 6);
        assert!(report.failed.is_empty());

        assert_eq!(
            s.executor.calls(),
            vec![
                Recorded::AddRole {
                    user_id: 2,
                    role_id: 3
                },
                Recorded::RemoveRole {
                    user_id: 2,
                    role_id: 4
                },
                Recorded::Unban { user_id: 5 },
                Recorded::Send {
                    target_id: 6,
                    text: "stand-up in 5".to_string()
                },
                Recorded::RotateBanner { guild_id: 1 },
                Recorded::BoredCommand { channel_id: 7 },
            ]
        );
        // Only the repeating jobs survive
        assert_eq!(s.scheduler.pending_count().await, 2);
    }

    #[tokio::test]
    async fn executor_failure_is_reported_by_tick() {
        let s = setup();
        s.executor.fail_on("unban");
        let id = s
            .schedule(
                JobAction::Unban {
                    guild_id: 1,
                    user_id: 5,
                    reason: None,
                },
                RepeatType::None,
            )
            .await;

        let report = s.tick_after(Duration::minutes(2)).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].job_id, id);
        assert_eq!(report.failed[0].action, "unban");
        assert_eq!(s.scheduler.pending_count().await, 0);
    }

    #[tokio::test]
    async fn raid_recheck_runs_through_the_scheduler() {
        let s = setup();
        for user in 0..3 {
            s.raid.record_join(1, user, s.clock.now()).await.unwrap();
        }
        assert_eq!(s.raid.level(1).await, RaidLevel::Small);

        let report = s.tick_after(Duration::minutes(6)).await;
        assert_eq!(report.executed.len(), 1);
        assert_eq!(s.raid.level(1).await, RaidLevel::None);
        assert_eq!(s.scheduler.pending_count().await, 0);
    }
}

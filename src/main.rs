//! Bulwark Discord bot entry point.
//!
//! Wires gateway events into the pressure engine and raid detector, and
//! drives the scheduler from a fixed-interval tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::model::guild::Member;
use serenity::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bulwark::actions::{bounded, ActionExecutor, ModerationNotice};
use bulwark::clock::{Clock, SharedClock, SystemClock};
use bulwark::config::{BulwarkConfig, SettingsStore};
use bulwark::database::Database;
use bulwark::discord::DiscordExecutor;
use bulwark::dispatch::JobDispatcher;
use bulwark::error::{BulwarkError, ErrorContext, Result};
use bulwark::health::{spawn_health_server, HealthState};
use bulwark::models::ObservedMessage;
use bulwark::pressure::PressureEngine;
use bulwark::raid::RaidDetector;
use bulwark::scheduler::{Scheduler, TickReport};

/// How often idle pressure state is dropped.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Main event handler for the bot.
struct BulwarkHandler {
    pressure: Arc<PressureEngine>,
    raid: Arc<RaidDetector>,
    clock: SharedClock,
}

fn observed_message(msg: &Message) -> ObservedMessage {
    let mention_count = msg.mentions.len()
        + msg.mention_roles.len()
        + usize::from(msg.mention_everyone);

    ObservedMessage {
        message_id: msg.id.get(),
        channel_id: msg.channel_id.get(),
        author_id: msg.author.id.get(),
        guild_id: msg.guild_id.map(|g| g.get()),
        author_role_ids: msg
            .member
            .as_ref()
            .map(|m| m.roles.iter().map(|r| r.get()).collect())
            .unwrap_or_default(),
        content: msg.content.clone(),
        mention_count: mention_count as u32,
        attachment_count: (msg.attachments.len() + msg.embeds.len()) as u32,
    }
}

#[serenity::async_trait]
impl EventHandler for BulwarkHandler {
    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let outcome = self.pressure.handle_message(&observed_message(&msg)).await;
        tracing::debug!(
            user_id = outcome.user_id,
            pressure = outcome.observation.total,
            "Message scored"
        );
    }

    async fn guild_member_addition(&self, _ctx: Context, new_member: Member) {
        let guild_id = new_member.guild_id.get();
        let user_id = new_member.user.id.get();
        let joined_at = new_member
            .joined_at
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.unix_timestamp(), 0))
            .unwrap_or_else(|| self.clock.now());

        match self.raid.record_join(guild_id, user_id, joined_at).await {
            Ok(outcome) => {
                if let Some(level) = outcome.escalated_to {
                    tracing::warn!(guild_id = guild_id, level = ?level, "Raid level raised");
                }
            }
            Err(e) => e.log_with_context(
                &ErrorContext::new("record_join")
                    .with_guild_id(guild_id)
                    .with_user_id(user_id),
            ),
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, "Bulwark bot connected");
    }
}

/// Post failed jobs to the moderator channel.
async fn report_failures(executor: &dyn ActionExecutor, report: &TickReport, timeout: Duration) {
    for failure in &report.failed {
        let notice = ModerationNotice::new("Scheduled job failed", failure.error.clone())
            .with_field("Job", failure.job_id.clone())
            .with_field("Action", failure.action);
        if let Err(e) = bounded(
            "post_moderation_notice",
            timeout,
            executor.post_moderation_notice(&notice),
        )
        .await
        {
            e.log_with_context(&ErrorContext::new("report_job_failure"));
        }
    }
}

/// Spawn the scheduler tick and idle sweep loops.
fn spawn_background_tasks(
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<JobDispatcher>,
    executor: Arc<dyn ActionExecutor>,
    pressure: Arc<PressureEngine>,
    clock: SharedClock,
    config: &BulwarkConfig,
) {
    let tick_interval = config.tick_interval;
    let action_timeout = config.action_timeout;
    let tick_clock = clock.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = scheduler.tick(tick_clock.now(), dispatcher.as_ref()).await;
            if !report.failed.is_empty() {
                report_failures(executor.as_ref(), &report, action_timeout).await;
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let dropped = pressure.forget_idle();
            if dropped > 0 {
                tracing::debug!(count = dropped, "Dropped idle pressure state");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // RUST_LOG overrides the default info level
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Bulwark bot starting...");

    let config = BulwarkConfig::from_env()?;
    tracing::info!(
        tick_ms = config.tick_interval.as_millis() as u64,
        action_timeout_ms = config.action_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let db = Arc::new(Database::new(&config.database_path).await?);
    tracing::info!(path = %config.database_path, "Database initialized");

    let scheduler = Arc::new(Scheduler::load(db.clone()).await?);
    let clock: SharedClock = Arc::new(SystemClock);

    spawn_health_server(
        config.health_port,
        HealthState {
            db: db.clone(),
            scheduler: scheduler.clone(),
            started_at: clock.now(),
            clock: clock.clone(),
        },
    );

    let settings = SettingsStore::new(config.settings.clone());

    let http = Arc::new(serenity::http::Http::new(&config.discord_token));
    let executor: Arc<dyn ActionExecutor> = Arc::new(DiscordExecutor::new(
        http,
        config.mod_channel_id,
        settings.clone(),
        clock.clone(),
    ));

    let pressure = Arc::new(PressureEngine::new(
        settings.clone(),
        clock.clone(),
        executor.clone(),
        config.action_timeout,
    ));
    let raid = Arc::new(RaidDetector::new(
        settings,
        clock.clone(),
        scheduler.clone(),
        executor.clone(),
        config.action_timeout,
    ));
    let dispatcher = Arc::new(JobDispatcher::new(
        executor.clone(),
        raid.clone(),
        config.action_timeout,
    ));

    spawn_background_tasks(
        scheduler,
        dispatcher,
        executor,
        pressure.clone(),
        clock.clone(),
        &config,
    );
    tracing::info!("Background tasks spawned");

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS;

    let handler = BulwarkHandler {
        pressure,
        raid,
        clock,
    };

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .await
        .map_err(|e| BulwarkError::Discord(Box::new(e)))?;

    tracing::info!("Starting Discord client...");

    client
        .start()
        .await
        .map_err(|e| BulwarkError::Discord(Box::new(e)))?;

    Ok(())
}

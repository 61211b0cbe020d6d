//! Health check HTTP endpoint for deployment platform monitoring.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::database::Database;
use crate::error::{BulwarkError, Result};
use crate::scheduler::Scheduler;

/// Shared state for the health endpoint.
#[derive(Clone)]
pub struct HealthState {
    pub db: Arc<Database>,
    pub scheduler: Arc<Scheduler>,
    pub started_at: DateTime<Utc>,
    pub clock: SharedClock,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub database: &'static str,
    pub pending_jobs: usize,
    pub uptime_seconds: i64,
    pub build_timestamp: &'static str,
    pub git_commit: &'static str,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/", get(health_handler))
        .with_state(state)
}

/// Start the health check HTTP server.
pub async fn start_health_server(port: u16, state: HealthState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(port = port, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BulwarkError::Config(format!("Failed to bind health port {}: {}", port, e)))?;

    axum::serve(listener, router(state))
        .await
        .map_err(|e| BulwarkError::InternalState(format!("Health server failed: {}", e)))
}

/// Reports 503 when the database does not answer.
async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let db_ok = match state.db.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check: database unavailable");
            false
        }
    };

    let report = HealthReport {
        status: if db_ok { "ok" } else { "degraded" },
        database: if db_ok { "ok" } else { "unavailable" },
        pending_jobs: state.scheduler.pending_count().await,
        uptime_seconds: (state.clock.now() - state.started_at).num_seconds(),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        git_commit: env!("GIT_COMMIT"),
    };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// Spawn the health check server as a background task.
pub fn spawn_health_server(port: u16, state: HealthState) {
    tokio::spawn(async move {
        if let Err(e) = start_health_server(port, state).await {
            tracing::error!(error = %e, "Health check server stopped");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use chrono::{Duration, FixedOffset, TimeZone, Utc};

    use crate::clock::{ManualClock, SharedClock};
    use crate::database::Database;
    use crate::health::{health_handler, HealthState};
    use crate::scheduler::{JobAction, RepeatType, ScheduledJob, Scheduler};

    #[tokio::test]
    async fn reports_ok_with_pending_jobs() {
        let db = Arc::new(Database::in_memory().await.expect("db"));
        let scheduler = Arc::new(Scheduler::with_database(db.clone()));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock: SharedClock = Arc::new(ManualClock::new(now));
        scheduler
            .create_job(ScheduledJob::new(
                JobAction::BannerRotation { guild_id: 1 },
                now,
                (now + Duration::hours(1)).with_timezone(&FixedOffset::east_opt(0).unwrap()),
                RepeatType::Daily,
            ))
            .await
            .expect("create");

        let state = HealthState {
            db,
            scheduler,
            started_at: now - Duration::seconds(30),
            clock,
        };
        let (code, report) = health_handler(State(state)).await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(report.status, "ok");
        assert_eq!(report.pending_jobs, 1);
        assert_eq!(report.uptime_seconds, 30);
        assert!(!report.git_commit.is_empty());
    }

    #[tokio::test]
    async fn closed_database_is_degraded() {
        let db = Arc::new(Database::in_memory().await.expect("db"));
        db.pool().close().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let state = HealthState {
            scheduler: Arc::new(Scheduler::new()),
            db,
            started_at: now,
            clock: Arc::new(ManualClock::new(now)),
        };

        let (code, report) = health_handler(State(state)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.status, "degraded");
        assert_eq!(report.uptime_seconds, 0);
    }

    #[tokio::test]
    async fn uptime_follows_injected_clock() {
        let db = Arc::new(Database::in_memory().await.expect("db"));
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let state = HealthState {
            scheduler: Arc::new(Scheduler::new()),
            db,
            started_at: start,
            clock: Arc::new(clock.clone()),
        };

        clock.advance(Duration::hours(2));
        let (_, report) = health_handler(State(state)).await;
        assert_eq!(report.uptime_seconds, 7200);
    }
}

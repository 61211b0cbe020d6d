//! SQLite database for persistent storage.
//!
//! Holds the scheduler's job list so pending bans, role changes and
//! reminders survive restarts.

use std::path::Path;

use chrono::{DateTime, FixedOffset, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::{BulwarkError, Result};
use crate::scheduler::{JobAction, RepeatType, ScheduledJob};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection.
    ///
    /// Creates the database file and initializes schema if needed.
    pub async fn new(path: &str) -> Result<Self> {
        let db_path = Path::new(path);

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BulwarkError::Database(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| BulwarkError::Database(format!("Failed to connect to database: {}", e)))?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Create an in-memory database for testing.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| BulwarkError::Database(format!("Failed to create in-memory db: {}", e)))?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| BulwarkError::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if the database is healthy.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BulwarkError::Database(format!("Health check failed: {}", e)))?;

        Ok(())
    }

    // ========== Scheduled jobs ==========

    /// Append a job at the end of the list.
    pub async fn insert_job(&self, job: &ScheduledJob) -> Result<()> {
        let action = serde_json::to_string(&job.action)?;

        sqlx::query(
            "INSERT INTO scheduled_jobs
                (id, created_at, execute_at, last_executed_at, action, repeat_type, repeat_interval_seconds)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(job.created_at.to_rfc3339())
        .bind(job.execute_at.to_rfc3339())
        .bind(job.last_executed_at.map(|t| t.to_rfc3339()))
        .bind(action)
        .bind(job.repeat_type.as_str())
        .bind(job.repeat_interval_seconds)
        .execute(&self.pool)
        .await
        .map_err(|e| BulwarkError::Database(format!("Failed to insert job: {}", e)))?;

        Ok(())
    }

    /// Persist a rescheduled job's times.
    pub async fn update_job_times(&self, job: &ScheduledJob) -> Result<()> {
        sqlx::query(
            "UPDATE scheduled_jobs SET execute_at = ?, last_executed_at = ? WHERE id = ?",
        )
        .bind(job.execute_at.to_rfc3339())
        .bind(job.last_executed_at.map(|t| t.to_rfc3339()))
        .bind(&job.id)
        .execute(&self.pool)
        .await
        .map_err(|e| BulwarkError::Database(format!("Failed to update job: {}", e)))?;

        Ok(())
    }

    pub async fn delete_job(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| BulwarkError::Database(format!("Failed to delete job: {}", e)))?;

        Ok(())
    }

    /// All jobs in insertion order.
    pub async fn load_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query(
            "SELECT id, created_at, execute_at, last_executed_at, action, repeat_type, repeat_interval_seconds
             FROM scheduled_jobs ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BulwarkError::Database(format!("Failed to load jobs: {}", e)))?;

        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(row: &SqliteRow) -> Result<ScheduledJob> {
    let id: String = row.get("id");
    let action: String = row.get("action");
    let action: JobAction = serde_json::from_str(&action)?;

    let repeat_name: String = row.get("repeat_type");
    let repeat_type = RepeatType::from_name(&repeat_name).ok_or_else(|| {
        BulwarkError::Database(format!("Job {} has unknown repeat type {}", id, repeat_name))
    })?;

    let last_executed_at: Option<String> = row.get("last_executed_at");

    Ok(ScheduledJob {
        created_at: parse_timestamp(row.get("created_at"))?.with_timezone(&Utc),
        execute_at: parse_timestamp(row.get("execute_at"))?,
        last_executed_at: last_executed_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?
            .map(|t| t.with_timezone(&Utc)),
        action,
        repeat_type,
        repeat_interval_seconds: row.get("repeat_interval_seconds"),
        id,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|e| BulwarkError::Database(format!("Invalid timestamp {}: {}", value, e)))
}

/// Database schema SQL.
const SCHEMA: &str = r#"
-- Pending scheduled jobs, in creation order
CREATE TABLE IF NOT EXISTS scheduled_jobs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    execute_at TEXT NOT NULL,
    last_executed_at TEXT,
    action TEXT NOT NULL,
    repeat_type TEXT NOT NULL DEFAULT 'None',
    repeat_interval_seconds INTEGER
);

CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_execute_at ON scheduled_jobs(execute_at);
"#;

#[cfg(test)]
mod tests {
    use chrono::{Duration, FixedOffset, TimeZone, Utc};

    use crate::database::Database;
    use crate::scheduler::{JobAction, RepeatType, ScheduledJob};

    fn sample_job() -> ScheduledJob {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let execute = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 2, 9, 0, 0)
            .unwrap();
        ScheduledJob::new(
            JobAction::AddRole {
                guild_id: 1,
                user_id: 2,
                role_id: 3,
                reason: Some("probation over".to_string()),
            },
            created,
            execute,
            RepeatType::None,
        )
    }

    #[tokio::test]
    async fn create_in_memory_database() {
        let db = Database::in_memory().await.expect("in-memory db");
        assert!(db.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let db = Database::in_memory().await.expect("in-memory db");
        db.initialize_schema().await.expect("second init");
        db.initialize_schema().await.expect("third init");
    }

    #[tokio::test]
    async fn job_round_trip_keeps_null_last_executed() {
        let db = Database::in_memory().await.expect("in-memory db");
        let job = sample_job();
        db.insert_job(&job).await.expect("insert");

        let loaded = db.load_jobs().await.expect("load");
        assert_eq!(loaded, vec![job]);
        assert_eq!(loaded[0].last_executed_at, None);
    }

    #[tokio::test]
    async fn update_times_persists_reschedule() {
        let db = Database::in_memory().await.expect("in-memory db");
        let mut job = sample_job();
        job.repeat_type = RepeatType::Daily;
        db.insert_job(&job).await.expect("insert");

        job.last_executed_at = Some(job.execute_at.with_timezone(&Utc));
        job.execute_at += Duration::days(1);
        db.update_job_times(&job).await.expect("update");

        let loaded = db.load_jobs().await.expect("load");
        assert_eq!(loaded[0].execute_at, job.execute_at);
        assert_eq!(loaded[0].execute_at.offset().local_minus_utc(), 7200);
        assert_eq!(loaded[0].last_executed_at, job.last_executed_at);
    }

    #[tokio::test]
    async fn load_preserves_insertion_order() {
        let db = Database::in_memory().await.expect("in-memory db");
        let first = sample_job();
        let second = sample_job();
        let third = sample_job();
        for job in [&first, &second, &third] {
            db.insert_job(job).await.expect("insert");
        }
        db.delete_job(&second.id).await.expect("delete");

        let ids: Vec<String> = db
            .load_jobs()
            .await
            .expect("load")
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![first.id, third.id]);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("jobs.db");
        let path = path.to_str().expect("utf8 path");

        let job = sample_job();
        {
            let db = Database::new(path).await.expect("open");
            db.insert_job(&job).await.expect("insert");
            db.pool().close().await;
        }

        let reopened = Database::new(path).await.expect("reopen");
        assert_eq!(reopened.load_jobs().await.expect("load"), vec![job]);
    }
}

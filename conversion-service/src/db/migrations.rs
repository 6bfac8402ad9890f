//! Database schema migrations.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Run all database migrations.
///
/// Called during database initialization to ensure the schema is up to date.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Job records (result store)
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            current_step INTEGER,
            total_steps INTEGER,
            message TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            attempt INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            result TEXT,
            error TEXT,
            -- unix millis; NULL while the job is not terminal
            expires_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_expires_at ON jobs(expires_at);

        -- Task queue messages, one per job
        CREATE TABLE IF NOT EXISTS job_queue (
            job_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            available_at INTEGER NOT NULL,
            lease_until INTEGER,
            lease_token TEXT,
            deliveries INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_job_queue_available ON job_queue(available_at, enqueued_at);
    "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: e.to_string(),
    })?;

    Ok(())
}

//! Job record operations (the result store).
//!
//! Reads filter out records whose TTL has elapsed, so eviction is exact even
//! before the sweeper physically deletes them. Mutations go through
//! [`Database::update_job`], which reads, transforms and writes one record
//! inside a single immediate transaction.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};

use super::Database;
use super::models::{JOB_COLUMNS, job_from_row};
use crate::error::{DatabaseError, ServiceError, ServiceResult};
use crate::jobs::{JobRecord, JobStatus, TransitionError};

fn job_params(job: &JobRecord) -> ServiceResult<(Option<String>, Option<String>)> {
    let result_json = job
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(DatabaseError::Serialization)?;
    let error_json = job
        .error
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(DatabaseError::Serialization)?;
    Ok((result_json, error_json))
}

fn map_read_error(job_id: &str, error: rusqlite::Error) -> ServiceError {
    match error {
        rusqlite::Error::FromSqlConversionFailure(_, _, source) => {
            ServiceError::Database(DatabaseError::CorruptRecord {
                job_id: job_id.to_string(),
                message: source.to_string(),
            })
        }
        other => ServiceError::Database(DatabaseError::Query(other)),
    }
}

impl Database {
    /// Insert a new job record. Ids are never reused, so a duplicate is an error.
    pub fn insert_job(&self, job: &JobRecord) -> ServiceResult<()> {
        let (result_json, error_json) = job_params(job)?;
        let conn = self.conn.lock().unwrap();

        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                job.id,
                job.filename,
                job.status.as_str(),
                i64::from(job.progress),
                job.current_step.map(i64::from),
                job.total_steps.map(i64::from),
                job.message,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                i64::from(job.attempt),
                i64::from(job.max_retries),
                result_json,
                error_json,
                job.expires_at.map(|t| t.timestamp_millis()),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a live job record; expired records read as missing
    pub fn get_job(&self, id: &str, now: DateTime<Utc>) -> ServiceResult<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE id = ?1 AND (expires_at IS NULL OR expires_at > ?2)"
            ),
            params![id, now.timestamp_millis()],
            job_from_row,
        )
        .optional()
        .map_err(|e| map_read_error(id, e))
    }

    /// Atomically read, transform and write back one live job record.
    ///
    /// Returns `Ok(None)` when the record is missing or expired. If the
    /// closure rejects the transition nothing is written.
    pub fn update_job<T, F>(
        &self,
        id: &str,
        now: DateTime<Utc>,
        apply: F,
    ) -> ServiceResult<Option<T>>
    where
        F: FnOnce(&mut JobRecord) -> Result<T, TransitionError>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::Query)?;

        let current = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE id = ?1 AND (expires_at IS NULL OR expires_at > ?2)"
                ),
                params![id, now.timestamp_millis()],
                job_from_row,
            )
            .optional()
            .map_err(|e| map_read_error(id, e))?;

        let Some(mut job) = current else {
            return Ok(None);
        };

        let outcome = apply(&mut job)?;
        let (result_json, error_json) = job_params(&job)?;

        tx.execute(
            "UPDATE jobs SET status = ?1, progress = ?2, current_step = ?3, total_steps = ?4, \
             message = ?5, started_at = ?6, completed_at = ?7, attempt = ?8, result = ?9, \
             error = ?10, expires_at = ?11 WHERE id = ?12",
            params![
                job.status.as_str(),
                i64::from(job.progress),
                job.current_step.map(i64::from),
                job.total_steps.map(i64::from),
                job.message,
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                i64::from(job.attempt),
                result_json,
                error_json,
                job.expires_at.map(|t| t.timestamp_millis()),
                job.id,
            ],
        )
        .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(Some(outcome))
    }

    /// Delete a job record. Returns whether a row was removed.
    pub fn delete_job(&self, id: &str) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Delete terminal records whose TTL has elapsed
    pub fn purge_expired_jobs(&self, now: DateTime<Utc>) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "DELETE FROM jobs WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now.timestamp_millis()],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows)
    }

    /// Count live records in a given status
    pub fn count_jobs_with_status(
        &self,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM jobs \
                 WHERE status = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![status.as_str(), now.timestamp_millis()],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        Ok(count as usize)
    }
}

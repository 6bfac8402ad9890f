//! Row mapping for job records and queue messages.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Row;

use crate::jobs::{JobError, JobRecord, JobStatus};

/// Column list matching [`job_from_row`]
pub(crate) const JOB_COLUMNS: &str = "id, filename, status, progress, current_step, total_steps, \
     message, created_at, started_at, completed_at, attempt, max_retries, result, error, expires_at";

/// A leased queue message handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub job_id: String,
    /// Serialized job payload
    pub payload: String,
    /// Identifies this delivery; ack and release must present it
    pub lease_token: String,
    /// How many times the message has been handed out, this one included
    pub deliveries: u32,
}

fn conversion_error(
    index: usize,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(error))
}

fn parse_timestamp(index: usize, value: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, e))
}

fn parse_optional_timestamp(
    index: usize,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    value.map(|v| parse_timestamp(index, v)).transpose()
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job status '{0}'")]
struct UnknownStatus(String);

pub(crate) fn job_from_row(row: &Row<'_>) -> Result<JobRecord, rusqlite::Error> {
    let status_str: String = row.get(2)?;
    let status = JobStatus::parse(&status_str).ok_or_else(|| conversion_error(2, UnknownStatus(status_str)))?;
    let progress: i64 = row.get(3)?;
    let current_step: Option<i64> = row.get(4)?;
    let total_steps: Option<i64> = row.get(5)?;
    let attempt: i64 = row.get(10)?;
    let max_retries: i64 = row.get(11)?;
    let result_str: Option<String> = row.get(12)?;
    let error_str: Option<String> = row.get(13)?;
    let expires_at: Option<i64> = row.get(14)?;

    let result = result_str
        .map(|s| serde_json::from_str::<serde_json::Value>(&s))
        .transpose()
        .map_err(|e| conversion_error(12, e))?;
    let error = error_str
        .map(|s| serde_json::from_str::<JobError>(&s))
        .transpose()
        .map_err(|e| conversion_error(13, e))?;

    Ok(JobRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        status,
        progress: progress.clamp(0, 100) as u8,
        current_step: current_step.map(|s| s as u32),
        total_steps: total_steps.map(|t| t as u32),
        message: row.get(6)?,
        created_at: parse_timestamp(7, row.get(7)?)?,
        started_at: parse_optional_timestamp(8, row.get(8)?)?,
        completed_at: parse_optional_timestamp(9, row.get(9)?)?,
        attempt: attempt as u32,
        max_retries: max_retries as u32,
        result,
        error,
        expires_at: expires_at.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    })
}

pub(crate) fn queue_message_from_row(row: &Row<'_>) -> Result<QueueMessage, rusqlite::Error> {
    let deliveries: i64 = row.get(3)?;
    Ok(QueueMessage {
        job_id: row.get(0)?,
        payload: row.get(1)?,
        lease_token: row.get(2)?,
        deliveries: deliveries as u32,
    })
}

//! Job record and its state machine.
//!
//! Every mutation goes through a transition method that checks the current
//! status first, so an illegal move is reported instead of silently applied.
//! Terminal records (completed, failed, cancelled) reject every transition.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, not yet picked up by a worker
    Pending,
    /// Owned by a worker (including the backoff wait before a retry)
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a stored status. Unknown values are `None` so callers can
    /// surface them as corrupt records rather than guessing.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a terminal job error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Non-retryable failure of the delegated call
    ExecutionFailed,
    /// Retryable failure that kept happening until the retry bound
    RetriesExhausted,
    TimeLimitExceeded,
    Cancelled,
    /// Orchestration fault (undecodable payload, lost engine, ...)
    Internal,
}

/// Error stored on a failed or cancelled job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(JobErrorKind::Cancelled, "Job cancelled")
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A progress report pushed by a worker during one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub message: String,
}

impl ProgressUpdate {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent,
            current_step: None,
            total_steps: None,
            message: message.into(),
        }
    }

    /// Progress derived from a step counter, e.g. pages converted so far
    pub fn steps(current: u32, total: u32, message: impl Into<String>) -> Self {
        let percent = if total > 0 {
            ((u64::from(current.min(total)) * 100) / u64::from(total)) as u8
        } else {
            0
        };
        Self {
            percent,
            current_step: Some(current),
            total_steps: Some(total),
            message: message.into(),
        }
    }
}

/// Rejected state-machine move
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Job {job_id} cannot move from {from} to {to}")]
    Illegal {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} has used all {max_retries} retries")]
    RetriesExhausted { job_id: String, max_retries: u32 },
}

/// The persisted unit of work and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub filename: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub max_retries: u32,
    /// Opaque engine output, only on completed jobs
    pub result: Option<serde_json::Value>,
    /// Only on failed and cancelled jobs
    pub error: Option<JobError>,
    /// Eviction instant, set on the terminal transition
    pub expires_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a pending record for a fresh submission
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            status: JobStatus::Pending,
            progress: 0,
            current_step: None,
            total_steps: None,
            message: Some("Job queued".to_string()),
            created_at: now,
            started_at: None,
            completed_at: None,
            attempt: 0,
            max_retries,
            result: None,
            error: None,
            expires_at: None,
        }
    }

    /// Has this job reached completed, failed or cancelled?
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another automatic retry is allowed
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_retries
    }

    /// Copy suitable for status polling: the result payload is never exposed there
    pub fn snapshot(&self) -> JobRecord {
        JobRecord {
            result: None,
            ..self.clone()
        }
    }

    fn illegal(&self, to: JobStatus) -> TransitionError {
        TransitionError::Illegal {
            job_id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    /// A worker picked the job up (first delivery, redelivery, or the
    /// next attempt after a retry backoff).
    pub fn start_attempt(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => {
                self.status = JobStatus::Processing;
                self.progress = 0;
                self.current_step = None;
                self.total_steps = None;
                self.message = Some("Starting conversion...".to_string());
                self.started_at = Some(now);
                Ok(())
            }
            _ => Err(self.illegal(JobStatus::Processing)),
        }
    }

    /// Apply a progress report. Percent never decreases within an attempt;
    /// a lower value keeps the current percent but still updates the
    /// message and step counters.
    pub fn record_progress(&mut self, update: &ProgressUpdate) -> Result<(), TransitionError> {
        if self.status != JobStatus::Processing {
            return Err(self.illegal(JobStatus::Processing));
        }
        self.progress = self.progress.max(update.percent.min(100));
        if update.current_step.is_some() {
            self.current_step = update.current_step;
        }
        if update.total_steps.is_some() {
            self.total_steps = update.total_steps;
        }
        self.message = Some(update.message.clone());
        Ok(())
    }

    /// The delegated call succeeded
    pub fn complete(
        &mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), TransitionError> {
        if self.status != JobStatus::Processing {
            return Err(self.illegal(JobStatus::Completed));
        }
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.message = Some("Conversion completed".to_string());
        self.result = Some(result);
        self.error = None;
        self.finish(now, ttl);
        Ok(())
    }

    /// Terminal failure (non-retryable, or retries exhausted)
    pub fn fail(
        &mut self,
        error: JobError,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), TransitionError> {
        if self.status != JobStatus::Processing {
            return Err(self.illegal(JobStatus::Failed));
        }
        self.status = JobStatus::Failed;
        self.message = Some(error.message.clone());
        self.result = None;
        self.error = Some(error);
        self.finish(now, ttl);
        Ok(())
    }

    /// Loop back for another attempt after a retryable failure
    pub fn schedule_retry(
        &mut self,
        reason: &str,
        delay: Duration,
    ) -> Result<(), TransitionError> {
        if self.status != JobStatus::Processing {
            return Err(self.illegal(JobStatus::Processing));
        }
        if !self.can_retry() {
            return Err(TransitionError::RetriesExhausted {
                job_id: self.id.clone(),
                max_retries: self.max_retries,
            });
        }
        self.attempt += 1;
        self.progress = 0;
        self.current_step = None;
        self.total_steps = None;
        self.message = Some(format!(
            "{}; retrying in {}s (retry {} of {})",
            reason,
            delay.as_secs(),
            self.attempt,
            self.max_retries
        ));
        Ok(())
    }

    /// Explicit client cancel of a pending or processing job
    pub fn cancel(&mut self, now: DateTime<Utc>, ttl: Duration) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(self.illegal(JobStatus::Cancelled));
        }
        let error = JobError::cancelled();
        self.status = JobStatus::Cancelled;
        self.message = Some(error.message.clone());
        self.result = None;
        self.error = Some(error);
        self.finish(now, ttl);
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.completed_at = Some(now);
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.expires_at = Some(expires_at);
    }
}

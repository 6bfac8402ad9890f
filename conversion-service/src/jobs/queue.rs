//! Task queue client.
//!
//! Producers enqueue a [`JobPayload`] per job; workers lease messages with
//! [`TaskQueue::next`] and acknowledge them only after the job's terminal
//! write. Revocation reaches both queued messages and executing workers.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CancellationRegistry, InflightGuard};
use crate::db::{Database, QueueMessage};
use crate::engine::{ConversionOptions, ConversionRequest};
use crate::error::{DatabaseError, ServiceError, ServiceResult};

/// Serialized form of a submission, carried on the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: String,
    pub filename: String,
    /// Base64 of the uploaded file
    pub content: String,
    pub options: ConversionOptions,
}

impl JobPayload {
    pub fn new(
        job_id: impl Into<String>,
        filename: impl Into<String>,
        content: &[u8],
        options: ConversionOptions,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            filename: filename.into(),
            content: BASE64.encode(content),
            options,
        }
    }

    pub fn decode(raw: &str) -> ServiceResult<Self> {
        serde_json::from_str(raw).map_err(|e| ServiceError::Database(DatabaseError::Serialization(e)))
    }

    pub fn into_request(self) -> ServiceResult<ConversionRequest> {
        let content = BASE64
            .decode(self.content.as_bytes())
            .map_err(|e| ServiceError::Internal {
                message: format!("Undecodable file content for job {}: {}", self.job_id, e),
            })?;

        Ok(ConversionRequest {
            job_id: self.job_id,
            filename: self.filename,
            content: Bytes::from(content),
            options: self.options,
        })
    }
}

/// What a revoke call found
#[derive(Debug, Clone)]
pub enum Revocation {
    /// The message was still waiting and has been removed
    Dequeued,
    /// A worker is executing the job; its token has been fired.
    /// The contained token completes once the worker released the job.
    InFlight(CancellationToken),
    /// Neither waiting nor executing
    NotQueued,
}

pub struct TaskQueue {
    db: Arc<Database>,
    registry: Arc<CancellationRegistry>,
    available: Notify,
    lease: Duration,
    poll_interval: Duration,
}

impl TaskQueue {
    pub fn new(db: Arc<Database>, lease: Duration, poll_interval: Duration) -> Self {
        Self {
            db,
            registry: CancellationRegistry::new(),
            available: Notify::new(),
            lease,
            poll_interval,
        }
    }

    pub fn enqueue(&self, payload: &JobPayload) -> ServiceResult<()> {
        let raw = serde_json::to_string(payload).map_err(DatabaseError::Serialization)?;
        self.db
            .enqueue_message(&payload.job_id, &raw, Utc::now())?;
        self.available.notify_one();
        self.record_depth();

        debug!(job_id = %payload.job_id, "Job enqueued");
        Ok(())
    }

    /// Lease the next claimable message without waiting
    pub fn try_claim(&self) -> ServiceResult<Option<QueueMessage>> {
        let message = self.db.claim_next_message(Utc::now(), self.lease)?;
        if let Some(message) = &message {
            debug!(
                job_id = %message.job_id,
                deliveries = message.deliveries,
                "Job claimed"
            );
        }
        Ok(message)
    }

    /// Wait for the next message. Returns `None` once `shutdown` fires.
    pub async fn next(&self, shutdown: &CancellationToken) -> ServiceResult<Option<QueueMessage>> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(message) = self.try_claim()? {
                return Ok(Some(message));
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = self.available.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Acknowledge a message after its job reached a terminal state
    pub fn ack(&self, message: &QueueMessage) -> ServiceResult<()> {
        let acked = self
            .db
            .ack_message(&message.job_id, &message.lease_token)?;
        if !acked {
            debug!(job_id = %message.job_id, "Ack ignored: lease no longer held");
        }
        self.record_depth();
        Ok(())
    }

    /// Redeliver the same message after `delay`
    pub fn retry_later(&self, message: &QueueMessage, delay: Duration) -> ServiceResult<()> {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let available_at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
        self.db
            .release_message(&message.job_id, &message.lease_token, available_at)?;
        Ok(())
    }

    /// Mark a claimed job as executing so it can be revoked
    pub fn track(&self, job_id: &str) -> InflightGuard {
        self.registry.register(job_id)
    }

    /// Abort a job wherever it is: drop its waiting message, or signal the
    /// worker executing it.
    pub fn revoke(&self, job_id: &str) -> ServiceResult<Revocation> {
        if self.db.remove_unclaimed_message(job_id, Utc::now())? {
            info!(job_id = %job_id, "Revoked queued job");
            self.record_depth();
            return Ok(Revocation::Dequeued);
        }

        match self.registry.cancel(job_id) {
            Some(released) => Ok(Revocation::InFlight(released)),
            None => Ok(Revocation::NotQueued),
        }
    }

    /// Fire the token of an executing job, if any, without touching the queue.
    /// Returns the token that completes once the worker released the job.
    pub fn signal(&self, job_id: &str) -> Option<CancellationToken> {
        self.registry.cancel(job_id)
    }

    /// Drop a job's message regardless of its lease
    pub fn forget(&self, job_id: &str) -> ServiceResult<()> {
        if self.db.remove_message(job_id)? {
            self.record_depth();
        }
        Ok(())
    }

    pub fn depth(&self) -> ServiceResult<usize> {
        self.db.queue_depth()
    }

    pub fn inflight(&self) -> usize {
        self.registry.inflight_count()
    }

    fn record_depth(&self) {
        if let Ok(depth) = self.db.queue_depth() {
            metrics::gauge!("converter_queue_depth").set(depth as f64);
        }
    }
}

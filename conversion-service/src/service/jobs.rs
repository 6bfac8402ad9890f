//! Job controller operations: submit, status, result and cancel.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::validation::validate_upload;
use super::{ConversionService, Upload};
use crate::error::{ServiceError, ServiceResult, format_error_chain};
use crate::jobs::{JobError, JobPayload, JobRecord, JobStatus, Revocation};

/// What a result lookup found
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Still pending or processing
    NotReady(JobRecord),
    Completed {
        record: JobRecord,
        result: serde_json::Value,
    },
    Failed {
        record: JobRecord,
        error: JobError,
    },
    Cancelled {
        record: JobRecord,
        error: JobError,
    },
}

/// What a cancel call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending or processing and is now cancelled
    Cancelled,
    /// The job finished on its own while the cancel was in progress
    AlreadyFinished,
    /// The job was already terminal and its record has been deleted
    Forgotten,
    /// No such job (never existed, expired, or already forgotten)
    NotFound,
}

impl CancelOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            CancelOutcome::Cancelled => "Job cancelled",
            CancelOutcome::AlreadyFinished => "Job had already finished",
            CancelOutcome::Forgotten => "Job result deleted",
            CancelOutcome::NotFound => "Job not found or already deleted",
        }
    }
}

fn not_found(job_id: &str) -> ServiceError {
    ServiceError::JobNotFound {
        job_id: job_id.to_string(),
    }
}

impl ConversionService {
    /// Validate an upload, record it as pending and queue it for a worker
    pub fn submit_job(&self, upload: Upload) -> ServiceResult<JobRecord> {
        validate_upload(
            &upload.filename,
            upload.content.len(),
            self.config.limits.max_file_size_mb,
        )?;

        let job_id = Uuid::new_v4().to_string();
        let record = JobRecord::new(
            job_id.as_str(),
            upload.filename.as_str(),
            self.config.jobs.max_retries,
            Utc::now(),
        );
        self.db.insert_job(&record)?;

        let payload = JobPayload::new(
            job_id.as_str(),
            upload.filename.as_str(),
            &upload.content,
            upload.options,
        );
        if let Err(e) = self.queue.enqueue(&payload) {
            // Never leave a pending record that no worker will see
            if let Err(cleanup) = self.db.delete_job(&job_id) {
                warn!(job_id = %job_id, error = %format_error_chain(&cleanup), "Failed to remove unqueued job");
            }
            return Err(e);
        }

        metrics::counter!("converter_jobs_submitted_total").increment(1);
        info!(
            job_id = %job_id,
            filename = %upload.filename,
            size_bytes = upload.content.len(),
            "Job submitted"
        );
        Ok(record)
    }

    /// Point-in-time snapshot of a job, without its result payload
    pub fn job_status(&self, job_id: &str) -> ServiceResult<JobRecord> {
        self.db
            .get_job(job_id, Utc::now())?
            .map(|record| record.snapshot())
            .ok_or_else(|| not_found(job_id))
    }

    pub fn job_result(&self, job_id: &str) -> ServiceResult<JobOutcome> {
        let record = self
            .db
            .get_job(job_id, Utc::now())?
            .ok_or_else(|| not_found(job_id))?;

        let corrupt = |what: &str| ServiceError::Internal {
            message: format!("Job {job_id} is {} but has no {what}", record.status),
        };

        match record.status {
            JobStatus::Pending | JobStatus::Processing => Ok(JobOutcome::NotReady(record.snapshot())),
            JobStatus::Completed => {
                let result = record.result.clone().ok_or_else(|| corrupt("result"))?;
                Ok(JobOutcome::Completed {
                    record: record.snapshot(),
                    result,
                })
            }
            JobStatus::Failed => {
                let error = record.error.clone().ok_or_else(|| corrupt("error"))?;
                Ok(JobOutcome::Failed { record, error })
            }
            JobStatus::Cancelled => {
                let error = record.error.clone().unwrap_or_else(JobError::cancelled);
                Ok(JobOutcome::Cancelled { record, error })
            }
        }
    }

    /// Cancel a running job, or forget a finished one. Never fails for a
    /// job that is already gone.
    pub async fn cancel_job(&self, job_id: &str) -> ServiceResult<CancelOutcome> {
        let Some(record) = self.db.get_job(job_id, Utc::now())? else {
            self.queue.forget(job_id)?;
            return Ok(CancelOutcome::NotFound);
        };

        if record.is_terminal() {
            self.db.delete_job(job_id)?;
            self.queue.forget(job_id)?;
            info!(job_id = %job_id, status = %record.status, "Forgot finished job");
            return Ok(CancelOutcome::Forgotten);
        }

        let waited = match self.queue.revoke(job_id)? {
            Revocation::InFlight(released) => {
                self.await_release(job_id, released).await;
                true
            }
            Revocation::Dequeued | Revocation::NotQueued => false,
        };

        let outcome = self.settle_cancel(job_id, waited).await?;
        self.queue.forget(job_id)?;
        Ok(outcome)
    }

    /// Write the cancellation. A processing record is only overwritten once
    /// its worker has been signalled and released the job, or the wait for
    /// that release has already been spent.
    async fn settle_cancel(&self, job_id: &str, mut waited: bool) -> ServiceResult<CancelOutcome> {
        let ttl = self.config.jobs.result_ttl();

        loop {
            let now = Utc::now();
            let written = self.db.update_job(job_id, now, |job| {
                if !waited && job.status == JobStatus::Processing {
                    return Ok(false);
                }
                job.cancel(now, ttl)?;
                Ok(true)
            });

            let outcome = match written {
                Ok(Some(true)) => {
                    metrics::counter!("converter_jobs_cancelled_total").increment(1);
                    info!(job_id = %job_id, "Job cancelled");
                    CancelOutcome::Cancelled
                }
                // Claimed after the revoke missed it; the worker is running now
                Ok(Some(false)) => {
                    if let Some(released) = self.queue.signal(job_id) {
                        self.await_release(job_id, released).await;
                    }
                    waited = true;
                    continue;
                }
                Ok(None) => CancelOutcome::NotFound,
                // Settled concurrently, either by the worker observing the revoke
                // or by the job finishing first
                Err(ServiceError::Transition(_)) => match self.db.get_job(job_id, now)? {
                    Some(current) if current.status == JobStatus::Cancelled => CancelOutcome::Cancelled,
                    Some(_) => CancelOutcome::AlreadyFinished,
                    None => CancelOutcome::NotFound,
                },
                Err(e) => return Err(e),
            };
            return Ok(outcome);
        }
    }

    async fn await_release(&self, job_id: &str, released: CancellationToken) {
        let wait = self.cancel_wait();
        if tokio::time::timeout(wait, released.cancelled()).await.is_err() {
            warn!(
                job_id = %job_id,
                waited_secs = wait.as_secs(),
                "Worker did not release the cancelled job in time"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::engine::testing::{ScriptedEngine, Step, factory};
    use crate::jobs::{JobErrorKind, RetryPolicy, WorkerPool, WorkerSettings};
    use crate::service::testing::{service, upload};
    use std::sync::Arc;
    use std::time::Duration;

    fn start_pool(service: &ConversionService, engine: Arc<ScriptedEngine>) -> WorkerPool {
        let mut settings = WorkerSettings::from_config(&service.config.jobs);
        settings.retry = RetryPolicy::fixed(Duration::from_millis(10));
        WorkerPool::start(
            service.db.clone(),
            service.queue.clone(),
            factory(engine),
            settings,
            1,
            1,
        )
    }

    async fn wait_for_status(service: &ConversionService, job_id: &str, done: impl Fn(&JobRecord) -> bool) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = service.job_status(job_id).unwrap();
                if done(&record) {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_submit_creates_pending_job() {
        let service = service(ScriptedEngine::new([]), |_| {});
        let record = service.submit_job(upload("report.pdf")).unwrap();

        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.progress, 0);
        assert_eq!(service.queue.depth().unwrap(), 1);

        let status = service.job_status(&record.id).unwrap();
        assert_eq!(status.status, JobStatus::Pending);
        assert!(matches!(service.job_result(&record.id).unwrap(), JobOutcome::NotReady(_)));
    }

    #[test]
    fn test_submit_ids_are_unique() {
        let service = service(ScriptedEngine::new([]), |_| {});
        let a = service.submit_job(upload("a.pdf")).unwrap();
        let b = service.submit_job(upload("a.pdf")).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_invalid_upload_never_queued() {
        let service = service(ScriptedEngine::new([]), |config| {
            config.limits.max_file_size_mb = 1;
        });
        assert!(matches!(
            service.submit_job(upload("virus.exe")),
            Err(ServiceError::UnsupportedFormat { .. })
        ));

        let mut big = upload("big.pdf");
        big.content = bytes::Bytes::from(vec![0u8; 2 * 1024 * 1024]);
        assert!(matches!(
            service.submit_job(big),
            Err(ServiceError::FileTooLarge { .. })
        ));
        assert_eq!(service.queue.depth().unwrap(), 0);
    }

    #[test]
    fn test_unknown_job() {
        let service = service(ScriptedEngine::new([]), |_| {});
        assert!(matches!(
            service.job_status("missing"),
            Err(ServiceError::JobNotFound { .. })
        ));
        assert!(matches!(
            service.job_result("missing"),
            Err(ServiceError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_job_result() {
        let engine = ScriptedEngine::new([Step::Succeed(vec![0, 20, 80, 100])]);
        let service = service(engine.clone(), |_| {});
        let pool = start_pool(&service, engine);

        let record = service.submit_job(upload("report.pdf")).unwrap();
        let status = wait_for_status(&service, &record.id, JobRecord::is_terminal).await;
        assert_eq!(status.status, JobStatus::Completed);
        assert!(status.result.is_none(), "status never exposes the result");

        let JobOutcome::Completed { result, .. } = service.job_result(&record.id).unwrap() else {
            panic!("expected completed outcome");
        };
        assert_eq!(result["pages"], 5);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_job_result() {
        let engine = ScriptedEngine::new([Step::Fail(EngineError::failed("corrupt"))]);
        let service = service(engine.clone(), |_| {});
        let pool = start_pool(&service, engine);

        let record = service.submit_job(upload("report.pdf")).unwrap();
        wait_for_status(&service, &record.id, JobRecord::is_terminal).await;

        let JobOutcome::Failed { error, .. } = service.job_result(&record.id).unwrap() else {
            panic!("expected failed outcome");
        };
        assert_eq!(error.kind, JobErrorKind::ExecutionFailed);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_then_forget() {
        let service = service(ScriptedEngine::new([]), |_| {});
        let record = service.submit_job(upload("report.pdf")).unwrap();

        assert_eq!(service.cancel_job(&record.id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(service.queue.depth().unwrap(), 0);
        let JobOutcome::Cancelled { error, record: cancelled } = service.job_result(&record.id).unwrap() else {
            panic!("expected cancelled outcome");
        };
        assert_eq!(error.kind, JobErrorKind::Cancelled);
        assert!(cancelled.result.is_none());

        // Idempotent: the second call forgets, later calls find nothing
        assert_eq!(service.cancel_job(&record.id).await.unwrap(), CancelOutcome::Forgotten);
        assert!(matches!(
            service.job_status(&record.id),
            Err(ServiceError::JobNotFound { .. })
        ));
        assert_eq!(service.cancel_job(&record.id).await.unwrap(), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_processing_job() {
        let engine = ScriptedEngine::new([Step::Block {
            stall: Duration::from_millis(0),
        }]);
        let service = service(engine.clone(), |_| {});
        let pool = start_pool(&service, engine);

        let record = service.submit_job(upload("report.pdf")).unwrap();
        wait_for_status(&service, &record.id, |r| r.progress == 20).await;

        assert_eq!(service.cancel_job(&record.id).await.unwrap(), CancelOutcome::Cancelled);
        let status = service.job_status(&record.id).unwrap();
        assert_eq!(status.status, JobStatus::Cancelled);
        assert_eq!(service.queue.inflight(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(service.job_status(&record.id).unwrap().progress, 20);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_during_retry_backoff() {
        let engine = ScriptedEngine::new([Step::Fail(EngineError::resource_exhausted("oom"))]);
        let service = service(engine.clone(), |_| {});
        let mut settings = WorkerSettings::from_config(&service.config.jobs);
        settings.retry = RetryPolicy::fixed(Duration::from_secs(30));
        let pool = WorkerPool::start(
            service.db.clone(),
            service.queue.clone(),
            factory(engine),
            settings,
            1,
            1,
        );

        let record = service.submit_job(upload("report.pdf")).unwrap();
        wait_for_status(&service, &record.id, |r| r.attempt == 1).await;
        // Give the worker a moment to hand the message back to the queue
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(service.cancel_job(&record.id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(service.job_status(&record.id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(service.queue.depth().unwrap(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_claimed_job_before_worker_starts() {
        let service = service(ScriptedEngine::new([]), |_| {});
        let record = service.submit_job(upload("report.pdf")).unwrap();
        let message = service.queue.try_claim().unwrap().unwrap();
        assert_eq!(message.job_id, record.id);

        assert_eq!(service.cancel_job(&record.id).await.unwrap(), CancelOutcome::Cancelled);

        // The worker that holds the message can no longer start it
        let _guard = service.queue.track(&record.id);
        let now = Utc::now();
        assert!(matches!(
            service.db.update_job(&record.id, now, |job| job.start_attempt(now)),
            Err(ServiceError::Transition(_))
        ));
        assert_eq!(service.job_status(&record.id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_worker_that_started_after_revoke() {
        let service = service(ScriptedEngine::new([]), |_| {});
        let record = service.submit_job(upload("report.pdf")).unwrap();
        service.queue.try_claim().unwrap().unwrap();

        // Nothing was tracked when the revoke ran
        assert!(matches!(
            service.queue.revoke(&record.id).unwrap(),
            Revocation::NotQueued
        ));
        let guard = service.queue.track(&record.id);
        let now = Utc::now();
        service
            .db
            .update_job(&record.id, now, |job| job.start_attempt(now))
            .unwrap()
            .unwrap();

        let cancel = tokio::spawn({
            let service = service.clone();
            let job_id = record.id.clone();
            async move { service.settle_cancel(&job_id, false).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(guard.is_revoked());
        assert!(!cancel.is_finished());
        assert_eq!(service.job_status(&record.id).unwrap().status, JobStatus::Processing);

        drop(guard);
        assert_eq!(cancel.await.unwrap().unwrap(), CancelOutcome::Cancelled);
        assert_eq!(service.job_status(&record.id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_completed_job_expires_after_ttl() {
        let engine = ScriptedEngine::new([Step::Succeed(vec![100])]);
        let service = service(engine.clone(), |config| {
            config.jobs.result_ttl_secs = 1;
        });
        let pool = start_pool(&service, engine);

        let record = service.submit_job(upload("report.pdf")).unwrap();
        let done = wait_for_status(&service, &record.id, JobRecord::is_terminal).await;
        let expires_at = done.expires_at.unwrap();
        assert_eq!(
            expires_at.timestamp_millis(),
            (done.completed_at.unwrap() + chrono::Duration::seconds(1)).timestamp_millis()
        );

        let remaining = (expires_at - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(remaining + Duration::from_millis(10)).await;
        assert!(matches!(
            service.job_status(&record.id),
            Err(ServiceError::JobNotFound { .. })
        ));
        pool.shutdown().await;
    }
}

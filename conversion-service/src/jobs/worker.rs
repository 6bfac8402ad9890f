//! Worker loop: lease a job, execute it, record the outcome.
//!
//! Each worker owns one engine handle and runs one job at a time. The
//! delegated call is bounded three ways:
//! - a revoke gives the engine `cancel_grace` to yield before the call is dropped
//! - the soft limit fires the engine's token and asks it to stop
//! - the hard limit drops the call future outright
//!
//! The queue message is acknowledged only after the terminal write, so a
//! worker that vanishes mid-job leaves the message to be redelivered.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    InflightGuard, JobError, JobErrorKind, JobPayload, JobRecord, ProgressReporter,
    ProgressWriter, RetryPolicy, TaskQueue, TransitionError,
};
use crate::config::JobsConfig;
use crate::db::{Database, QueueMessage};
use crate::engine::{ConversionEngine, ConversionOutput, ConversionRequest, EngineError};
use crate::error::{ServiceError, format_error_chain};

/// Timing and retry settings shared by all workers
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub result_ttl: Duration,
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub cancel_grace: Duration,
    pub max_jobs_per_worker: u32,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            result_ttl: config.result_ttl(),
            soft_time_limit: config.soft_time_limit(),
            hard_time_limit: config.hard_time_limit(),
            cancel_grace: config.cancel_grace(),
            max_jobs_per_worker: config.max_jobs_per_worker,
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// Why a worker loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Reached its job budget; the pool starts a fresh generation
    Recycle,
    Shutdown,
}

/// How the delegated call ended
enum Execution {
    Finished {
        result: Result<ConversionOutput, EngineError>,
        soft_limit_hit: bool,
    },
    /// The call did not yield in time and was dropped
    Abandoned { soft_limit_hit: bool },
}

enum Outcome {
    Completed(serde_json::Value),
    Retry(EngineError),
    Failed(JobError),
    Cancelled,
}

pub struct Worker {
    id: usize,
    db: Arc<Database>,
    queue: Arc<TaskQueue>,
    engine: Arc<dyn ConversionEngine>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        id: usize,
        db: Arc<Database>,
        queue: Arc<TaskQueue>,
        engine: Arc<dyn ConversionEngine>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            db,
            queue,
            engine,
            settings,
        }
    }

    /// Process jobs until shutdown or until the job budget is spent
    pub async fn run(self, shutdown: CancellationToken) -> WorkerExit {
        info!(worker = self.id, "Conversion worker started");
        let mut executed = 0u32;

        loop {
            let message = match self.queue.next(&shutdown).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!(worker = self.id, "Conversion worker stopping");
                    return WorkerExit::Shutdown;
                }
                Err(e) => {
                    error!(worker = self.id, error = %format_error_chain(&e), "Failed to poll the job queue");
                    tokio::select! {
                        _ = shutdown.cancelled() => return WorkerExit::Shutdown,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };

            if self.process(message).await {
                executed += 1;
            }

            if executed >= self.settings.max_jobs_per_worker {
                info!(worker = self.id, executed, "Worker reached its job budget, recycling");
                return WorkerExit::Recycle;
            }
        }
    }

    /// Handle one delivery. Returns whether the engine was invoked.
    pub async fn process(&self, message: QueueMessage) -> bool {
        let job_id = message.job_id.clone();
        let guard = self.queue.track(&job_id);

        let now = Utc::now();
        let attempt = match self.db.update_job(&job_id, now, |job| {
            job.start_attempt(now)?;
            Ok(job.attempt)
        }) {
            Ok(Some(attempt)) => attempt,
            Ok(None) => {
                debug!(job_id = %job_id, "Dropping message for missing or expired job");
                self.ack(&message);
                return false;
            }
            Err(ServiceError::Transition(e)) => {
                debug!(job_id = %job_id, error = %e, "Skipping redelivery of finished job");
                self.ack(&message);
                return false;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %format_error_chain(&e), "Failed to start job, requeueing");
                self.requeue(&message, self.settings.retry.base_delay);
                return false;
            }
        };

        info!(
            worker = self.id,
            job_id = %job_id,
            attempt,
            delivery = message.deliveries,
            "Job started"
        );

        let request = match JobPayload::decode(&message.payload).and_then(JobPayload::into_request) {
            Ok(request) => request,
            Err(e) => {
                let error = JobError::new(JobErrorKind::Internal, format_error_chain(&e));
                self.record(&message, Outcome::Failed(error), &guard);
                return false;
            }
        };

        let engine_cancel = guard.token().child_token();
        let (reporter, writer) = ProgressWriter::spawn(
            self.db.clone(),
            &job_id,
            engine_cancel.clone(),
            guard.token().clone(),
        );

        let execution = self
            .execute(request, reporter, &engine_cancel, guard.token())
            .await;
        writer.finish().await;

        // The job now belongs to the newer delivery; its lease token is stale
        if guard.is_superseded() {
            warn!(
                worker = self.id,
                job_id = %job_id,
                "Lease lost to a redelivery, dropping this execution's outcome"
            );
            return true;
        }

        let outcome = self.classify(execution, guard.is_revoked());
        self.record(&message, outcome, &guard);
        true
    }

    async fn execute(
        &self,
        request: ConversionRequest,
        reporter: ProgressReporter,
        engine_cancel: &CancellationToken,
        revoked: &CancellationToken,
    ) -> Execution {
        let started = Instant::now();
        let soft_deadline = started + self.settings.soft_time_limit;
        let mut drop_deadline = started + self.settings.hard_time_limit;
        let mut soft_limit_hit = false;
        let mut revoke_seen = false;

        let mut call = self
            .engine
            .convert(request, reporter, engine_cancel.clone());

        loop {
            tokio::select! {
                biased;
                result = &mut call => {
                    return Execution::Finished { result, soft_limit_hit };
                }
                _ = revoked.cancelled(), if !revoke_seen => {
                    revoke_seen = true;
                    drop_deadline = drop_deadline.min(Instant::now() + self.settings.cancel_grace);
                }
                _ = tokio::time::sleep_until(soft_deadline), if !soft_limit_hit => {
                    soft_limit_hit = true;
                    warn!(worker = self.id, "Soft time limit reached, asking engine to stop");
                    engine_cancel.cancel();
                }
                _ = tokio::time::sleep_until(drop_deadline) => {
                    warn!(worker = self.id, revoked = revoke_seen, "Engine did not yield, dropping the call");
                    return Execution::Abandoned { soft_limit_hit };
                }
            }
        }
    }

    fn classify(&self, execution: Execution, revoked: bool) -> Outcome {
        if revoked {
            return Outcome::Cancelled;
        }

        let time_limit = |limit: Duration, kind: &str| {
            Outcome::Failed(JobError::new(
                JobErrorKind::TimeLimitExceeded,
                format!("Conversion exceeded the {kind} time limit of {}s", limit.as_secs()),
            ))
        };

        match execution {
            Execution::Finished {
                result: Ok(output),
                ..
            } => match serde_json::to_value(&output) {
                Ok(value) => Outcome::Completed(value),
                Err(e) => Outcome::Failed(JobError::new(
                    JobErrorKind::Internal,
                    format!("Failed to serialize conversion output: {e}"),
                )),
            },
            Execution::Finished {
                result: Err(EngineError::Cancelled | EngineError::TimeLimitExceeded),
                soft_limit_hit: true,
            } => time_limit(self.settings.soft_time_limit, "soft"),
            Execution::Finished {
                result: Err(error),
                ..
            } => {
                if error.is_retryable() {
                    Outcome::Retry(error)
                } else if error == EngineError::TimeLimitExceeded {
                    Outcome::Failed(JobError::new(JobErrorKind::TimeLimitExceeded, error.to_string()))
                } else {
                    Outcome::Failed(JobError::new(JobErrorKind::ExecutionFailed, error.to_string()))
                }
            }
            Execution::Abandoned { .. } => time_limit(self.settings.hard_time_limit, "hard"),
        }
    }

    /// Write the outcome, then settle the queue message
    fn record(&self, message: &QueueMessage, outcome: Outcome, guard: &InflightGuard) {
        let job_id = guard.job_id();
        let ttl = self.settings.result_ttl;
        let now = Utc::now();

        match outcome {
            Outcome::Completed(result) => {
                match self.db.update_job(job_id, now, |job| job.complete(result, now, ttl)) {
                    Ok(Some(())) => {
                        metrics::counter!("converter_jobs_completed_total").increment(1);
                        info!(worker = self.id, job_id = %job_id, "Job completed");
                        self.ack(message);
                    }
                    other => self.settle_rejected(message, job_id, other),
                }
            }
            Outcome::Failed(job_error) => {
                let text = job_error.message.clone();
                match self.db.update_job(job_id, now, |job| job.fail(job_error, now, ttl)) {
                    Ok(Some(())) => {
                        metrics::counter!("converter_jobs_failed_total").increment(1);
                        error!(worker = self.id, job_id = %job_id, error = %text, "Job failed");
                        self.ack(message);
                    }
                    other => self.settle_rejected(message, job_id, other),
                }
            }
            Outcome::Cancelled => {
                match self.db.update_job(job_id, now, |job| job.cancel(now, ttl)) {
                    Ok(Some(())) => {
                        metrics::counter!("converter_jobs_cancelled_total").increment(1);
                        info!(worker = self.id, job_id = %job_id, "Job cancelled");
                    }
                    Ok(None) | Err(ServiceError::Transition(_)) => {
                        debug!(job_id = %job_id, "Job already settled by the canceller");
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %format_error_chain(&e), "Failed to record cancellation");
                    }
                }
                self.ack(message);
            }
            Outcome::Retry(engine_error) => self.retry_or_fail(message, job_id, engine_error),
        }
    }

    fn retry_or_fail(&self, message: &QueueMessage, job_id: &str, engine_error: EngineError) {
        let ttl = self.settings.result_ttl;
        let policy = self.settings.retry;
        let now = Utc::now();
        let reason = engine_error.to_string();

        let decision = self.db.update_job(job_id, now, |job: &mut JobRecord| {
            if job.can_retry() {
                let delay = policy.delay_for(job.attempt + 1);
                job.schedule_retry(&reason, delay)?;
                Ok::<_, TransitionError>(Some((delay, job.attempt)))
            } else {
                let error = JobError::new(
                    JobErrorKind::RetriesExhausted,
                    format!("{} (gave up after {} retries)", reason, job.max_retries),
                );
                job.fail(error, now, ttl)?;
                Ok(None)
            }
        });

        match decision {
            Ok(Some(Some((delay, attempt)))) => {
                metrics::counter!("converter_job_retries_total").increment(1);
                warn!(
                    worker = self.id,
                    job_id = %job_id,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    error = %reason,
                    "Retryable failure, scheduling another attempt"
                );
                self.requeue(message, delay);
            }
            Ok(Some(None)) => {
                metrics::counter!("converter_jobs_failed_total").increment(1);
                error!(worker = self.id, job_id = %job_id, error = %reason, "Job failed, retries exhausted");
                self.ack(message);
            }
            other => self.settle_rejected(message, job_id, other),
        }
    }

    /// A terminal write did not apply: the job is gone, already terminal,
    /// or the store failed. Only the last case keeps the message for redelivery.
    fn settle_rejected<T>(
        &self,
        message: &QueueMessage,
        job_id: &str,
        result: Result<Option<T>, ServiceError>,
    ) {
        match result {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(job_id = %job_id, "Job disappeared before its outcome was stored");
                self.ack(message);
            }
            Err(ServiceError::Transition(e)) => {
                debug!(job_id = %job_id, error = %e, "Outcome discarded, job already finished");
                self.ack(message);
            }
            Err(e) => {
                error!(
                    job_id = %job_id,
                    error = %format_error_chain(&e),
                    "Failed to store job outcome, leaving message for redelivery"
                );
            }
        }
    }

    fn ack(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.ack(message) {
            warn!(job_id = %message.job_id, error = %format_error_chain(&e), "Failed to acknowledge message");
        }
    }

    fn requeue(&self, message: &QueueMessage, delay: Duration) {
        if let Err(e) = self.queue.retry_later(message, delay) {
            warn!(job_id = %message.job_id, error = %format_error_chain(&e), "Failed to requeue message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{ScriptedEngine, Step};
    use crate::engine::ConversionOptions;
    use crate::jobs::{JobStatus, Revocation};

    struct Harness {
        db: Arc<Database>,
        queue: Arc<TaskQueue>,
        shutdown: CancellationToken,
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            result_ttl: Duration::from_secs(3600),
            soft_time_limit: Duration::from_secs(5),
            hard_time_limit: Duration::from_secs(10),
            cancel_grace: Duration::from_millis(200),
            max_jobs_per_worker: 50,
            retry: RetryPolicy::fixed(Duration::from_millis(20)),
        }
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = Arc::new(TaskQueue::new(
            db.clone(),
            Duration::from_secs(60),
            Duration::from_millis(5),
        ));
        Harness {
            db,
            queue,
            shutdown: CancellationToken::new(),
        }
    }

    impl Harness {
        fn submit(&self, job_id: &str, max_retries: u32) {
            self.db
                .insert_job(&JobRecord::new(job_id, "doc.pdf", max_retries, Utc::now()))
                .unwrap();
            self.queue
                .enqueue(&JobPayload::new(
                    job_id,
                    "doc.pdf",
                    b"%PDF",
                    ConversionOptions::default(),
                ))
                .unwrap();
        }

        fn spawn_worker(
            &self,
            engine: Arc<ScriptedEngine>,
            settings: WorkerSettings,
        ) -> tokio::task::JoinHandle<WorkerExit> {
            let worker = Worker::new(0, self.db.clone(), self.queue.clone(), engine, settings);
            tokio::spawn(worker.run(self.shutdown.clone()))
        }

        fn job(&self, job_id: &str) -> JobRecord {
            self.db.get_job(job_id, Utc::now()).unwrap().unwrap()
        }

        async fn wait_for(&self, job_id: &str, done: impl Fn(&JobRecord) -> bool) -> JobRecord {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let job = self.job(job_id);
                    if done(&job) {
                        return job;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_job_completes_with_monotonic_progress() {
        let h = harness();
        h.submit("job-1", 3);
        let engine = ScriptedEngine::new([Step::Succeed(vec![0, 20, 80, 100])]);
        let worker = h.spawn_worker(engine.clone(), settings());

        let mut seen = Vec::new();
        let job = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = h.job("job-1");
                seen.push((job.status, job.progress));
                if job.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.attempt, 0);
        assert!(job.started_at.is_some() && job.completed_at.is_some());
        assert!(job.error.is_none());
        assert_eq!(job.result.as_ref().unwrap()["pages"], 5);

        let processing: Vec<u8> = seen
            .iter()
            .filter(|(status, _)| *status == JobStatus::Processing)
            .map(|(_, progress)| *progress)
            .collect();
        assert!(processing.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|(status, _)| *status != JobStatus::Failed));

        h.shutdown.cancel();
        assert_eq!(worker.await.unwrap(), WorkerExit::Shutdown);
        assert_eq!(h.queue.depth().unwrap(), 0);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let h = harness();
        h.submit("job-1", 3);
        let oom = || Step::Fail(EngineError::resource_exhausted("CUDA out of memory"));
        let engine = ScriptedEngine::new([oom(), oom(), Step::Succeed(vec![0, 50, 100])]);
        let _worker = h.spawn_worker(engine.clone(), settings());

        let job = h.wait_for("job-1", JobRecord::is_terminal).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt, 2);
        assert!(job.result.is_some());
        assert_eq!(engine.calls(), 3);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let h = harness();
        h.submit("job-1", 3);
        let oom = || Step::Fail(EngineError::resource_exhausted("CUDA out of memory"));
        let engine = ScriptedEngine::new([oom(), oom(), oom(), oom(), Step::Succeed(vec![100])]);
        let _worker = h.spawn_worker(engine.clone(), settings());

        let job = h.wait_for("job-1", JobRecord::is_terminal).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 3);
        assert!(job.result.is_none());
        assert_eq!(job.error.unwrap().kind, JobErrorKind::RetriesExhausted);
        assert_eq!(engine.calls(), 4);
        assert_eq!(h.queue.depth().unwrap(), 0);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_retry_backoff_is_visible_on_record() {
        let h = harness();
        h.submit("job-1", 3);
        let engine = ScriptedEngine::new([Step::Fail(EngineError::resource_exhausted("oom"))]);
        let mut slow_retry = settings();
        slow_retry.retry = RetryPolicy::fixed(Duration::from_secs(30));
        let _worker = h.spawn_worker(engine, slow_retry);

        let job = h.wait_for("job-1", |job| job.attempt == 1).await;
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 0);
        assert!(job.message.as_deref().unwrap().contains("retrying in 30s"));
        // The message waits out its delay on the queue
        assert_eq!(h.queue.depth().unwrap(), 1);
        assert!(h.queue.try_claim().unwrap().is_none());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let h = harness();
        h.submit("job-1", 3);
        let engine = ScriptedEngine::new([Step::Fail(EngineError::failed("encrypted pdf"))]);
        let _worker = h.spawn_worker(engine.clone(), settings());

        let job = h.wait_for("job-1", JobRecord::is_terminal).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 0);
        let error = job.error.unwrap();
        assert_eq!(error.kind, JobErrorKind::ExecutionFailed);
        assert!(error.message.contains("encrypted pdf"));
        assert_eq!(engine.calls(), 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancel_while_processing() {
        let h = harness();
        h.submit("job-1", 3);
        let engine = ScriptedEngine::new([Step::Block {
            stall: Duration::from_millis(0),
        }]);
        let _worker = h.spawn_worker(engine, settings());

        h.wait_for("job-1", |job| job.progress == 20).await;

        let Revocation::InFlight(released) = h.queue.revoke("job-1").unwrap() else {
            panic!("job should be in flight");
        };
        tokio::time::timeout(Duration::from_secs(1), released.cancelled())
            .await
            .unwrap();

        let job = h.job("job-1");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error.as_ref().unwrap().kind, JobErrorKind::Cancelled);
        assert!(job.result.is_none());

        // Nothing lands after the terminal write
        tokio::time::sleep(Duration::from_millis(30)).await;
        let later = h.job("job-1");
        assert_eq!(later.progress, 20);
        assert_eq!(later.status, JobStatus::Cancelled);
        assert_eq!(h.queue.inflight(), 0);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unyielding_engine_is_dropped_after_grace() {
        let h = harness();
        h.submit("job-1", 3);
        let engine = ScriptedEngine::new([Step::Block {
            stall: Duration::from_secs(60),
        }]);
        let _worker = h.spawn_worker(engine, settings());

        h.wait_for("job-1", |job| job.progress == 20).await;
        let Revocation::InFlight(released) = h.queue.revoke("job-1").unwrap() else {
            panic!("job should be in flight");
        };
        tokio::time::timeout(Duration::from_secs(2), released.cancelled())
            .await
            .unwrap();
        assert_eq!(h.job("job-1").status, JobStatus::Cancelled);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_soft_time_limit() {
        let h = harness();
        h.submit("job-1", 3);
        let engine = ScriptedEngine::new([Step::Block {
            stall: Duration::from_millis(0),
        }]);
        let mut limits = settings();
        limits.soft_time_limit = Duration::from_millis(30);
        let _worker = h.spawn_worker(engine, limits);

        let job = h.wait_for("job-1", JobRecord::is_terminal).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.kind, JobErrorKind::TimeLimitExceeded);
        assert!(error.message.contains("soft"));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_hard_time_limit() {
        let h = harness();
        h.submit("job-1", 3);
        let engine = ScriptedEngine::new([Step::Block {
            stall: Duration::from_secs(60),
        }]);
        let mut limits = settings();
        limits.soft_time_limit = Duration::from_millis(20);
        limits.hard_time_limit = Duration::from_millis(60);
        let _worker = h.spawn_worker(engine, limits);

        let job = h.wait_for("job-1", JobRecord::is_terminal).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.kind, JobErrorKind::TimeLimitExceeded);
        assert!(error.message.contains("hard"));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_redelivered_terminal_job_is_skipped() {
        let h = harness();
        h.submit("job-1", 3);
        let now = Utc::now();
        h.db.update_job("job-1", now, |job| job.cancel(now, Duration::from_secs(60)))
            .unwrap();

        let engine = ScriptedEngine::new([]);
        let worker = Worker::new(0, h.db.clone(), h.queue.clone(), engine.clone(), settings());
        let message = h.queue.try_claim().unwrap().unwrap();

        assert!(!worker.process(message).await);
        assert_eq!(engine.calls(), 0);
        assert_eq!(h.queue.depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_superseded_execution_leaves_record_to_newer_delivery() {
        let h = harness();
        h.submit("job-1", 3);
        let engine = ScriptedEngine::new([Step::Block {
            stall: Duration::from_millis(0),
        }]);
        let worker = Worker::new(0, h.db.clone(), h.queue.clone(), engine.clone(), settings());
        let message = h.queue.try_claim().unwrap().unwrap();
        let stale = tokio::spawn(async move { worker.process(message).await });
        h.wait_for("job-1", |job| job.progress == 20).await;

        // A redelivery registers the same job and takes it over
        let newer = h.queue.track("job-1");
        assert!(stale.await.unwrap());

        let job = h.job("job-1");
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.error.is_none());
        assert_eq!(engine.calls(), 1);
        assert!(!newer.is_revoked());
    }

    #[tokio::test]
    async fn test_worker_recycles_after_budget() {
        let h = harness();
        h.submit("job-1", 3);
        h.submit("job-2", 3);
        let engine = ScriptedEngine::new([]);
        let mut budget = settings();
        budget.max_jobs_per_worker = 2;

        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            h.spawn_worker(engine.clone(), budget),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(exit, WorkerExit::Recycle);
        assert_eq!(engine.calls(), 2);
        assert_eq!(h.job("job-1").status, JobStatus::Completed);
        assert_eq!(h.job("job-2").status, JobStatus::Completed);
    }
}

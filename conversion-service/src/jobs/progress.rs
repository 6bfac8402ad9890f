//! Ordered progress channel from an executing engine to the result store.
//!
//! Engines push updates into a [`ProgressReporter`]; a single writer task per
//! execution applies them to the job record in order. The worker drains the
//! writer before its terminal write, so a progress update can never land on
//! top of the final state.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ProgressUpdate;
use crate::db::Database;
use crate::engine::EngineError;
use crate::error::{ServiceError, format_error_chain};

/// Handle given to an engine for reporting progress
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    cancel: CancellationToken,
}

impl ProgressReporter {
    /// Reporter whose updates go nowhere (synchronous conversions)
    pub fn discard(cancel: CancellationToken) -> Self {
        Self { tx: None, cancel }
    }

    /// Push an update. Fails once the execution is cancelled, which is the
    /// engine's cue to stop at this checkpoint.
    pub fn report(&self, update: ProgressUpdate) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match &self.tx {
            Some(tx) => tx.send(update).map_err(|_| EngineError::Cancelled),
            None => Ok(()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Background task applying one execution's progress updates
pub struct ProgressWriter {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl ProgressWriter {
    /// Start a writer for `job_id`. Updates are dropped once `revoked` fires.
    pub fn spawn(
        db: Arc<Database>,
        job_id: &str,
        engine_cancel: CancellationToken,
        revoked: CancellationToken,
    ) -> (ProgressReporter, ProgressWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_writer(
            db,
            job_id.to_string(),
            rx,
            revoked,
            stop.clone(),
        ));

        let reporter = ProgressReporter {
            tx: Some(tx),
            cancel: engine_cancel,
        };
        (reporter, ProgressWriter { handle, stop })
    }

    /// Apply everything already reported, then stop
    pub async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Progress writer task failed");
        }
    }
}

async fn run_writer(
    db: Arc<Database>,
    job_id: String,
    mut rx: mpsc::UnboundedReceiver<ProgressUpdate>,
    revoked: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            update = rx.recv() => match update {
                Some(update) => apply(&db, &job_id, &update, &revoked),
                None => return,
            },
            _ = stop.cancelled() => break,
        }
    }

    while let Ok(update) = rx.try_recv() {
        apply(&db, &job_id, &update, &revoked);
    }
}

fn apply(db: &Database, job_id: &str, update: &ProgressUpdate, revoked: &CancellationToken) {
    if revoked.is_cancelled() {
        debug!(job_id = %job_id, "Dropping progress update for revoked job");
        return;
    }

    match db.update_job(job_id, Utc::now(), |job| job.record_progress(update)) {
        Ok(Some(())) => {
            debug!(
                job_id = %job_id,
                progress = update.percent,
                message = %update.message,
                "Job progress"
            );
        }
        Ok(None) => debug!(job_id = %job_id, "Progress for missing job ignored"),
        Err(ServiceError::Transition(e)) => {
            debug!(job_id = %job_id, error = %e, "Progress update rejected");
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %format_error_chain(&e), "Failed to store progress");
        }
    }
}

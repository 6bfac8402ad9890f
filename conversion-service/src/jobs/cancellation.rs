//! Revocation tokens for in-flight jobs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Inflight {
    generation: u64,
    revoke: CancellationToken,
    released: CancellationToken,
    superseded: Arc<AtomicBool>,
}

/// Tracks the job each worker is currently executing
#[derive(Default)]
pub struct CancellationRegistry {
    inflight: DashMap<String, Inflight>,
    generations: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a job as executing. The entry lives until the guard drops.
    pub fn register(self: &Arc<Self>, job_id: &str) -> InflightGuard {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let revoke = CancellationToken::new();
        let released = CancellationToken::new();
        let superseded = Arc::new(AtomicBool::new(false));

        let previous = self.inflight.insert(
            job_id.to_string(),
            Inflight {
                generation,
                revoke: revoke.clone(),
                released: released.clone(),
                superseded: superseded.clone(),
            },
        );
        // A holder whose lease was lost must not keep running alongside us
        if let Some(previous) = previous {
            previous.superseded.store(true, Ordering::Release);
            previous.revoke.cancel();
        }
        debug!(job_id = %job_id, "Registered in-flight job");

        InflightGuard {
            registry: Arc::clone(self),
            job_id: job_id.to_string(),
            generation,
            revoke,
            released,
            superseded,
        }
    }

    /// Fire the revoke token of an executing job.
    ///
    /// Returns a token that completes once the worker has dropped the call
    /// and released its resource, or `None` if nothing is executing.
    pub fn cancel(&self, job_id: &str) -> Option<CancellationToken> {
        let entry = self.inflight.get(job_id)?;
        entry.revoke.cancel();
        info!(job_id = %job_id, "Job cancellation triggered");
        Some(entry.released.clone())
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

/// Held by the worker for the duration of one execution
pub struct InflightGuard {
    registry: Arc<CancellationRegistry>,
    job_id: String,
    generation: u64,
    revoke: CancellationToken,
    released: CancellationToken,
    superseded: Arc<AtomicBool>,
}

impl InflightGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Fires when the job is revoked
    pub fn token(&self) -> &CancellationToken {
        &self.revoke
    }

    pub fn is_revoked(&self) -> bool {
        self.revoke.is_cancelled()
    }

    /// Whether a newer delivery of the same job took over this execution
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let generation = self.generation;
        self.registry
            .inflight
            .remove_if(&self.job_id, |_, entry| entry.generation == generation);
        self.released.cancel();
        debug!(job_id = %self.job_id, "Released in-flight job");
    }
}

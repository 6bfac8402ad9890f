//! Periodic removal of expired job records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::format_error_chain;

/// Delete terminal records past their TTL every `interval`
pub fn spawn_ttl_sweeper(
    db: Arc<Database>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match db.purge_expired_jobs(Utc::now()) {
                Ok(count) if count > 0 => {
                    metrics::counter!("converter_jobs_expired_total").increment(count as u64);
                    info!(removed = count, "Evicted expired job records");
                }
                Err(e) => {
                    warn!(error = %format_error_chain(&e), "Job record sweep failed");
                }
                _ => {}
            }
        }
    })
}

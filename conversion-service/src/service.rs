//! Service layer between the HTTP boundary and the job subsystem.

mod convert;
mod jobs;
pub mod validation;

pub use convert::ConvertResponse;
pub use jobs::{CancelOutcome, JobOutcome};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::ServiceConfig;
use crate::db::Database;
use crate::engine::augmentation::AugmentationRegistry;
use crate::engine::{ConversionEngine, ConversionOptions, EngineFactory};
use crate::error::{ServiceError, ServiceResult};
use crate::jobs::TaskQueue;

/// Extra time a cancel waits beyond the worker's grace period
const CANCEL_WAIT_SLACK: Duration = Duration::from_secs(5);

/// A decoded upload, not yet validated
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub content: Bytes,
    pub options: ConversionOptions,
}

/// Main service coordinator
pub struct ConversionService {
    pub config: Arc<ServiceConfig>,
    pub db: Arc<Database>,
    pub queue: Arc<TaskQueue>,
    pub augmentation: Arc<AugmentationRegistry>,
    /// Engine handle for the synchronous path
    sync_engine: Arc<dyn ConversionEngine>,
    /// Synchronous conversions run one at a time. This slot and its engine
    /// sit outside the worker pool's resource bound; the API side keeps its
    /// own engine instance apart from the workers.
    sync_slot: Semaphore,
}

impl ConversionService {
    pub fn new(
        config: Arc<ServiceConfig>,
        db: Arc<Database>,
        queue: Arc<TaskQueue>,
        factory: &dyn EngineFactory,
        augmentation: Arc<AugmentationRegistry>,
    ) -> ServiceResult<Self> {
        let sync_engine = factory.create().map_err(|e| ServiceError::Internal {
            message: format!("Failed to initialize conversion engine: {e}"),
        })?;

        info!(augmentation = %augmentation.describe(), "Conversion service initialized");

        Ok(Self {
            config,
            db,
            queue,
            augmentation,
            sync_engine,
            sync_slot: Semaphore::new(1),
        })
    }

    /// How long a cancel waits for the worker to let go of the job
    fn cancel_wait(&self) -> Duration {
        self.config.jobs.cancel_grace() + CANCEL_WAIT_SLACK
    }

    pub fn store_connected(&self) -> bool {
        self.db.ping()
    }
}

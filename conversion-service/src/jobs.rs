//! Asynchronous job orchestration.
//!
//! Submissions become [`JobRecord`]s in the result store plus a message on
//! the [`TaskQueue`]. A [`WorkerPool`] drains the queue, one job per scarce
//! resource unit, and writes every state transition back to the store.

mod cancellation;
mod pool;
mod progress;
mod queue;
mod record;
mod retry;
mod sweeper;
mod worker;

pub use cancellation::{CancellationRegistry, InflightGuard};
pub use pool::WorkerPool;
pub use progress::{ProgressReporter, ProgressWriter};
pub use queue::{JobPayload, Revocation, TaskQueue};
pub use record::{JobError, JobErrorKind, JobRecord, JobStatus, ProgressUpdate, TransitionError};
pub use retry::RetryPolicy;
pub use sweeper::spawn_ttl_sweeper;
pub use worker::{Worker, WorkerExit, WorkerSettings};

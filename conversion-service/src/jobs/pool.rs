//! Worker pool supervision.
//!
//! One supervisor task per worker slot, and each slot stands for one unit of
//! the scarce resource: there are never more slots than resource units, and
//! a slot runs one job at a time. Inside a slot, worker generations come and
//! go: a recycled or panicked worker is replaced with a fresh one built from
//! a new engine handle.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{TaskQueue, Worker, WorkerExit, WorkerSettings};
use crate::db::Database;
use crate::engine::EngineFactory;

const ENGINE_INIT_RETRY: Duration = Duration::from_secs(5);

struct Slot {
    id: usize,
    db: Arc<Database>,
    queue: Arc<TaskQueue>,
    factory: Arc<dyn EngineFactory>,
    settings: WorkerSettings,
    alive: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

pub struct WorkerPool {
    shutdown: CancellationToken,
    alive: Arc<AtomicUsize>,
    slots: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `min(concurrency, resource_units)` supervised worker slots
    pub fn start(
        db: Arc<Database>,
        queue: Arc<TaskQueue>,
        factory: Arc<dyn EngineFactory>,
        settings: WorkerSettings,
        concurrency: usize,
        resource_units: usize,
    ) -> Self {
        let resource_units = resource_units.max(1);
        let slots = concurrency.clamp(1, resource_units);
        let alive = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let handles = (0..slots)
            .map(|id| {
                let slot = Slot {
                    id,
                    db: db.clone(),
                    queue: queue.clone(),
                    factory: factory.clone(),
                    settings: settings.clone(),
                    alive: alive.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(supervise(slot))
            })
            .collect();

        info!(workers = slots, resource_units, "Worker pool started");

        Self {
            shutdown,
            alive,
            slots,
            handles: Mutex::new(handles),
        }
    }

    /// Workers currently running a generation (idle or busy)
    pub fn workers_alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.slots
    }

    /// Stop accepting jobs and wait for workers to finish their current one
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker supervisor failed");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn supervise(slot: Slot) {
    let mut generation = 0u64;
    while !slot.shutdown.is_cancelled() {
        let engine = match slot.factory.create() {
            Ok(engine) => engine,
            Err(e) => {
                error!(worker = slot.id, error = %e, "Failed to initialize conversion engine");
                tokio::select! {
                    _ = slot.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ENGINE_INIT_RETRY) => continue,
                }
            }
        };

        let worker = Worker::new(
            slot.id,
            slot.db.clone(),
            slot.queue.clone(),
            engine,
            slot.settings.clone(),
        );

        slot.alive.fetch_add(1, Ordering::SeqCst);
        let exit = tokio::spawn(worker.run(slot.shutdown.clone())).await;
        slot.alive.fetch_sub(1, Ordering::SeqCst);

        match exit {
            Ok(WorkerExit::Shutdown) => break,
            Ok(WorkerExit::Recycle) => {
                info!(worker = slot.id, generation, "Starting fresh worker generation");
            }
            Err(e) => {
                error!(worker = slot.id, generation, error = %e, "Worker crashed, replacing it");
            }
        }
        generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{ScriptedEngine, factory};
    use crate::engine::{
        ConversionEngine, ConversionOptions, ConversionOutput, ConversionRequest, EngineError,
    };
    use crate::jobs::{JobPayload, JobRecord, JobStatus, ProgressReporter, RetryPolicy};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;

    fn settings(max_jobs_per_worker: u32) -> WorkerSettings {
        WorkerSettings {
            result_ttl: Duration::from_secs(3600),
            soft_time_limit: Duration::from_secs(5),
            hard_time_limit: Duration::from_secs(10),
            cancel_grace: Duration::from_millis(100),
            max_jobs_per_worker,
            retry: RetryPolicy::fixed(Duration::from_millis(10)),
        }
    }

    fn setup(lease: Duration) -> (Arc<Database>, Arc<TaskQueue>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let queue = Arc::new(TaskQueue::new(db.clone(), lease, Duration::from_millis(5)));
        (db, queue)
    }

    fn submit(db: &Database, queue: &TaskQueue, job_id: &str) {
        db.insert_job(&JobRecord::new(job_id, "doc.pdf", 3, Utc::now()))
            .unwrap();
        queue
            .enqueue(&JobPayload::new(job_id, "doc.pdf", b"%PDF", ConversionOptions::default()))
            .unwrap();
    }

    async fn wait_all_terminal(db: &Database, ids: &[&str]) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = ids.iter().all(|id| {
                    db.get_job(id, Utc::now())
                        .unwrap()
                        .is_some_and(|job| job.is_terminal())
                });
                if done {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_worker_count_bounded_by_resources() {
        let (db, queue) = setup(Duration::from_secs(60));
        let engine = ScriptedEngine::new([]);
        let pool = WorkerPool::start(db, queue, factory(engine), settings(50), 4, 2);

        assert_eq!(pool.size(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.workers_alive(), 2);

        pool.shutdown().await;
        assert_eq!(pool.workers_alive(), 0);
    }

    #[tokio::test]
    async fn test_recycled_workers_get_fresh_engines() {
        let (db, queue) = setup(Duration::from_secs(60));
        let engine = ScriptedEngine::new([]);
        let created = Arc::new(AtomicUsize::new(0));
        let counting = {
            let created = created.clone();
            let engine = engine.clone();
            move || -> Result<Arc<dyn ConversionEngine>, EngineError> {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(engine.clone() as Arc<dyn ConversionEngine>)
            }
        };

        let ids = ["a", "b", "c"];
        for id in ids {
            submit(&db, &queue, id);
        }
        let pool = WorkerPool::start(db.clone(), queue, Arc::new(counting), settings(1), 1, 1);

        wait_all_terminal(&db, &ids).await;
        pool.shutdown().await;

        assert_eq!(engine.calls(), 3);
        // One generation per job, plus the one started after the last recycle
        assert!(created.load(Ordering::SeqCst) >= 3);
        for id in ids {
            assert_eq!(
                db.get_job(id, Utc::now()).unwrap().unwrap().status,
                JobStatus::Completed
            );
        }
    }

    /// Panics on its first call, converts normally afterwards
    struct PanicOnce {
        panicked: AtomicBool,
    }

    #[async_trait]
    impl ConversionEngine for PanicOnce {
        async fn convert(
            &self,
            _request: ConversionRequest,
            _progress: ProgressReporter,
            _cancel: CancellationToken,
        ) -> Result<ConversionOutput, EngineError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("engine crashed");
            }
            Ok(crate::engine::testing::output(1))
        }
    }

    #[tokio::test]
    async fn test_crashed_worker_is_replaced_and_job_redelivered() {
        // Short lease so the crashed worker's message comes back quickly
        let (db, queue) = setup(Duration::from_millis(50));
        submit(&db, &queue, "job-1");

        let engine = Arc::new(PanicOnce {
            panicked: AtomicBool::new(false),
        });
        let panic_factory = move || -> Result<Arc<dyn ConversionEngine>, EngineError> {
            Ok(engine.clone() as Arc<dyn ConversionEngine>)
        };
        let pool = WorkerPool::start(db.clone(), queue, Arc::new(panic_factory), settings(50), 1, 1);

        wait_all_terminal(&db, &["job-1"]).await;
        let job = db.get_job("job-1", Utc::now()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(pool.workers_alive(), 1);
        pool.shutdown().await;
    }
}

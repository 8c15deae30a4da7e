//! Worker pool and the borrowed-worker handle it lends out.
//!
//! A [`PooledWorker`] is handed out by [`WorkerPool::get_worker`] and gives its
//! worker back to the pool when it is dropped. Nothing has to be returned by
//! hand, and an early `?` can not leak a worker.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TaskReceipt, TaskResult, ThreadWorker, Worker};
use crate::error::DispatchError;
use crate::task::FileTask;

pub const WORKER_LIMIT_ENV: &str = "WORKERFS_WORKER_LIMIT";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of workers alive at once.
    pub worker_limit: usize,
    /// Worker threads are named `<prefix>-<n>`.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_limit: 8,
            thread_name_prefix: "workerfs-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// Defaults, with the worker limit overridden by `WORKERFS_WORKER_LIMIT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(WORKER_LIMIT_ENV) {
            match raw.parse::<usize>() {
                Ok(limit) if limit > 0 => config.worker_limit = limit,
                _ => warn!(
                    "{WORKER_LIMIT_ENV}={raw:?} is not a positive integer. Use default value: {}",
                    config.worker_limit
                ),
            }
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    /// Outstanding [`PooledWorker`] handles.
    pub borrowed: usize,
    /// Workers with nothing queued.
    pub idle: usize,
}

type ReleaseFn = Box<dyn FnOnce(Arc<dyn Worker>) + Send + Sync>;

/// One worker borrowed from a pool; returns itself when dropped.
pub struct PooledWorker {
    worker: Arc<dyn Worker>,
    release: Option<ReleaseFn>,
}

impl PooledWorker {
    /// Wraps `worker`; `release` runs exactly once, when this handle is dropped.
    pub fn new(
        worker: Arc<dyn Worker>,
        release: impl FnOnce(Arc<dyn Worker>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            worker,
            release: Some(Box::new(release)),
        }
    }

    /// A handle that belongs to no pool.
    pub fn detached(worker: Arc<dyn Worker>) -> Self {
        Self {
            worker,
            release: None,
        }
    }

    /// Like [`Worker::execute`], giving up with [`DispatchError::Cancelled`]
    /// once `cancellation` fires. A task the worker has not started yet is
    /// skipped.
    pub async fn execute_with(
        &self,
        task: FileTask,
        cancellation: &CancellationToken,
    ) -> TaskResult {
        let receipt = self.worker.submit(task, Some(cancellation.clone()));
        tokio::select! {
            biased;
            res = receipt => res,
            _ = cancellation.cancelled() => Err(DispatchError::Cancelled),
        }
    }
}

#[async_trait]
impl Worker for PooledWorker {
    fn submit(&self, task: FileTask, cancellation: Option<CancellationToken>) -> TaskReceipt {
        self.worker.submit(task, cancellation)
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    fn is_idle(&self) -> bool {
        self.worker.is_idle()
    }

    async fn shutdown(&self) {
        self.worker.shutdown().await
    }

    fn kill(&self) {
        self.worker.kill()
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.worker.clone());
        }
    }
}

struct Slot {
    id: usize,
    worker: Arc<dyn Worker>,
    borrowers: usize,
}

type WorkerFactory = dyn Fn(usize) -> io::Result<Arc<dyn Worker>> + Send + Sync;

struct PoolInner {
    config: PoolConfig,
    factory: Box<WorkerFactory>,
    slots: Mutex<Vec<Slot>>,
    running: AtomicBool,
    next_id: AtomicUsize,
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: usize) {
        let mut slots = self.slots();
        if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
            slot.borrowers = slot.borrowers.saturating_sub(1);
        }
    }
}

/// A bounded set of workers shared by every file handle opened through it.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// A pool of [`ThreadWorker`]s, spawned lazily on demand.
    pub fn new(config: PoolConfig) -> Self {
        let prefix = config.thread_name_prefix.clone();
        Self::with_factory(config, move |id| {
            let worker = ThreadWorker::spawn(format!("{prefix}-{id}"))?;
            Ok(Arc::new(worker) as Arc<dyn Worker>)
        })
    }

    pub fn with_factory(
        config: PoolConfig,
        factory: impl Fn(usize) -> io::Result<Arc<dyn Worker>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(factory),
                slots: Mutex::new(Vec::new()),
                running: AtomicBool::new(true),
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrows a worker: an unborrowed one if any, else a new one while under
    /// the limit, else the one with the fewest borrowers.
    pub fn get_worker(&self) -> Result<PooledWorker, DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::worker("worker pool is shut down"));
        }
        let limit = self.inner.config.worker_limit.max(1);
        let mut slots = self.inner.slots();
        slots.retain(|slot| {
            let alive = slot.worker.is_running();
            if !alive {
                debug!("dropping stopped worker {} from pool", slot.id);
            }
            alive
        });

        let index = match slots.iter().position(|s| s.borrowers == 0) {
            Some(i) => i,
            None if slots.len() < limit => {
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                let worker = (self.inner.factory)(id).map_err(|e| {
                    DispatchError::worker(format!("failed to spawn worker: {e}"))
                })?;
                slots.push(Slot {
                    id,
                    worker,
                    borrowers: 0,
                });
                slots.len() - 1
            }
            None => slots
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.borrowers)
                .map(|(i, _)| i)
                .ok_or_else(|| DispatchError::worker("worker pool has no workers"))?,
        };

        let slot = &mut slots[index];
        slot.borrowers += 1;
        let id = slot.id;
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        Ok(PooledWorker::new(slot.worker.clone(), move |_| {
            if let Some(pool) = pool.upgrade() {
                pool.release(id);
            }
        }))
    }

    /// Runs one task on a borrowed worker and gives the worker back.
    pub async fn enqueue(&self, task: FileTask) -> TaskResult {
        let worker = self.get_worker()?;
        worker.execute(task).await
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.inner.slots();
        PoolStats {
            workers: slots.len(),
            borrowed: slots.iter().map(|s| s.borrowers).sum(),
            idle: slots.iter().filter(|s| s.worker.is_idle()).count(),
        }
    }

    fn drain(&self) -> Vec<Arc<dyn Worker>> {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner
            .slots()
            .drain(..)
            .map(|slot| slot.worker)
            .collect()
    }

    /// Stops lending and shuts every worker down once its queue drains.
    pub async fn shutdown(&self) {
        let workers = self.drain();
        info!("shutting down worker pool ({} workers)", workers.len());
        join_all(workers.iter().map(|w| w.shutdown())).await;
    }

    pub fn kill(&self) {
        let workers = self.drain();
        warn!("killing worker pool ({} workers)", workers.len());
        for worker in workers {
            worker.kill();
        }
    }
}

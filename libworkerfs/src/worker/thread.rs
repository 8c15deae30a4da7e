//! Worker backed by a dedicated OS thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::{io, thread};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Job, TaskReceipt, Worker};
use crate::error::DispatchError;
use crate::task::{DescriptorTable, FileTask};

#[derive(Default)]
struct WorkerState {
    running: AtomicBool,
    killed: AtomicBool,
    /// Jobs queued or running.
    pending: AtomicUsize,
}

/// Runs tasks one at a time on its own thread and owns every descriptor those
/// tasks open. Descriptors still open when the thread exits are closed then.
pub struct ThreadWorker {
    name: String,
    state: Arc<WorkerState>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadWorker {
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let state = Arc::new(WorkerState::default());
        state.running.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let thread_state = state.clone();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(thread_name, rx, thread_state))?;
        debug!("spawned file worker {name}");

        Ok(Self {
            name,
            state,
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn take_sender(&self) -> Option<mpsc::UnboundedSender<Job>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn run_loop(name: String, mut rx: mpsc::UnboundedReceiver<Job>, state: Arc<WorkerState>) {
    let mut table = DescriptorTable::new();
    while let Some(job) = rx.blocking_recv() {
        if state.killed.load(Ordering::SeqCst) {
            // dropping the job fails its receipt
            state.pending.fetch_sub(1, Ordering::SeqCst);
            continue;
        }
        job.run(&mut table, || {
            state.pending.fetch_sub(1, Ordering::SeqCst);
        });
    }
    state.running.store(false, Ordering::SeqCst);
    if !table.is_empty() {
        debug!("file worker {name} exiting with {} open descriptors", table.len());
    }
    info!("file worker {name} stopped");
}

#[async_trait]
impl Worker for ThreadWorker {
    fn submit(&self, task: FileTask, cancellation: Option<CancellationToken>) -> TaskReceipt {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sender.as_ref() else {
            return TaskReceipt::ready(Err(DispatchError::worker(format!(
                "worker {} is not running",
                self.name
            ))));
        };
        let (job, receipt) = Job::new(task, cancellation);
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            return TaskReceipt::ready(Err(DispatchError::worker(format!(
                "worker {} exited",
                self.name
            ))));
        }
        receipt
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst) && !self.state.killed.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        self.state.pending.load(Ordering::SeqCst) == 0
    }

    async fn shutdown(&self) {
        // closing the channel lets the thread drain what is queued and exit
        drop(self.take_sender());
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let name = self.name.clone();
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!("file worker {name} panicked"),
                Err(e) => warn!("failed to join file worker {name}: {e}"),
            }
        }
    }

    fn kill(&self) {
        self.state.killed.store(true, Ordering::SeqCst);
        drop(self.take_sender());
        info!("file worker {} killed", self.name);
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        // detach: the thread finishes queued jobs and exits on its own
        drop(self.take_sender());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Whence;
    use crate::task::TaskOutput;
    use crate::util::open_mode::OpenMode;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ordered");
        let worker = ThreadWorker::spawn("test-worker").unwrap();
        assert!(worker.is_running());

        let opened = worker
            .execute(FileTask::open(&path, OpenMode::parse("w+").unwrap()))
            .await
            .unwrap();
        let id = match opened {
            TaskOutput::Opened { id, .. } => id,
            other => panic!("unexpected output {other:?}"),
        };

        // 不等待逐个完成，直接连续提交
        let receipts: Vec<_> = (0..16u8)
            .map(|i| worker.submit(FileTask::write(id, Bytes::from(vec![i])), None))
            .collect();
        for r in receipts {
            assert_eq!(r.await.unwrap(), TaskOutput::Written(1));
        }
        worker.execute(FileTask::seek(id, 0, Whence::Set)).await.unwrap();
        let data = worker.execute(FileTask::read(id, 64)).await.unwrap();
        assert_eq!(
            data,
            TaskOutput::Data(Some(Bytes::from((0..16u8).collect::<Vec<_>>())))
        );
        assert!(worker.is_idle());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let worker = ThreadWorker::spawn("test-shutdown").unwrap();
        worker.shutdown().await;
        assert!(!worker.is_running());

        let tmp = tempfile::tempdir().unwrap();
        let res = worker
            .execute(FileTask::open(tmp.path().join("x"), OpenMode::parse("w").unwrap()))
            .await;
        assert!(matches!(res, Err(DispatchError::Worker(_))));
        // 重复 shutdown 无副作用
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_kill_marks_worker_stopped() {
        let worker = ThreadWorker::spawn("test-kill").unwrap();
        worker.kill();
        assert!(!worker.is_running());
        let tmp = tempfile::tempdir().unwrap();
        let res = worker
            .execute(FileTask::open(tmp.path().join("x"), OpenMode::parse("w").unwrap()))
            .await;
        assert!(matches!(res, Err(DispatchError::Worker(_))));
    }
}

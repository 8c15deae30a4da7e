//! Workers: execution contexts where blocking file calls actually run.
//!
//! Submodules:
//! - `thread`: a worker backed by one dedicated OS thread
//! - `pool`: the worker pool and the borrowed-worker handle returned from it
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DispatchError;
use crate::task::{DescriptorTable, FileTask, TaskOutput};

pub mod pool;
pub mod thread;

pub use pool::{PoolConfig, PoolStats, PooledWorker, WorkerPool};
pub use thread::ThreadWorker;

pub type TaskResult = Result<TaskOutput, DispatchError>;

/// An execution context that runs [`FileTask`]s in submission order.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Queues `task` without waiting for it. Tasks submitted to one worker run
    /// in the order they were submitted.
    fn submit(&self, task: FileTask, cancellation: Option<CancellationToken>) -> TaskReceipt;

    async fn execute(&self, task: FileTask) -> TaskResult {
        self.submit(task, None).await
    }

    fn is_running(&self) -> bool;

    /// True when no task is queued or running.
    fn is_idle(&self) -> bool;

    /// Stops accepting tasks and waits for the queued ones to finish.
    async fn shutdown(&self);

    /// Stops immediately; queued tasks fail with [`DispatchError::Worker`].
    fn kill(&self);
}

/// A task travelling to a worker together with its reply channel.
pub struct Job {
    task: FileTask,
    cancellation: Option<CancellationToken>,
    reply: oneshot::Sender<TaskResult>,
}

impl Job {
    pub fn new(task: FileTask, cancellation: Option<CancellationToken>) -> (Self, TaskReceipt) {
        let (reply, rx) = oneshot::channel();
        let job = Self {
            task,
            cancellation,
            reply,
        };
        (job, TaskReceipt::waiting(rx))
    }

    pub fn task(&self) -> &FileTask {
        &self.task
    }

    /// Runs the task against `table` and sends the outcome back, calling
    /// `finished` in between. A job whose token was cancelled before it started
    /// is answered without running.
    pub fn run(self, table: &mut DescriptorTable, finished: impl FnOnce()) {
        let Job {
            task,
            cancellation,
            reply,
        } = self;
        let operation = task.operation.name();
        let result = if cancellation.is_some_and(|c| c.is_cancelled()) {
            Err(DispatchError::Cancelled)
        } else {
            task.run(table).map_err(DispatchError::Task)
        };
        finished();
        if reply.send(result).is_err() {
            debug!("{operation} task finished after its caller went away");
        }
    }

    /// Answers the job with `err` without running it.
    pub fn fail(self, err: DispatchError) {
        let _ = self.reply.send(Err(err));
    }
}

enum ReceiptState {
    Waiting(oneshot::Receiver<TaskResult>),
    Ready(Option<TaskResult>),
}

/// Resolves to the outcome of a submitted task.
pub struct TaskReceipt {
    state: ReceiptState,
}

impl TaskReceipt {
    fn waiting(rx: oneshot::Receiver<TaskResult>) -> Self {
        Self {
            state: ReceiptState::Waiting(rx),
        }
    }

    /// A receipt that is already resolved, used when submission itself failed.
    pub fn ready(result: TaskResult) -> Self {
        Self {
            state: ReceiptState::Ready(Some(result)),
        }
    }
}

impl Future for TaskReceipt {
    type Output = TaskResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            ReceiptState::Waiting(rx) => Pin::new(rx).poll(cx).map(|res| {
                res.unwrap_or_else(|_| {
                    Err(DispatchError::worker("worker exited before replying"))
                })
            }),
            ReceiptState::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(DispatchError::worker("task receipt polled after completion"))
            })),
        }
    }
}

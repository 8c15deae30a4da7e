//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, TaskFailure};
use crate::task::{DescriptorTable, FileTask};
use crate::worker::{Job, TaskReceipt, Worker};

/// A worker that runs tasks on the calling thread, either as soon as they are
/// submitted (`auto`) or only when the test calls [`ManualWorker::complete_next`].
pub(crate) struct ManualWorker {
    auto: AtomicBool,
    running: AtomicBool,
    queue: Mutex<VecDeque<Job>>,
    table: Mutex<DescriptorTable>,
    submitted: Mutex<Vec<&'static str>>,
    fail_next: Mutex<Option<TaskFailure>>,
}

impl ManualWorker {
    fn build(auto: bool) -> Arc<Self> {
        Arc::new(Self {
            auto: AtomicBool::new(auto),
            running: AtomicBool::new(true),
            queue: Mutex::new(VecDeque::new()),
            table: Mutex::new(DescriptorTable::new()),
            submitted: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        })
    }

    pub(crate) fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub(crate) fn auto() -> Arc<Self> {
        Self::build(true)
    }

    pub(crate) fn set_auto(&self, auto: bool) {
        self.auto.store(auto, Ordering::SeqCst);
    }

    /// Operation names in submission order.
    pub(crate) fn submitted(&self) -> Vec<&'static str> {
        self.submitted.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, operation: &str) -> usize {
        self.submitted().iter().filter(|op| **op == operation).count()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub(crate) fn open_descriptors(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    /// The next task to run fails with `failure` instead of running.
    pub(crate) fn fail_next(&self, failure: TaskFailure) {
        *self.fail_next.lock().unwrap() = Some(failure);
    }

    pub(crate) fn complete_next(&self) -> bool {
        let job = self.queue.lock().unwrap().pop_front();
        match job {
            Some(job) => {
                self.run(job);
                true
            }
            None => false,
        }
    }

    pub(crate) fn complete_all(&self) {
        while self.complete_next() {}
    }

    fn run(&self, job: Job) {
        if let Some(failure) = self.fail_next.lock().unwrap().take() {
            job.fail(DispatchError::Task(failure));
            return;
        }
        let mut table = self.table.lock().unwrap();
        job.run(&mut table, || {});
    }
}

#[async_trait]
impl Worker for ManualWorker {
    fn submit(&self, task: FileTask, cancellation: Option<CancellationToken>) -> TaskReceipt {
        if !self.running.load(Ordering::SeqCst) {
            return TaskReceipt::ready(Err(DispatchError::worker("manual worker stopped")));
        }
        self.submitted.lock().unwrap().push(task.operation.name());
        let (job, receipt) = Job::new(task, cancellation);
        if self.auto.load(Ordering::SeqCst) {
            self.run(job);
        } else {
            self.queue.lock().unwrap().push_back(job);
        }
        receipt
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.complete_all();
    }

    fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
        // dropped jobs fail their receipts
        self.queue.lock().unwrap().clear();
    }
}

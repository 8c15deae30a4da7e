//! File handle whose blocking calls run on a borrowed pool worker.
//!
//! The handle keeps only bookkeeping (position, size, what is in flight); the
//! descriptor itself lives in the worker's table. At most one read or seek is
//! outstanding at a time, or any number of writes (a truncate counts as one),
//! pipelined on the worker in submission order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{File, PendingWrite, Whence, joined};
use crate::error::{DispatchError, FileError};
use crate::task::{FileTask, RemoteId, TaskOutput};
use crate::util::open_mode::OpenMode;
use crate::worker::{PooledWorker, TaskReceipt, Worker};

const READ_FAILED: &str = "reading from the file failed";
const WRITE_FAILED: &str = "writing to the file failed";
const SEEK_FAILED: &str = "seeking in the file failed";
const TRUNCATE_FAILED: &str = "truncating the file failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Idle,
    /// One read or seek outstanding.
    Exclusive,
    /// Writes and truncates outstanding; never zero.
    Writing(usize),
}

#[derive(Debug)]
struct HandleState {
    remote_id: Option<RemoteId>,
    position: u64,
    size: u64,
    activity: Activity,
    writable: bool,
}

impl HandleState {
    fn open_id(&self) -> Result<RemoteId, FileError> {
        self.remote_id.ok_or(FileError::CLOSED)
    }

    fn writable_id(&self) -> Result<RemoteId, FileError> {
        let id = self.open_id()?;
        if self.writable {
            Ok(id)
        } else {
            Err(FileError::NOT_WRITABLE)
        }
    }

    fn pending_writes(&self) -> usize {
        match self.activity {
            Activity::Writing(n) => n,
            _ => 0,
        }
    }

    fn finish_one(&mut self) {
        self.activity = match self.activity {
            Activity::Writing(n) if n > 1 => Activity::Writing(n - 1),
            _ => Activity::Idle,
        };
    }

    fn advance(&mut self, by: u64) {
        self.position += by;
        self.size = self.size.max(self.position);
    }
}

type SharedState = Arc<Mutex<HandleState>>;

fn lock(state: &Mutex<HandleState>) -> MutexGuard<'_, HandleState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks one operation in flight; the handle's activity is stepped back when
/// this is completed or dropped, whichever comes first.
struct InFlight {
    state: SharedState,
    armed: bool,
}

impl InFlight {
    fn new(state: &SharedState) -> Self {
        Self {
            state: state.clone(),
            armed: true,
        }
    }

    /// Applies `update` and releases the slot in the same critical section.
    fn complete<T>(mut self, update: impl FnOnce(&mut HandleState) -> T) -> T {
        self.armed = false;
        let mut state = lock(&self.state);
        let out = update(&mut state);
        state.finish_one();
        out
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.state).finish_one();
        }
    }
}

fn unexpected(context: &'static str, output: TaskOutput) -> FileError {
    FileError::stream(
        context,
        DispatchError::worker(format!("unexpected worker reply {output:?}")),
    )
}

fn current_runtime(context: &'static str) -> Result<Handle, FileError> {
    Handle::try_current()
        .map_err(|e| FileError::stream(context, DispatchError::worker(e.to_string())))
}

/// Waits for the worker's reply on a task of its own and applies it to the
/// handle, so the bookkeeping follows the remote descriptor even after the
/// caller stops waiting. A failed or skipped task releases the slot without
/// touching position or size.
fn settle_on<T, F>(
    runtime: &Handle,
    receipt: TaskReceipt,
    guard: InFlight,
    context: &'static str,
    apply: F,
) -> JoinHandle<Result<T, FileError>>
where
    T: Send + 'static,
    F: FnOnce(&mut HandleState, TaskOutput) -> Result<T, FileError> + Send + 'static,
{
    runtime.spawn(async move {
        match receipt.await {
            Ok(output) => guard.complete(|state| apply(state, output)),
            Err(e) => Err(FileError::stream(context, e)),
        }
    })
}

fn apply_read(state: &mut HandleState, output: TaskOutput) -> Result<Option<Bytes>, FileError> {
    match output {
        TaskOutput::Data(data) => {
            if let Some(bytes) = &data {
                state.advance(bytes.len() as u64);
            }
            Ok(data)
        }
        other => Err(unexpected(READ_FAILED, other)),
    }
}

type CloseFuture = Shared<BoxFuture<'static, Result<(), FileError>>>;

pub struct ParallelFile {
    worker: PooledWorker,
    state: SharedState,
    path: PathBuf,
    mode: OpenMode,
    closing: Mutex<Option<CloseFuture>>,
}

impl ParallelFile {
    /// Opens `path` on `worker` and keeps the worker for the life of the handle.
    pub async fn open(
        worker: PooledWorker,
        path: impl Into<PathBuf>,
        mode: OpenMode,
    ) -> Result<Self, FileError> {
        let path = path.into();
        match worker.execute(FileTask::open(&path, mode.clone())).await {
            Ok(TaskOutput::Opened { id, size }) => Ok(Self::new(worker, id, path, mode, size)),
            Ok(other) => Err(unexpected("opening the file failed", other)),
            Err(e) => Err(FileError::stream("opening the file failed", e)),
        }
    }

    pub(crate) fn new(
        worker: PooledWorker,
        id: RemoteId,
        path: PathBuf,
        mode: OpenMode,
        size: u64,
    ) -> Self {
        let position = if mode.is_append() { size } else { 0 };
        let state = HandleState {
            remote_id: Some(id),
            position,
            size,
            activity: Activity::Idle,
            writable: mode.is_writable(),
        };
        Self {
            worker,
            state: Arc::new(Mutex::new(state)),
            path,
            mode,
            closing: Mutex::new(None),
        }
    }

    pub fn remote_id(&self) -> Option<RemoteId> {
        lock(&self.state).remote_id
    }

    pub fn size(&self) -> u64 {
        lock(&self.state).size
    }

    /// Writes submitted and not yet completed, truncates included.
    pub fn pending_writes(&self) -> usize {
        lock(&self.state).pending_writes()
    }

    /// True while any read, seek, write or truncate is outstanding.
    pub fn is_busy(&self) -> bool {
        lock(&self.state).activity != Activity::Idle
    }

    /// Like [`File::read`], but stops waiting once `cancellation` fires.
    ///
    /// The read stays outstanding until the worker answers: one the worker had
    /// not started is skipped and leaves the position alone, one it already
    /// ran still moves the position by what it read.
    pub async fn read_with(
        &self,
        length: usize,
        cancellation: &CancellationToken,
    ) -> Result<Option<Bytes>, FileError> {
        let completion = self.start_read(length, Some(cancellation.clone()))?;
        tokio::select! {
            biased;
            res = completion => joined(res, READ_FAILED),
            _ = cancellation.cancelled() => {
                Err(FileError::stream(READ_FAILED, DispatchError::Cancelled))
            }
        }
    }

    fn begin_exclusive(&self) -> Result<(RemoteId, InFlight), FileError> {
        let mut state = lock(&self.state);
        let id = state.open_id()?;
        if state.activity != Activity::Idle {
            return Err(FileError::PendingOperation);
        }
        state.activity = Activity::Exclusive;
        Ok((id, InFlight::new(&self.state)))
    }

    fn start_read(
        &self,
        length: usize,
        cancellation: Option<CancellationToken>,
    ) -> Result<JoinHandle<Result<Option<Bytes>, FileError>>, FileError> {
        let runtime = current_runtime(READ_FAILED)?;
        let (id, guard) = self.begin_exclusive()?;
        let receipt = self.worker.submit(FileTask::read(id, length), cancellation);
        Ok(settle_on(&runtime, receipt, guard, READ_FAILED, apply_read))
    }

    fn closing(&self) -> MutexGuard<'_, Option<CloseFuture>> {
        self.closing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_close(&self) -> CloseFuture {
        let id = {
            let mut state = lock(&self.state);
            state.writable = false;
            state.remote_id.take()
        };
        let fut: BoxFuture<'static, Result<(), FileError>> = match id {
            Some(id) if self.worker.is_running() => {
                let receipt = self.worker.submit(FileTask::close(id), None);
                async move {
                    receipt
                        .await
                        .map(|_| ())
                        .map_err(|e| FileError::stream("closing the file failed", e))
                }
                .boxed()
            }
            Some(id) => {
                debug!(
                    "worker for {} is gone, descriptor {id} went with it",
                    self.path.display()
                );
                future::ready(Ok(())).boxed()
            }
            None => future::ready(Ok(())).boxed(),
        };
        fut.shared()
    }
}

#[async_trait]
impl File for ParallelFile {
    async fn read(&self, length: usize) -> Result<Option<Bytes>, FileError> {
        let completion = self.start_read(length, None)?;
        joined(completion.await, READ_FAILED)
    }

    fn write(&self, data: Bytes) -> Result<PendingWrite, FileError> {
        let runtime = current_runtime(WRITE_FAILED)?;

        let (receipt, guard) = {
            let mut state = lock(&self.state);
            let id = state.writable_id()?;
            state.activity = match state.activity {
                Activity::Exclusive => return Err(FileError::PendingOperation),
                Activity::Idle => Activity::Writing(1),
                Activity::Writing(n) => Activity::Writing(n + 1),
            };
            // submitted under the lock so the worker sees writes in call order
            let receipt = self.worker.submit(FileTask::write(id, data), None);
            (receipt, InFlight::new(&self.state))
        };

        let handle = settle_on(&runtime, receipt, guard, WRITE_FAILED, |state, output| {
            match output {
                TaskOutput::Written(n) => {
                    state.advance(n as u64);
                    Ok(())
                }
                other => Err(unexpected(WRITE_FAILED, other)),
            }
        });
        Ok(PendingWrite::new(handle))
    }

    async fn end(&self, data: Bytes) -> Result<(), FileError> {
        let pending = self.write(data);
        lock(&self.state).writable = false;
        let written = match pending {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!("discarding final write error on {}: {e}", self.path.display());
        }
        self.close().await
    }

    async fn close(&self) -> Result<(), FileError> {
        let fut = {
            let mut closing = self.closing();
            match closing.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let fut = self.start_close();
                    *closing = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }

    async fn truncate(&self, size: u64) -> Result<(), FileError> {
        let runtime = current_runtime(TRUNCATE_FAILED)?;
        let (id, guard) = {
            let mut state = lock(&self.state);
            let id = state.writable_id()?;
            if state.activity != Activity::Idle {
                return Err(FileError::PendingOperation);
            }
            state.activity = Activity::Writing(1);
            (id, InFlight::new(&self.state))
        };
        let receipt = self.worker.submit(FileTask::truncate(id, size), None);
        let completion = settle_on(&runtime, receipt, guard, TRUNCATE_FAILED, move |state, output| {
            match output {
                TaskOutput::Done => {
                    state.size = size;
                    Ok(())
                }
                other => Err(unexpected(TRUNCATE_FAILED, other)),
            }
        });
        joined(completion.await, TRUNCATE_FAILED)
    }

    async fn seek(&self, offset: i64, whence: Whence) -> Result<u64, FileError> {
        lock(&self.state).open_id()?;
        if whence == Whence::Set && offset < 0 {
            return Err(FileError::InvalidArgument(format!(
                "cannot seek to negative offset {offset}"
            )));
        }
        let runtime = current_runtime(SEEK_FAILED)?;
        let (id, guard) = self.begin_exclusive()?;
        let receipt = self.worker.submit(FileTask::seek(id, offset, whence), None);
        let completion = settle_on(&runtime, receipt, guard, SEEK_FAILED, |state, output| {
            match output {
                TaskOutput::Position(position) => {
                    state.position = position;
                    state.size = state.size.max(position);
                    Ok(position)
                }
                other => Err(unexpected(SEEK_FAILED, other)),
            }
        });
        joined(completion.await, SEEK_FAILED)
    }

    fn tell(&self) -> u64 {
        lock(&self.state).position
    }

    /// Judged from local bookkeeping only. A file changed by someone else
    /// since the last completed operation is not noticed.
    fn eof(&self) -> bool {
        let state = lock(&self.state);
        state.pending_writes() == 0 && state.position >= state.size
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn mode(&self) -> &OpenMode {
        &self.mode
    }

    fn is_readable(&self) -> bool {
        !self.is_closed() && self.mode.is_readable()
    }

    fn is_writable(&self) -> bool {
        let state = lock(&self.state);
        state.remote_id.is_some() && state.writable && self.mode.is_writable()
    }

    fn is_seekable(&self) -> bool {
        !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).remote_id.is_none()
    }
}

impl fmt::Debug for ParallelFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelFile")
            .field("path", &self.path)
            .field("mode", &self.mode.as_str())
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl Drop for ParallelFile {
    fn drop(&mut self) {
        if self
            .closing
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return;
        }
        let Some(id) = lock(&self.state).remote_id.take() else {
            return;
        };
        if !self.worker.is_running() {
            return;
        }
        // the worker runs the close whether or not anyone awaits the receipt
        let receipt = self.worker.submit(FileTask::close(id), None);
        if let Ok(runtime) = Handle::try_current() {
            let path = self.path.clone();
            runtime.spawn(async move {
                if let Err(e) = receipt.await {
                    warn!("failed to close dropped file {}: {e}", path.display());
                }
            });
        }
    }
}

use std::io;

use thiserror::Error;

/// A failure raised by the worker while running a task, e.g. a failing syscall.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({kind})")]
pub struct TaskFailure {
    pub kind: io::ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<io::Error> for TaskFailure {
    fn from(err: io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Why a task dispatched to a worker did not produce an output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    // The task reached the worker and failed there.
    #[error("task failed in worker: {0}")]
    Task(#[from] TaskFailure),

    // The worker could not be reached, or went away before replying.
    #[error("worker unavailable: {0}")]
    Worker(String),

    #[error("task was cancelled")]
    Cancelled,
}

impl DispatchError {
    pub(crate) fn worker(reason: impl Into<String>) -> Self {
        Self::Worker(reason.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileError {
    #[error("{0}")]
    Closed(&'static str),

    #[error("an operation is already pending on this file")]
    PendingOperation,

    #[error("{context}: {source}")]
    Stream {
        context: &'static str,
        #[source]
        source: DispatchError,
    },

    #[error("invalid whence value {0}; expected SET, CUR or END")]
    InvalidWhence(i32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl FileError {
    pub(crate) const CLOSED: Self = Self::Closed("the file has been closed");
    pub(crate) const NOT_WRITABLE: Self = Self::Closed("the file is no longer writable");

    pub(crate) fn stream(context: &'static str, source: DispatchError) -> Self {
        Self::Stream { context, source }
    }

    /// True when the worker reported that the target path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Stream {
                source: DispatchError::Task(TaskFailure {
                    kind: io::ErrorKind::NotFound,
                    ..
                }),
                ..
            }
        )
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache file error: {0}")]
    File(#[from] FileError),

    #[error("cache IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] bincode::Error),
}

//! Async file handle contract and its worker-backed implementation.
//!
//! Submodules:
//! - `parallel`: [`ParallelFile`], a handle whose calls run on a pooled worker
//! - `driver`: [`ParallelDriver`], opens handles and serves path utilities
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::task::{JoinError, JoinHandle};

use crate::error::{DispatchError, FileError};
use crate::util::open_mode::OpenMode;

pub mod driver;
pub mod parallel;

pub use driver::ParallelDriver;
pub use parallel::ParallelFile;

pub const DEFAULT_READ_LENGTH: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

impl TryFrom<i32> for Whence {
    type Error = FileError;

    /// Maps the C `SEEK_SET`/`SEEK_CUR`/`SEEK_END` values.
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Set),
            1 => Ok(Self::Current),
            2 => Ok(Self::End),
            other => Err(FileError::InvalidWhence(other)),
        }
    }
}

/// Outcome of a write that was accepted by the handle.
///
/// The write is already queued on the worker when this is returned, and its
/// bookkeeping completes whether or not this future is awaited.
pub struct PendingWrite {
    handle: JoinHandle<Result<(), FileError>>,
}

impl PendingWrite {
    pub(crate) fn new(handle: JoinHandle<Result<(), FileError>>) -> Self {
        Self { handle }
    }
}

impl Future for PendingWrite {
    type Output = Result<(), FileError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|res| joined(res, "writing to the file failed"))
    }
}

/// Outcome of a spawned completion task, with a panicked or aborted task
/// reported as a worker failure.
pub(crate) fn joined<T>(
    res: Result<Result<T, FileError>, JoinError>,
    context: &'static str,
) -> Result<T, FileError> {
    res.unwrap_or_else(|e| {
        Err(FileError::stream(
            context,
            DispatchError::worker(format!("completion task failed: {e}")),
        ))
    })
}

#[async_trait]
pub trait File: Send + Sync {
    /// Reads up to `length` bytes; `None` at end of stream.
    async fn read(&self, length: usize) -> Result<Option<Bytes>, FileError>;

    fn write(&self, data: Bytes) -> Result<PendingWrite, FileError>;

    /// Writes `data`, then closes the handle.
    async fn end(&self, data: Bytes) -> Result<(), FileError>;

    async fn close(&self) -> Result<(), FileError>;

    async fn truncate(&self, size: u64) -> Result<(), FileError>;

    /// Returns the new absolute position.
    async fn seek(&self, offset: i64, whence: Whence) -> Result<u64, FileError>;

    fn tell(&self) -> u64;

    fn eof(&self) -> bool;

    fn path(&self) -> &Path;

    fn mode(&self) -> &OpenMode;

    fn is_readable(&self) -> bool;

    fn is_writable(&self) -> bool;

    fn is_seekable(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Reads from the current position until end of stream.
    async fn read_all(&self) -> Result<Bytes, FileError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read(DEFAULT_READ_LENGTH).await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// Opens files and runs the few path-level calls file consumers need.
#[async_trait]
pub trait Filesystem: Send + Sync {
    type File: File;

    async fn open(&self, path: &Path, mode: &str) -> Result<Self::File, FileError>;

    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    async fn remove_file(&self, path: &Path) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whence_from_raw() {
        assert_eq!(Whence::try_from(0), Ok(Whence::Set));
        assert_eq!(Whence::try_from(1), Ok(Whence::Current));
        assert_eq!(Whence::try_from(2), Ok(Whence::End));
        assert_eq!(Whence::try_from(3), Err(FileError::InvalidWhence(3)));
        assert_eq!(Whence::try_from(-1), Err(FileError::InvalidWhence(-1)));
    }
}

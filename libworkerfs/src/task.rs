//! File tasks: inert descriptions of one blocking filesystem call.
//!
//! A task is built on the caller side, shipped to a worker and executed there
//! against the worker's [`DescriptorTable`]. The table owns the real OS file
//! descriptors; callers only ever see the [`RemoteId`] that names one of them.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::Bytes;

use crate::error::TaskFailure;
use crate::file::Whence;
use crate::util::open_mode::OpenMode;

/// Upper bound for the buffer preallocated by a read; larger reads grow on demand.
const MAX_READ_PREALLOC: usize = 1 << 20;

/// Identifier of an open descriptor living inside a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteId(u64);

impl RemoteId {
    pub fn get(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn for_test(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum FileOperation {
    Open { path: PathBuf, mode: OpenMode },
    Read { length: usize },
    Write { data: Bytes },
    Seek { offset: i64, whence: Whence },
    Truncate { size: u64 },
    Close,
}

impl FileOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Seek { .. } => "seek",
            Self::Truncate { .. } => "truncate",
            Self::Close => "close",
        }
    }
}

/// One filesystem call to run inside a worker.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub operation: FileOperation,
    /// Descriptor the call applies to; `None` only for `Open`.
    pub target: Option<RemoteId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Opened { id: RemoteId, size: u64 },
    /// `None` signals end of stream.
    Data(Option<Bytes>),
    Written(usize),
    Position(u64),
    Done,
}

impl FileTask {
    pub fn open(path: impl Into<PathBuf>, mode: OpenMode) -> Self {
        Self {
            operation: FileOperation::Open {
                path: path.into(),
                mode,
            },
            target: None,
        }
    }

    pub fn read(id: RemoteId, length: usize) -> Self {
        Self::on(id, FileOperation::Read { length })
    }

    pub fn write(id: RemoteId, data: Bytes) -> Self {
        Self::on(id, FileOperation::Write { data })
    }

    pub fn seek(id: RemoteId, offset: i64, whence: Whence) -> Self {
        Self::on(id, FileOperation::Seek { offset, whence })
    }

    pub fn truncate(id: RemoteId, size: u64) -> Self {
        Self::on(id, FileOperation::Truncate { size })
    }

    pub fn close(id: RemoteId) -> Self {
        Self::on(id, FileOperation::Close)
    }

    fn on(id: RemoteId, operation: FileOperation) -> Self {
        Self {
            operation,
            target: Some(id),
        }
    }

    /// Runs the blocking call. Must only be invoked on a worker context.
    pub fn run(self, table: &mut DescriptorTable) -> Result<TaskOutput, TaskFailure> {
        let FileTask { operation, target } = self;
        let target_id = || {
            target.ok_or_else(|| {
                TaskFailure::new(io::ErrorKind::InvalidInput, "task has no target descriptor")
            })
        };
        match operation {
            FileOperation::Open { path, mode } => {
                let file = mode.to_open_options().open(&path).map_err(|e| {
                    TaskFailure::new(
                        e.kind(),
                        format!("failed to open `{}` with mode `{mode}`: {e}", path.display()),
                    )
                })?;
                let size = file.metadata()?.len();
                let id = table.insert(file);
                Ok(TaskOutput::Opened { id, size })
            }
            FileOperation::Close => {
                let id = target_id()?;
                // dropping the File closes the descriptor
                table
                    .remove(id)
                    .map(|_| TaskOutput::Done)
                    .ok_or_else(|| unknown_descriptor(id))
            }
            op => {
                let id = target_id()?;
                let file = table.get_mut(id).ok_or_else(|| unknown_descriptor(id))?;
                run_on_descriptor(file, op)
            }
        }
    }
}

fn run_on_descriptor(file: &mut File, operation: FileOperation) -> Result<TaskOutput, TaskFailure> {
    match operation {
        FileOperation::Read { length } => {
            let mut buf = Vec::with_capacity(length.min(MAX_READ_PREALLOC));
            Read::take(&mut *file, length as u64).read_to_end(&mut buf)?;
            if buf.is_empty() {
                Ok(TaskOutput::Data(None))
            } else {
                Ok(TaskOutput::Data(Some(Bytes::from(buf))))
            }
        }
        FileOperation::Write { data } => {
            file.write_all(&data)?;
            Ok(TaskOutput::Written(data.len()))
        }
        FileOperation::Seek { offset, whence } => {
            let from = match whence {
                Whence::Set => SeekFrom::Start(u64::try_from(offset).map_err(|_| {
                    TaskFailure::new(
                        io::ErrorKind::InvalidInput,
                        format!("cannot seek to negative offset {offset}"),
                    )
                })?),
                Whence::Current => SeekFrom::Current(offset),
                Whence::End => SeekFrom::End(offset),
            };
            Ok(TaskOutput::Position(file.seek(from)?))
        }
        FileOperation::Truncate { size } => {
            file.set_len(size)?;
            Ok(TaskOutput::Done)
        }
        op @ (FileOperation::Open { .. } | FileOperation::Close) => Err(TaskFailure::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a descriptor operation", op.name()),
        )),
    }
}

fn unknown_descriptor(id: RemoteId) -> TaskFailure {
    TaskFailure::new(
        io::ErrorKind::NotFound,
        format!("no open descriptor {id} in this worker"),
    )
}

/// Open descriptors owned by one worker, keyed by the ids handed to callers.
#[derive(Debug, Default)]
pub struct DescriptorTable {
    files: HashMap<RemoteId, File>,
    next_id: u64,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, file: File) -> RemoteId {
        self.next_id += 1;
        let id = RemoteId(self.next_id);
        self.files.insert(id, file);
        id
    }

    fn get_mut(&mut self, id: RemoteId) -> Option<&mut File> {
        self.files.get_mut(&id)
    }

    fn remove(&mut self, id: RemoteId) -> Option<File> {
        self.files.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

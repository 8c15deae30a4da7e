pub mod cache;
pub mod error;
pub mod file;
pub mod sync;
pub mod task;
pub mod util;
pub mod worker;

// Test doubles (only compiled during tests)
#[cfg(test)]
pub(crate) mod testing;

// re-export selected public API
pub use cache::{CacheConfig, FileCache};
pub use error::{CacheError, DispatchError, FileError, TaskFailure};
pub use file::{
    DEFAULT_READ_LENGTH, File, Filesystem, ParallelDriver, ParallelFile, PendingWrite, Whence,
};
pub use sync::{KeyedLock, KeyedMutex, LocalKeyedMutex};
pub use task::{FileTask, RemoteId, TaskOutput};
pub use util::open_mode::OpenMode;
pub use worker::{PoolConfig, PoolStats, PooledWorker, ThreadWorker, Worker, WorkerPool};

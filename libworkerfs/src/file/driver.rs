use std::io;
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::{Filesystem, ParallelFile};
use crate::error::FileError;
use crate::util::open_mode::OpenMode;
use crate::worker::{PoolConfig, WorkerPool};

/// Opens [`ParallelFile`]s, each on a worker borrowed from one shared pool.
#[derive(Clone)]
pub struct ParallelDriver {
    pool: WorkerPool,
}

impl ParallelDriver {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn open_with(&self, path: &Path, mode: OpenMode) -> Result<ParallelFile, FileError> {
        let worker = self
            .pool
            .get_worker()
            .map_err(|e| FileError::stream("opening the file failed", e))?;
        debug!("opening {} with mode `{mode}`", path.display());
        ParallelFile::open(worker, path, mode).await
    }
}

impl Default for ParallelDriver {
    fn default() -> Self {
        Self::new(WorkerPool::new(PoolConfig::from_env()))
    }
}

#[async_trait]
impl Filesystem for ParallelDriver {
    type File = ParallelFile;

    async fn open(&self, path: &Path, mode: &str) -> Result<Self::File, FileError> {
        self.open_with(path, OpenMode::parse(mode)?).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

//! Key/value cache stored as one file per key.
//!
//! Entries carry an optional expiry and are checked lazily on [`FileCache::get`];
//! nothing sweeps expired entries in the background. Every operation holds the
//! key's lock from a [`KeyedMutex`] for its whole duration, so a `set` racing a
//! `get` on the same key is seen entirely before or entirely after it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::file::{File, Filesystem};
use crate::sync::{KeyedMutex, LocalKeyedMutex};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the shard directories.
    pub root: PathBuf,
    /// Extension of entry files.
    pub extension: String,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("workerfs-cache"),
            extension: "cache".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    /// Milliseconds since the UNIX epoch; `None` never expires.
    expires_at: Option<u64>,
    value: Vec<u8>,
}

impl CacheRecord {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub struct FileCache<F, M = LocalKeyedMutex> {
    config: CacheConfig,
    fs: F,
    mutex: M,
}

impl<F: Filesystem> FileCache<F> {
    pub fn new(fs: F, config: CacheConfig) -> Self {
        Self::with_mutex(fs, config, LocalKeyedMutex::new())
    }
}

impl<F: Filesystem, M: KeyedMutex> FileCache<F, M> {
    pub fn with_mutex(fs: F, config: CacheConfig, mutex: M) -> Self {
        Self { config, fs, mutex }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// `root/<h[0..2]>/<h[2..]>.<ext>` with `h` the hex SHA-256 of `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(key.as_bytes()));
        let (shard, rest) = hash.split_at(2);
        self.config
            .root
            .join(shard)
            .join(format!("{rest}.{}", self.config.extension))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let _lock = self.mutex.acquire(key).await;
        let path = self.entry_path(key);

        let file = match self.fs.open(&path, "r").await {
            Ok(file) => file,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw = file.read_all().await;
        if let Err(e) = file.close().await {
            debug!("failed to close cache entry {}: {e}", path.display());
        }
        let raw = raw?;

        let record: CacheRecord = match bincode::deserialize(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("removing unreadable cache entry {}: {e}", path.display());
                self.remove_entry(&path).await?;
                return Ok(None);
            }
        };
        if record.is_expired(now_millis()) {
            debug!("cache entry for {key:?} expired");
            self.remove_entry(&path).await?;
            return Ok(None);
        }
        Ok(Some(Bytes::from(record.value)))
    }

    /// Stores `value` under `key`, replacing any previous entry. A `ttl` of
    /// `None` or zero never expires.
    pub async fn set(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let record = CacheRecord {
            expires_at: ttl
                .filter(|ttl| !ttl.is_zero())
                .map(|ttl| {
                    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                    now_millis().saturating_add(millis)
                }),
            value: value.as_ref().to_vec(),
        };
        let encoded = bincode::serialize(&record)?;

        let _lock = self.mutex.acquire(key).await;
        let path = self.entry_path(key);
        if let Some(dir) = path.parent() {
            self.fs.create_dir_all(dir).await?;
        }

        let file = self.fs.open(&path, "w").await?;
        let written = match file.write(Bytes::from(encoded)) {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };
        let closed = file.close().await;
        written?;
        closed?;
        Ok(())
    }

    /// Removes the entry for `key`; a missing entry is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _lock = self.mutex.acquire(key).await;
        self.remove_entry(&self.entry_path(key)).await
    }

    async fn remove_entry(&self, path: &Path) -> Result<(), CacheError> {
        match self.fs.remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::ParallelDriver;
    use crate::worker::{PoolConfig, WorkerPool};

    fn cache(root: &Path) -> FileCache<ParallelDriver> {
        let driver = ParallelDriver::new(WorkerPool::new(PoolConfig {
            worker_limit: 2,
            ..PoolConfig::default()
        }));
        FileCache::new(driver, CacheConfig::new(root))
    }

    #[test]
    fn test_entry_path_layout() {
        let cache = FileCache::new(
            ParallelDriver::new(WorkerPool::new(PoolConfig::default())),
            CacheConfig::new("/var/cache/app"),
        );
        let hash = hex::encode(Sha256::digest(b"mykey"));
        let path = cache.entry_path("mykey");
        assert_eq!(
            path,
            Path::new("/var/cache/app")
                .join(&hash[..2])
                .join(format!("{}.cache", &hash[2..]))
        );
        assert_ne!(cache.entry_path("a"), cache.entry_path("b"));
    }

    #[test]
    fn test_record_expiry() {
        let forever = CacheRecord {
            expires_at: None,
            value: vec![],
        };
        assert!(!forever.is_expired(u64::MAX));
        let timed = CacheRecord {
            expires_at: Some(100),
            value: vec![],
        };
        assert!(!timed.is_expired(99));
        assert!(timed.is_expired(100));
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());

        assert_eq!(cache.get("mykey").await.unwrap(), None);
        cache
            .set("mykey", b"myvalue", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(
            cache.get("mykey").await.unwrap(),
            Some(Bytes::from_static(b"myvalue"))
        );

        cache.delete("mykey").await.unwrap();
        assert_eq!(cache.get("mykey").await.unwrap(), None);
        // deleting twice is fine
        cache.delete("mykey").await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        cache.set("foo", b"bar", Some(Duration::ZERO)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("foo").await.unwrap(), Some(Bytes::from_static(b"bar")));
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates_instead_of_wrapping() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        // ~584 million years; its millisecond count does not fit in a u64
        cache
            .set("k", b"v", Some(Duration::from_secs(18_446_744_073_709_552)))
            .await
            .unwrap();
        cache.set("max", b"v", Some(Duration::MAX)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(cache.get("max").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed_on_get() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        cache
            .set("foo", b"bar", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        let path = cache.entry_path("foo");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // expired entries stay on disk until read
        assert!(path.exists());
        assert_eq!(cache.get("foo").await.unwrap(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_expiry_and_value() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        cache
            .set("foo", b"a much longer first value", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        cache.set("foo", b"bar", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("foo").await.unwrap(), Some(Bytes::from_static(b"bar")));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_treated_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        let path = cache.entry_path("bad");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"\xff").unwrap();

        assert_eq!(cache.get("bad").await.unwrap(), None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_binary_and_empty_values_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(tmp.path());
        let binary: Vec<u8> = (0..=255).collect();
        cache.set("bin", &binary, None).await.unwrap();
        cache.set("empty", b"", None).await.unwrap();
        assert_eq!(cache.get("bin").await.unwrap(), Some(Bytes::from(binary)));
        assert_eq!(cache.get("empty").await.unwrap(), Some(Bytes::new()));
    }
}

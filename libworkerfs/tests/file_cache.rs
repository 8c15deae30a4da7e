use libworkerfs::{CacheConfig, FileCache, ParallelDriver, PoolConfig, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

fn cache(root: &std::path::Path) -> FileCache<ParallelDriver> {
    let driver = ParallelDriver::new(WorkerPool::new(PoolConfig {
        worker_limit: 4,
        ..PoolConfig::default()
    }));
    FileCache::new(driver, CacheConfig::new(root))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sets_on_one_key_never_interleave() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Arc::new(cache(tmp.path()));

    let values: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 4096 + i as usize]).collect();
    let mut tasks = Vec::new();
    for value in values.clone() {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            cache.set("shared", &value, None).await.unwrap();
            cache.get("shared").await.unwrap()
        }));
    }
    for task in tasks {
        let seen = task.await.unwrap().unwrap();
        // whatever was read must be one complete value
        assert!(values.iter().any(|v| v.as_slice() == seen.as_ref()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_are_independent() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Arc::new(cache(tmp.path()));

    let mut tasks = Vec::new();
    for i in 0..32 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let key = format!("key-{i}");
            cache.set(&key, key.as_bytes(), Some(Duration::from_secs(60))).await.unwrap();
            cache.get(&key).await.unwrap()
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let value = task.await.unwrap().unwrap();
        assert_eq!(value.as_ref(), format!("key-{i}").as_bytes());
    }
}

#[tokio::test]
async fn test_entry_expires_lazily() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = cache(tmp.path());

    cache.set("foo", "bar", Some(Duration::from_millis(10))).await.unwrap();
    assert!(cache.get("foo").await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.entry_path("foo").exists());
    assert_eq!(cache.get("foo").await.unwrap(), None);
    assert!(!cache.entry_path("foo").exists());
}

#[tokio::test]
async fn test_entry_is_not_returned_after_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = cache(tmp.path());
    cache.set("foo", "bar", None).await.unwrap();
    cache.delete("foo").await.unwrap();
    assert_eq!(cache.get("foo").await.unwrap(), None);
}

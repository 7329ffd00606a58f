//! Cache backends and the two-tier store.
//!
//! Two [`Backend`] implementations (in-memory map, sharded disk files) and
//! the [`TieredCache`] that layers an LRU tier over each, shares the encoded
//! value between them, and persists the disk tier's LRU order to an index
//! file so freshness survives restarts.

use crate::errors::{new_io_error, Result};
use crate::lru::{Backend, CacheMetadata, LruTier};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// In-memory byte store.
#[derive(Default)]
pub struct MemoryStore {
  values: StdMutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
  /// Create an empty store.
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait::async_trait]
impl Backend for MemoryStore {
  async fn set_value(&self, key: &str, value: &[u8]) -> Result<()> {
    self
      .values
      .lock()
      .expect("memory store poisoned")
      .insert(key.to_string(), value.to_vec());
    Ok(())
  }

  async fn get_value(&self, key: &str) -> Result<Vec<u8>> {
    self
      .values
      .lock()
      .expect("memory store poisoned")
      .get(key)
      .cloned()
      .ok_or_else(|| new_io_error(ErrorKind::NotFound, &format!("key {} not in memory", key)))
  }

  async fn has_value(&self, key: &str) -> bool {
    self
      .values
      .lock()
      .expect("memory store poisoned")
      .contains_key(key)
  }

  async fn delete_key(&self, key: &str) {
    self.values.lock().expect("memory store poisoned").remove(key);
  }

  async fn delete_all(&self) {
    self.values.lock().expect("memory store poisoned").clear();
  }
}

// Grouping of characters per shard directory.
const TRANSFORM_BLOCK_SIZE: usize = 2;
// Shard depth; two levels bounds any directory to 64^2 children.
const TRANSFORM_BLOCKS: usize = 2;

fn block_transform(key: &str) -> PathBuf {
  let mut path = PathBuf::new();
  let chars: Vec<char> = key.chars().collect();
  for block in 0..TRANSFORM_BLOCKS {
    let from = block * TRANSFORM_BLOCK_SIZE;
    let to = from + TRANSFORM_BLOCK_SIZE;
    if to > chars.len() {
      break;
    }
    path.push(chars[from..to].iter().collect::<String>());
  }
  path
}

/// Disk-backed byte store, one file per key under sharded directories.
pub struct DiskStore {
  base_path: PathBuf,
}

impl DiskStore {
  /// Create a store rooted at `base_path`; the directory is created lazily.
  pub fn new(base_path: impl AsRef<Path>) -> Self {
    Self {
      base_path: base_path.as_ref().to_path_buf(),
    }
  }

  fn key_path(&self, key: &str) -> PathBuf {
    self.base_path.join(block_transform(key)).join(key)
  }
}

#[async_trait::async_trait]
impl Backend for DiskStore {
  async fn set_value(&self, key: &str, value: &[u8]) -> Result<()> {
    let path = self.key_path(key);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    fs::write(&path, value).await?;
    Ok(())
  }

  async fn get_value(&self, key: &str) -> Result<Vec<u8>> {
    Ok(fs::read(self.key_path(key)).await?)
  }

  async fn has_value(&self, key: &str) -> bool {
    fs::try_exists(self.key_path(key)).await.unwrap_or(false)
  }

  async fn delete_key(&self, key: &str) {
    let _ = fs::remove_file(self.key_path(key)).await;
  }

  async fn delete_all(&self) {
    let _ = fs::remove_dir_all(&self.base_path).await;
    let _ = fs::create_dir_all(&self.base_path).await;
  }
}

/// Memory + disk LRU pair with a persisted disk index.
///
/// Both tiers receive the same encoded bytes on `set`; `get` prefers memory.
/// The disk tier's metadata list is flushed to `index.json` every
/// `save_interval` mutations by a background task, serialized by an
/// index-write lock, so LRU order survives a restart.
pub struct TieredCache {
  index_path: PathBuf,
  memory: RwLock<LruTier<MemoryStore>>,
  disk: RwLock<LruTier<DiskStore>>,
  index_write_lock: Arc<Mutex<()>>,
  save_interval: usize,
  operation_counter: AtomicUsize,
  flush_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TieredCache {
  /// Build the pair, restoring disk LRU order from the index file when one
  /// exists.
  pub async fn new(
    disk_location: impl AsRef<Path>,
    max_memory_mb: i64,
    max_disk_mb: i64,
    save_interval: usize,
  ) -> Self {
    let disk_location = disk_location.as_ref().to_path_buf();
    let index_path = disk_location.join("index.json");
    debug!("cache index path: {}", index_path.display());

    let memory = LruTier::new(MemoryStore::new(), scale_mb(max_memory_mb));
    let mut disk = LruTier::new(DiskStore::new(&disk_location), scale_mb(max_disk_mb));
    match read_index(&index_path).await {
      Ok(metadata) => disk.restore(metadata),
      Err(_) => debug!("no usable cache index, disk tier starts cold"),
    }

    Self {
      index_path,
      memory: RwLock::new(memory),
      disk: RwLock::new(disk),
      index_write_lock: Arc::new(Mutex::new(())),
      save_interval,
      operation_counter: AtomicUsize::new(0),
      flush_task: StdMutex::new(None),
    }
  }

  /// Store the encoded value in both tiers.
  pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    self.memory.write().await.set(key, value).await?;
    self.disk.write().await.set(key, value).await?;
    self.write_index().await;
    Ok(())
  }

  /// Fetch the encoded value, memory tier first.
  pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
    {
      let mut memory = self.memory.write().await;
      if memory.has(key).await {
        return memory.get(key).await;
      }
    }
    self.disk.write().await.get(key).await
  }

  /// Whether either tier holds the key.
  pub async fn has(&self, key: &str) -> bool {
    if self.memory.read().await.has(key).await {
      return true;
    }
    self.disk.read().await.has(key).await
  }

  /// Drop the key from both tiers.
  pub async fn delete(&self, key: &str) {
    self.memory.write().await.delete(key).await;
    self.disk.write().await.delete(key).await;
    self.write_index().await;
  }

  /// Empty both tiers and rewrite the index immediately.
  pub async fn clear(&self) {
    self.memory.write().await.delete_all().await;
    self.disk.write().await.delete_all().await;
    self.flush_index_now().await;
  }

  /// Sum of entry sizes currently accounted in the disk tier.
  pub async fn disk_size(&self) -> i64 {
    self.disk.read().await.current_size()
  }

  /// Counter-gated background index write.
  ///
  /// Accumulates mutations and flushes the disk tier metadata after every
  /// `save_interval` of them on a spawned task holding the index-write lock.
  async fn write_index(&self) {
    let counter = self.operation_counter.fetch_add(1, Ordering::SeqCst) + 1;
    if counter < self.save_interval {
      return;
    }
    self.operation_counter.store(0, Ordering::SeqCst);

    let metadata = self.disk.read().await.metadata();
    let index_path = self.index_path.clone();
    let lock = self.index_write_lock.clone();
    let handle = tokio::spawn(async move {
      let _guard = lock.lock().await;
      if let Err(err) = persist_index(&index_path, &metadata).await {
        // retried on the next interval
        warn!("failed to persist cache index: {}", err);
      }
    });
    if let Some(previous) = self
      .flush_task
      .lock()
      .expect("flush task slot poisoned")
      .replace(handle)
    {
      // flushes are serialized by the index lock; the old handle only needs
      // to stay joinable until replaced
      drop(previous);
    }
  }

  async fn flush_index_now(&self) {
    let metadata = self.disk.read().await.metadata();
    let _guard = self.index_write_lock.lock().await;
    if let Err(err) = persist_index(&self.index_path, &metadata).await {
      warn!("failed to persist cache index: {}", err);
    }
  }

  /// Wait for the most recent background flush to finish.
  pub async fn join_flush(&self) {
    let handle = self
      .flush_task
      .lock()
      .expect("flush task slot poisoned")
      .take();
    if let Some(handle) = handle {
      let _ = handle.await;
    }
    // quiesce any writer that was already holding the lock
    let _guard = self.index_write_lock.lock().await;
  }
}

fn scale_mb(mb: i64) -> i64 {
  if mb < 0 {
    mb
  } else {
    mb * 1024 * 1024
  }
}

async fn read_index(index_path: &Path) -> Result<Vec<CacheMetadata>> {
  let raw = fs::read(index_path).await?;
  Ok(serde_json::from_slice(&raw).map_err(|e| crate::Error::Other(e.to_string()))?)
}

async fn persist_index(index_path: &Path, metadata: &[CacheMetadata]) -> Result<()> {
  if let Some(parent) = index_path.parent() {
    fs::create_dir_all(parent).await?;
  }
  let encoded = serde_json::to_vec(metadata).map_err(|e| crate::Error::Other(e.to_string()))?;
  fs::write(index_path, encoded).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn block_transform_groups_pairs() {
    assert_eq!(block_transform("abcdef"), PathBuf::from("ab/cd"));
    assert_eq!(block_transform("abc"), PathBuf::from("ab"));
    assert_eq!(block_transform("a"), PathBuf::from(""));
  }

  #[tokio::test]
  async fn disk_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskStore::new(dir.path());
    store.set_value("somekey01", b"payload").await.unwrap();
    assert!(store.has_value("somekey01").await);
    assert_eq!(store.get_value("somekey01").await.unwrap(), b"payload");
    // value file landed under the sharded path
    assert!(dir.path().join("so/me/somekey01").exists());
    store.delete_key("somekey01").await;
    assert!(!store.has_value("somekey01").await);
  }

  #[tokio::test]
  async fn tiered_set_reaches_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TieredCache::new(dir.path(), 16, 16, 1000).await;
    cache.set("key1", b"value1").await.unwrap();
    assert!(cache.has("key1").await);
    assert_eq!(cache.get("key1").await.unwrap(), b"value1");
    // still served after the memory tier is gone
    cache.memory.write().await.delete_all().await;
    assert_eq!(cache.get("key1").await.unwrap(), b"value1");
  }

  #[tokio::test]
  async fn clear_empties_everything() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TieredCache::new(dir.path(), 16, 16, 1000).await;
    cache.set("key1", b"value1").await.unwrap();
    cache.clear().await;
    assert!(!cache.has("key1").await);
    assert!(cache.get("key1").await.is_err());
  }

  #[tokio::test]
  async fn index_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
      let cache = TieredCache::new(dir.path(), 16, 16, 1).await;
      cache.set("key1", b"value1").await.unwrap();
      cache.join_flush().await;
    }
    let raw = std::fs::read(dir.path().join("index.json")).unwrap();
    let metadata: Vec<CacheMetadata> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(metadata.len(), 1);
    assert_eq!(metadata[0].key, "key1");
    assert!(metadata[0].size > 0);

    // a rebuilt cache restores the order and keeps flushing
    let cache = TieredCache::new(dir.path(), 16, 16, 1).await;
    assert_eq!(cache.disk_size().await, metadata[0].size);
    cache.set("key2", b"v2").await.unwrap();
    cache.join_flush().await;
    let raw = std::fs::read(dir.path().join("index.json")).unwrap();
    let metadata: Vec<CacheMetadata> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(metadata.first().unwrap().key, "key2");
  }
}

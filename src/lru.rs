//! LRU bookkeeping over a byte-store backend.
//!
//! A tier keeps an ordered metadata list (freshest at the front) and a size
//! total; the actual bytes live behind a [`Backend`]. Keeping the ordering
//! logic out of the backends lets the memory and disk tiers share one
//! eviction policy.

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;

/// Grows without bound.
pub const SIZE_UNBOUNDED: i64 = -1;

/// Per-entry metadata, persisted separately from the values themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheMetadata {
  /// store key
  pub key: String,
  /// encoded value size in bytes
  pub size: i64,
}

/// A keyed byte store a tier can sit on top of.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
  /// Store bytes under a key.
  async fn set_value(&self, key: &str, value: &[u8]) -> Result<()>;
  /// Fetch the bytes for a key.
  async fn get_value(&self, key: &str) -> Result<Vec<u8>>;
  /// Whether a key is present.
  async fn has_value(&self, key: &str) -> bool;
  /// Remove one key. Missing keys are not an error.
  async fn delete_key(&self, key: &str);
  /// Remove everything.
  async fn delete_all(&self);
}

/// One cache tier: ordered metadata plus size accounting over a backend.
pub struct LruTier<B: Backend> {
  backing: B,
  // freshest entries at the front
  order: VecDeque<CacheMetadata>,
  sizes: HashMap<String, i64>,
  current_size: i64,
  max_size: i64,
}

impl<B: Backend> LruTier<B> {
  /// Create a tier with the given size bound. `max_size == -1` is unbounded,
  /// `0` stores nothing.
  pub fn new(backing: B, max_size: i64) -> Self {
    Self {
      backing,
      order: VecDeque::new(),
      sizes: HashMap::new(),
      current_size: 0,
      max_size,
    }
  }

  /// Restore metadata (freshest first) recovered from a persisted index.
  pub fn restore(&mut self, metadata: Vec<CacheMetadata>) {
    for entry in metadata {
      self.current_size += entry.size;
      self.sizes.insert(entry.key.clone(), entry.size);
      self.order.push_back(entry);
    }
  }

  fn move_to_front(&mut self, key: &str) {
    if let Some(pos) = self.order.iter().position(|m| m.key == key) {
      if let Some(entry) = self.order.remove(pos) {
        self.order.push_front(entry);
      }
    }
  }

  /// Store a value, evicting from the tail until it fits. A value larger
  /// than the whole tier is dropped silently and the tier is left unchanged.
  pub async fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
    let size = value.len() as i64;

    // Replacing an entry frees its accounting before the new one lands.
    if self.sizes.contains_key(key) {
      self.delete(key).await;
    }

    if self.max_size > SIZE_UNBOUNDED {
      while self.current_size + size > self.max_size {
        let oldest = match self.order.back() {
          Some(entry) => entry.key.clone(),
          None => break,
        };
        self.delete(&oldest).await;
      }
    }

    if self.max_size == SIZE_UNBOUNDED || self.current_size + size <= self.max_size {
      self.backing.set_value(key, value).await?;
      self.current_size += size;
      self.sizes.insert(key.to_string(), size);
      self.order.push_front(CacheMetadata {
        key: key.to_string(),
        size,
      });
    }
    Ok(())
  }

  /// Fetch a value, refreshing its position on a hit.
  pub async fn get(&mut self, key: &str) -> Result<Vec<u8>> {
    if self.sizes.contains_key(key) {
      self.move_to_front(key);
    }
    self.backing.get_value(key).await
  }

  /// Whether the backend holds the key.
  pub async fn has(&self, key: &str) -> bool {
    self.backing.has_value(key).await
  }

  /// Drop one entry and its accounting.
  pub async fn delete(&mut self, key: &str) {
    if let Some(size) = self.sizes.remove(key) {
      if let Some(pos) = self.order.iter().position(|m| m.key == key) {
        self.order.remove(pos);
      }
      self.current_size -= size;
    }
    self.backing.delete_key(key).await;
  }

  /// Atomic reset of order, sizes and the backend.
  pub async fn delete_all(&mut self) {
    self.order.clear();
    self.sizes.clear();
    self.current_size = 0;
    self.backing.delete_all().await;
  }

  /// Snapshot of the metadata list, freshest first.
  pub fn metadata(&self) -> Vec<CacheMetadata> {
    self.order.iter().cloned().collect()
  }

  /// Total size of stored entries in bytes.
  pub fn current_size(&self) -> i64 {
    self.current_size
  }

  /// The configured bound.
  pub fn max_size(&self) -> i64 {
    self.max_size
  }
}

//! Volatile in-process tier and the no-op tier used when persistence is off.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheKey, CacheTier};

/// In-memory tier. Fast, lost on exit.
pub struct MemoryTier<K, V> {
  entries: Mutex<HashMap<K, V>>,
}

impl<K, V> MemoryTier<K, V> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<K, V>> {
    // A panic mid-insert cannot leave a HashMap half-written
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries().is_empty()
  }
}

impl<K, V> Default for MemoryTier<K, V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K: CacheKey, V: Clone + Send + Sync> CacheTier<K, V> for MemoryTier<K, V> {
  fn lookup(&self, key: &K) -> Option<V> {
    self.entries().get(key).cloned()
  }

  fn store(&self, key: &K, value: &V) {
    self.entries().insert(key.clone(), value.clone());
  }

  fn remove(&self, key: &K) {
    self.entries().remove(key);
  }

  fn contains(&self, key: &K) -> bool {
    self.entries().contains_key(key)
  }

  fn keys(&self) -> Vec<K> {
    self.entries().keys().cloned().collect()
  }

  fn clear(&self) {
    self.entries().clear();
  }
}

/// Tier that doesn't cache anything.
/// Used when persistence is disabled - all operations are no-ops.
pub struct NoopTier;

impl<K, V> CacheTier<K, V> for NoopTier {
  fn lookup(&self, _key: &K) -> Option<V> {
    None // Always miss
  }

  fn store(&self, _key: &K, _value: &V) {}

  fn remove(&self, _key: &K) {}

  fn contains(&self, _key: &K) -> bool {
    false
  }

  fn keys(&self) -> Vec<K> {
    Vec::new()
  }

  fn clear(&self) {}
}

//! Memory → disk → download tier chain with back-fill on slow hits.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::memory::MemoryTier;
use super::traits::{CacheKey, CacheResult, CacheTier, TierKind};

/// Where a freshly obtained value should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
  /// Plain fetch: memory and the purgeable disk cache.
  Cache,
  /// Explicit download: memory and the download store; the disk copy is dropped.
  Download,
}

/// Tiers ordered fastest to slowest.
///
/// The disk and download tiers are mutually exclusive: a value is never
/// resident in both, so a download-tier hit back-fills memory only.
pub struct TieredCache<K, V> {
  memory: Arc<dyn CacheTier<K, V>>,
  disk: Arc<dyn CacheTier<K, V>>,
  download: Arc<dyn CacheTier<K, V>>,
}

impl<K: CacheKey, V: Clone + Send + Sync + 'static> TieredCache<K, V> {
  pub fn new(
    memory: Arc<dyn CacheTier<K, V>>,
    disk: Arc<dyn CacheTier<K, V>>,
    download: Arc<dyn CacheTier<K, V>>,
  ) -> Self {
    Self {
      memory,
      disk,
      download,
    }
  }

  /// Three independent memory tiers. Handy for tests and ephemeral sessions.
  pub fn in_memory() -> Self {
    Self::new(
      Arc::new(MemoryTier::new()),
      Arc::new(MemoryTier::new()),
      Arc::new(MemoryTier::new()),
    )
  }

  pub fn tier(&self, kind: TierKind) -> &dyn CacheTier<K, V> {
    match kind {
      TierKind::Memory => self.memory.as_ref(),
      TierKind::Disk => self.disk.as_ref(),
      TierKind::Download => self.download.as_ref(),
    }
  }

  /// Look the key up tier by tier, returning the first hit.
  pub fn get(&self, key: &K) -> Option<CacheResult<V>> {
    for kind in TierKind::ALL {
      let Some(value) = self.tier(kind).lookup(key) else {
        continue;
      };

      debug!(?key, ?kind, "cache hit");
      if kind != TierKind::Memory {
        self.memory.store(key, &value);
      }
      return Some(CacheResult::from_tier(value, kind));
    }

    debug!(?key, "cache miss");
    None
  }

  pub fn put(&self, key: &K, value: &V, placement: Placement) {
    self.memory.store(key, value);
    match placement {
      Placement::Cache => self.disk.store(key, value),
      Placement::Download => {
        self.download.store(key, value);
        self.disk.remove(key);
      }
    }
  }

  pub fn remove_all(&self, key: &K) {
    for kind in TierKind::ALL {
      self.tier(kind).remove(key);
    }
  }

  /// Synchronous, side-effect free existence check against one tier.
  pub fn is_present_in_tier(&self, key: &K, kind: TierKind) -> bool {
    self.tier(kind).contains(key)
  }

  /// Every key resident in any tier.
  pub fn resident_keys(&self) -> Vec<K> {
    let mut seen = HashSet::new();
    TierKind::ALL
      .iter()
      .flat_map(|kind| self.tier(*kind).keys())
      .filter(|key| seen.insert(key.clone()))
      .collect()
  }

  pub fn clear_tier(&self, kind: TierKind) {
    self.tier(kind).clear();
  }
}

impl<K, V> Clone for TieredCache<K, V> {
  fn clone(&self) -> Self {
    Self {
      memory: Arc::clone(&self.memory),
      disk: Arc::clone(&self.disk),
      download: Arc::clone(&self.download),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bible::types::{BibleVersion, VersionId};
  use crate::cache::traits::CacheSource;
  use crate::cache::StorageLocations;

  fn cache() -> TieredCache<VersionId, String> {
    TieredCache::in_memory()
  }

  #[test]
  fn test_walks_tiers_in_order() {
    let cache = cache();
    cache.tier(TierKind::Disk).store(&VersionId(1), &"disk".to_string());
    cache
      .tier(TierKind::Download)
      .store(&VersionId(1), &"download".to_string());

    let hit = cache.get(&VersionId(1)).unwrap();
    assert_eq!(hit.data, "disk");
    assert_eq!(hit.source, CacheSource::Tier(TierKind::Disk));
  }

  #[test]
  fn test_download_hit_backfills_memory_only() {
    let cache = cache();
    cache
      .tier(TierKind::Download)
      .store(&VersionId(1), &"text".to_string());

    let hit = cache.get(&VersionId(1)).unwrap();
    assert_eq!(hit.source, CacheSource::Tier(TierKind::Download));

    assert!(cache.is_present_in_tier(&VersionId(1), TierKind::Memory));
    assert!(!cache.is_present_in_tier(&VersionId(1), TierKind::Disk));

    let again = cache.get(&VersionId(1)).unwrap();
    assert_eq!(again.source, CacheSource::Tier(TierKind::Memory));
  }

  #[test]
  fn test_disk_hit_backfills_memory() {
    let cache = cache();
    cache.tier(TierKind::Disk).store(&VersionId(1), &"text".to_string());

    cache.get(&VersionId(1));
    assert!(cache.is_present_in_tier(&VersionId(1), TierKind::Memory));
  }

  #[test]
  fn test_download_placement_drops_disk_copy() {
    let cache = cache();
    cache.put(&VersionId(1), &"text".to_string(), Placement::Cache);
    assert!(cache.is_present_in_tier(&VersionId(1), TierKind::Disk));

    cache.put(&VersionId(1), &"text".to_string(), Placement::Download);
    assert!(!cache.is_present_in_tier(&VersionId(1), TierKind::Disk));
    assert!(cache.is_present_in_tier(&VersionId(1), TierKind::Download));
    assert!(cache.is_present_in_tier(&VersionId(1), TierKind::Memory));
  }

  #[test]
  fn test_remove_all_and_resident_keys() {
    let cache = cache();
    cache.put(&VersionId(1), &"a".to_string(), Placement::Cache);
    cache.put(&VersionId(2), &"b".to_string(), Placement::Download);

    let mut keys = cache.resident_keys();
    keys.sort();
    assert_eq!(keys, vec![VersionId(1), VersionId(2)]);

    cache.remove_all(&VersionId(2));
    for kind in TierKind::ALL {
      assert!(!cache.is_present_in_tier(&VersionId(2), kind));
    }
    assert!(cache.get(&VersionId(2)).is_none());
  }

  #[test]
  fn test_corrupt_disk_row_falls_through_to_download() {
    let locations = StorageLocations::open_in_memory().unwrap();
    let StorageLocations::Sqlite { cache: disk, .. } = &locations else {
      panic!("expected sqlite locations");
    };
    let cache: TieredCache<VersionId, BibleVersion> = locations.tiered();
    let version = BibleVersion {
      id: VersionId(206),
      abbreviation: "WEB".to_string(),
      title: "World English Bible".to_string(),
      language_tag: "en".to_string(),
      books: Vec::new(),
    };

    cache.tier(TierKind::Download).store(&VersionId(206), &version);
    disk.store_entity("version", "206", b"{\"id\":").unwrap();

    let hit = cache.get(&VersionId(206)).unwrap();
    assert_eq!(hit.source, CacheSource::Tier(TierKind::Download));
    assert_eq!(hit.data, version);
    assert!(!cache.is_present_in_tier(&VersionId(206), TierKind::Disk));
    assert!(cache.is_present_in_tier(&VersionId(206), TierKind::Memory));
  }

  #[test]
  fn test_presence_check_does_not_backfill() {
    let cache = cache();
    cache
      .tier(TierKind::Download)
      .store(&VersionId(1), &"text".to_string());

    assert!(cache.is_present_in_tier(&VersionId(1), TierKind::Download));
    assert!(!cache.is_present_in_tier(&VersionId(1), TierKind::Memory));
  }
}

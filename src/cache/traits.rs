//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

use crate::bible::types::VersionId;

/// Trait for values that can be persisted in a disk tier.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Entity type name for storage organization (e.g., "version", "chapter")
  fn entity_type() -> &'static str;
}

/// Trait for keys addressing a cached resource.
///
/// The storage key must round-trip through `from_storage_key` so that disk
/// tiers can enumerate what they hold.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
  fn storage_key(&self) -> String;

  fn from_storage_key(key: &str) -> Option<Self>;
}

/// Keys whose access is governed by entitlement to a single version.
pub trait VersionScoped {
  fn scope(&self) -> VersionId;
}

/// One backing store in a cache's fastest-to-slowest chain.
///
/// Implementations serialize their own access; no operation observes another
/// one's partial state. Storage failures never reach the caller: a broken
/// read is a miss and a broken write is logged and dropped.
pub trait CacheTier<K, V>: Send + Sync {
  fn lookup(&self, key: &K) -> Option<V>;

  fn store(&self, key: &K, value: &V);

  fn remove(&self, key: &K);

  /// Side-effect free existence check.
  fn contains(&self, key: &K) -> bool;

  fn keys(&self) -> Vec<K>;

  fn clear(&self);
}

/// Tier positions, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierKind {
  /// Volatile, process lifetime
  Memory,
  /// Persistent, may be purged by the OS or the user
  Disk,
  /// Persistent, user-intentional, survives cache clears
  Download,
}

impl TierKind {
  pub const ALL: [TierKind; 3] = [TierKind::Memory, TierKind::Disk, TierKind::Download];
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new cache result from a tier hit.
  pub fn from_tier(data: T, tier: TierKind) -> Self {
    Self {
      data,
      source: CacheSource::Tier(tier),
    }
  }

  pub fn is_cached(&self) -> bool {
    matches!(self.source, CacheSource::Tier(_))
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Hit in the given tier
  Tier(TierKind),
}

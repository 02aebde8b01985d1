//! Caching implementations for Bible types.

use crate::cache::{CacheKey, Cacheable, VersionScoped};

use super::types::{BibleVersion, ChapterKey, ChapterText, VersionId};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for BibleVersion {
  fn entity_type() -> &'static str {
    "version"
  }
}

impl Cacheable for ChapterText {
  fn entity_type() -> &'static str {
    "chapter"
  }
}

// ============================================================================
// Key types
// ============================================================================

impl CacheKey for VersionId {
  fn storage_key(&self) -> String {
    self.0.to_string()
  }

  fn from_storage_key(key: &str) -> Option<Self> {
    key.parse().ok().map(VersionId)
  }
}

impl VersionScoped for VersionId {
  fn scope(&self) -> VersionId {
    *self
  }
}

impl CacheKey for ChapterKey {
  /// `version:BOOK:chapter`, e.g. `206:GEN:1`
  fn storage_key(&self) -> String {
    self.to_string()
  }

  fn from_storage_key(key: &str) -> Option<Self> {
    let mut parts = key.splitn(3, ':');
    let version_id = parts.next()?.parse().ok()?;
    let book = parts.next()?;
    let chapter = parts.next()?.parse().ok()?;
    if book.is_empty() {
      return None;
    }
    Some(ChapterKey::new(VersionId(version_id), book, chapter))
  }
}

impl VersionScoped for ChapterKey {
  fn scope(&self) -> VersionId {
    self.version_id
  }
}

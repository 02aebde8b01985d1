//! Remote collaborators consumed by the repositories and the sync engine.
//!
//! The core only sees these traits; [`client::ApiClient`] is the HTTP
//! implementation used by the binary.

pub mod api_types;
pub mod client;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::bible::types::{BibleVersion, ChapterKey, ChapterText, Highlight, VersionId};
use crate::error::FetchError;

pub use client::ApiClient;

#[async_trait]
pub trait VersionSource: Send + Sync {
  async fn fetch_version(&self, id: VersionId) -> Result<BibleVersion, FetchError>;
}

#[async_trait]
pub trait ChapterSource: Send + Sync {
  /// Raw chapter markup.
  async fn fetch_chapter(&self, key: &ChapterKey) -> Result<ChapterText, FetchError>;
}

/// Server-side highlight store. Returns `Ok(false)` when the server
/// declined the write.
#[async_trait]
pub trait HighlightsRemote: Send + Sync {
  async fn create_highlight(
    &self,
    bible_id: VersionId,
    passage_id: &str,
    color: &str,
  ) -> Result<bool, FetchError>;

  async fn update_highlight(
    &self,
    bible_id: VersionId,
    passage_id: &str,
    color: &str,
  ) -> Result<bool, FetchError>;

  async fn delete_highlight(&self, bible_id: VersionId, passage_id: &str)
    -> Result<bool, FetchError>;

  async fn list_highlights(
    &self,
    bible_id: VersionId,
    passage_id: &str,
  ) -> Result<Vec<Highlight>, FetchError>;
}

#[async_trait]
pub trait PermissionsSource: Send + Sync {
  /// Versions the current user is entitled to.
  async fn permitted_version_ids(&self) -> Result<HashSet<VersionId>, FetchError>;
}

/// Uniform fetch seam the content repositories are generic over.
#[async_trait]
pub trait RemoteSource<K, V>: Send + Sync {
  async fn fetch(&self, key: &K) -> Result<V, FetchError>;
}

#[async_trait]
impl<T: VersionSource> RemoteSource<VersionId, BibleVersion> for T {
  async fn fetch(&self, key: &VersionId) -> Result<BibleVersion, FetchError> {
    self.fetch_version(*key).await
  }
}

#[async_trait]
impl<T: ChapterSource> RemoteSource<ChapterKey, ChapterText> for T {
  async fn fetch(&self, key: &ChapterKey) -> Result<ChapterText, FetchError> {
    self.fetch_chapter(key).await
  }
}

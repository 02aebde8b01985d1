use color_eyre::{eyre::eyre, Result};
use futures::{stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::info;

use crate::api::{ApiClient, ChapterSource, HighlightsRemote, PermissionsSource, VersionSource};
use crate::bible::{ChapterKey, ChapterRepository, VersionId, VersionRepository};
use crate::cache::StorageLocations;
use crate::config::Config;
use crate::error::FetchError;
use crate::highlights::{HighlightCache, HighlightsSyncCoordinator, MutationQueue};

/// Chapters downloaded at the same time
const DOWNLOAD_CONCURRENCY: usize = 4;

/// What a reconcile pass evicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
  pub versions: usize,
  pub chapters: usize,
}

/// One instance of every shared component, wired together.
///
/// Build it once at startup and hand out references.
pub struct Lectern {
  pub versions: VersionRepository,
  pub chapters: ChapterRepository,
  pub highlights: HighlightsSyncCoordinator,
  permissions: Arc<dyn PermissionsSource>,
}

impl Lectern {
  /// Wire everything against the HTTP API and the configured storage.
  pub fn new(config: &Config) -> Result<Self> {
    let client = Arc::new(ApiClient::new(config)?);
    let storage = if config.storage.ephemeral {
      StorageLocations::Disabled
    } else {
      let cache_dir = match &config.storage.cache_dir {
        Some(dir) => dir.clone(),
        None => StorageLocations::default_cache_dir()?,
      };
      let download_dir = match &config.storage.download_dir {
        Some(dir) => dir.clone(),
        None => StorageLocations::default_download_dir()?,
      };
      StorageLocations::open(&cache_dir, &download_dir)?
    };
    Ok(Self::assemble(config, &storage, client))
  }

  /// Wire everything against any remote implementing all collaborator traits.
  pub fn assemble<R>(config: &Config, storage: &StorageLocations, remote: Arc<R>) -> Self
  where
    R: VersionSource + ChapterSource + HighlightsRemote + PermissionsSource + 'static,
  {
    let versions = VersionRepository::new(storage.tiered(), remote.clone());
    let chapters = ChapterRepository::new(storage.tiered(), remote.clone());

    let cache = Arc::new(HighlightCache::new().with_refresh_window(config.refresh_window()));
    let queue = MutationQueue::new(remote.clone(), config.retry_policy());
    let highlights = HighlightsSyncCoordinator::new(cache, queue, remote.clone());

    Self {
      versions,
      chapters,
      highlights,
      permissions: remote,
    }
  }

  /// Evict everything the user is no longer entitled to from every tier.
  pub async fn reconcile(&self) -> Result<Reconciled, FetchError> {
    let permitted = self.permissions.permitted_version_ids().await?;
    let reconciled = Reconciled {
      versions: self.versions.reconcile(&permitted),
      chapters: self.chapters.reconcile(&permitted),
    };
    info!(?reconciled, permitted = permitted.len(), "reconciled storage");
    Ok(reconciled)
  }

  /// Download a version's metadata and the chapters selected by `book` and
  /// `chapter` (all of them when neither is given). Returns the number of
  /// chapters now held in the download store.
  pub async fn download(
    &self,
    version_id: VersionId,
    book: Option<&str>,
    chapter: Option<u32>,
  ) -> Result<usize> {
    self.versions.ensure_downloaded(&version_id).await?;
    let version = self.versions.get(&version_id).await?;

    let books: Vec<_> = match book {
      Some(usfm) => vec![version
        .book(usfm)
        .ok_or_else(|| eyre!("{} has no book {}", version.abbreviation, usfm))?],
      None => version.books.iter().collect(),
    };

    let mut keys = Vec::new();
    for book in books {
      match chapter {
        Some(n) if n == 0 || n > book.chapters => {
          return Err(eyre!("{} has no chapter {}", book.usfm, n));
        }
        Some(n) => keys.push(ChapterKey::new(version_id, &book.usfm, n)),
        None => keys.extend((1..=book.chapters).map(|n| ChapterKey::new(version_id, &book.usfm, n))),
      }
    }

    let count = keys.len();
    stream::iter(keys)
      .map(|key| async move { self.chapters.ensure_downloaded(&key).await })
      .buffer_unordered(DOWNLOAD_CONCURRENCY)
      .try_collect::<Vec<()>>()
      .await?;

    info!(%version_id, count, "download complete");
    Ok(count)
  }
}

//! Content repositories: tiered cache + request coalescing + remote fetch.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{PermissionsSource, RemoteSource};
use crate::cache::{
  CacheKey, CacheResult, CacheSource, InFlightCoordinator, Placement, TierKind, TieredCache,
  VersionScoped,
};
use crate::error::FetchError;

use super::types::{BibleVersion, ChapterKey, ChapterText, VersionId};

/// Read-through access to one kind of immutable remote resource.
///
/// Cache hits never touch the network; misses are coalesced so only one
/// request per key is outstanding, and failures are surfaced to every
/// waiting caller without being cached.
pub struct ContentRepository<K, V> {
  cache: TieredCache<K, V>,
  in_flight: InFlightCoordinator<K, CacheResult<V>>,
  source: Arc<dyn RemoteSource<K, V>>,
}

/// Repository of version metadata.
pub type VersionRepository = ContentRepository<VersionId, BibleVersion>;

impl<K: CacheKey, V: Clone + Send + Sync + 'static> ContentRepository<K, V> {
  pub fn new(cache: TieredCache<K, V>, source: Arc<dyn RemoteSource<K, V>>) -> Self {
    Self {
      cache,
      in_flight: InFlightCoordinator::new(),
      source,
    }
  }

  pub fn cache(&self) -> &TieredCache<K, V> {
    &self.cache
  }

  pub async fn get(&self, id: &K) -> Result<V, FetchError> {
    Ok(self.fetch(id).await?.data)
  }

  /// Like [`get`](Self::get), also reporting where the value came from.
  pub async fn fetch(&self, id: &K) -> Result<CacheResult<V>, FetchError> {
    if let Some(hit) = self.cache.get(id) {
      return Ok(hit);
    }

    let source = Arc::clone(&self.source);
    let cache = self.cache.clone();
    let key = id.clone();
    self
      .in_flight
      .run_deduplicated(id.clone(), move || async move {
        // A previous generation may have stored it since our miss
        if let Some(hit) = cache.get(&key) {
          return Ok(hit);
        }
        debug!(?key, "fetching from remote");
        let value = source.fetch(&key).await?;
        // Written once per generation, before any waiter resumes
        cache.put(&key, &value, Placement::Cache);
        Ok::<_, FetchError>(CacheResult::from_network(value))
      })
      .await
  }

  /// Make sure `id` is held in the download tier, fetching it if needed.
  pub async fn ensure_downloaded(&self, id: &K) -> Result<(), FetchError> {
    if self.is_downloaded(id) {
      return Ok(());
    }
    let value = self.get(id).await?;
    self.cache.put(id, &value, Placement::Download);
    info!(key = ?id, "downloaded");
    Ok(())
  }

  pub fn is_downloaded(&self, id: &K) -> bool {
    self.cache.is_present_in_tier(id, TierKind::Download)
  }

  pub fn remove(&self, id: &K) {
    self.cache.remove_all(id);
  }

  /// Drop the volatile tier, e.g. on sign-out.
  pub fn clear_memory(&self) {
    self.cache.clear_tier(TierKind::Memory);
  }
}

impl<K: CacheKey + VersionScoped, V: Clone + Send + Sync + 'static> ContentRepository<K, V> {
  /// Evict every resident resource whose version is not in `permitted`.
  ///
  /// Returns the number of evicted keys. Idempotent.
  pub fn reconcile(&self, permitted: &HashSet<VersionId>) -> usize {
    let evicted: Vec<K> = self
      .cache
      .resident_keys()
      .into_iter()
      .filter(|key| !permitted.contains(&key.scope()))
      .collect();

    for key in &evicted {
      self.cache.remove_all(key);
    }
    if !evicted.is_empty() {
      info!(count = evicted.len(), "evicted resources no longer permitted");
    }
    evicted.len()
  }

  /// Refresh the permitted set from the server and reconcile against it.
  pub async fn reconcile_with(&self, permissions: &dyn PermissionsSource) -> Result<usize, FetchError> {
    let permitted = permissions.permitted_version_ids().await?;
    Ok(self.reconcile(&permitted))
  }

  /// Drop one version's memory and disk copies. Downloads are kept.
  pub fn purge_cached_version(&self, version_id: VersionId) -> usize {
    let mut purged = HashSet::new();
    for kind in [TierKind::Memory, TierKind::Disk] {
      let tier = self.cache.tier(kind);
      for key in tier.keys() {
        if key.scope() == version_id {
          tier.remove(&key);
          purged.insert(key);
        }
      }
    }
    purged.len()
  }
}

/// Decides whether fetched chapter markup is usable.
pub type ChapterValidator = Arc<dyn Fn(&ChapterText) -> bool + Send + Sync>;

/// Default validator: the markup carries some text outside of its tags.
pub fn has_readable_text(chapter: &ChapterText) -> bool {
  let mut in_tag = false;
  for c in chapter.content.chars() {
    match c {
      '<' => in_tag = true,
      '>' => in_tag = false,
      c if !in_tag && !c.is_whitespace() => return true,
      _ => {}
    }
  }
  false
}

/// Chapter text repository with self-healing of corrupt cached content.
///
/// If a cached chapter fails validation, the memory and disk copies of its
/// whole version are discarded and the fetch is retried once. Downloaded
/// chapters are left alone, except a downloaded copy that is itself unusable:
/// that one is replaced by the refetched text. Unusable text straight from
/// the network is refetched once without touching anything else.
pub struct ChapterRepository {
  inner: ContentRepository<ChapterKey, ChapterText>,
  validator: ChapterValidator,
}

impl ChapterRepository {
  pub fn new(
    cache: TieredCache<ChapterKey, ChapterText>,
    source: Arc<dyn RemoteSource<ChapterKey, ChapterText>>,
  ) -> Self {
    Self {
      inner: ContentRepository::new(cache, source),
      validator: Arc::new(has_readable_text),
    }
  }

  pub fn with_validator(mut self, validator: ChapterValidator) -> Self {
    self.validator = validator;
    self
  }

  pub fn repository(&self) -> &ContentRepository<ChapterKey, ChapterText> {
    &self.inner
  }

  pub async fn get(&self, key: &ChapterKey) -> Result<ChapterText, FetchError> {
    let first = self.inner.fetch(key).await?;
    if (self.validator)(&first.data) {
      return Ok(first.data);
    }

    let was_downloaded = first.source == CacheSource::Tier(TierKind::Download);
    if first.is_cached() {
      let purged = self.inner.purge_cached_version(key.version_id);
      warn!(%key, purged, source = ?first.source, "cached chapter unusable, discarded cached version and retrying");
    } else {
      warn!(%key, "fetched chapter unusable, retrying");
    }
    self.inner.remove(key);

    let chapter = self.inner.get(key).await?;
    if (self.validator)(&chapter) {
      if was_downloaded {
        self.inner.cache().put(key, &chapter, Placement::Download);
      }
      return Ok(chapter);
    }

    self.inner.remove(key);
    Err(FetchError::Malformed(format!(
      "chapter {} has no readable content",
      key
    )))
  }

  /// Download a chapter into the persistent store.
  pub async fn ensure_downloaded(&self, key: &ChapterKey) -> Result<(), FetchError> {
    if self.inner.is_downloaded(key) {
      return Ok(());
    }
    let chapter = self.get(key).await?;
    self.inner.cache().put(key, &chapter, Placement::Download);
    info!(%key, "downloaded chapter");
    Ok(())
  }

  pub fn is_downloaded(&self, key: &ChapterKey) -> bool {
    self.inner.is_downloaded(key)
  }

  pub fn reconcile(&self, permitted: &HashSet<VersionId>) -> usize {
    self.inner.reconcile(permitted)
  }

  pub fn clear_memory(&self) {
    self.inner.clear_memory();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{ChapterSource, VersionSource};
  use crate::cache::{CacheTier, MemoryTier};
  use async_trait::async_trait;
  use futures::future::join_all;
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  fn version(id: u32) -> BibleVersion {
    BibleVersion {
      id: VersionId(id),
      abbreviation: format!("V{}", id),
      title: format!("Version {}", id),
      language_tag: "en".to_string(),
      books: Vec::new(),
    }
  }

  /// Fake remote counting calls, optionally offline.
  #[derive(Default)]
  struct FakeVersions {
    calls: AtomicU32,
    offline: bool,
  }

  #[async_trait]
  impl VersionSource for FakeVersions {
    async fn fetch_version(&self, id: VersionId) -> Result<BibleVersion, FetchError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(10)).await;
      if self.offline {
        return Err(FetchError::Unavailable("offline".to_string()));
      }
      Ok(version(id.0))
    }
  }

  fn versions(remote: &Arc<FakeVersions>) -> VersionRepository {
    ContentRepository::new(TieredCache::in_memory(), remote.clone())
  }

  #[tokio::test]
  async fn test_concurrent_gets_make_one_remote_call() {
    let remote = Arc::new(FakeVersions::default());
    let repo = versions(&remote);

    let results = join_all((0..5).map(|_| repo.get(&VersionId(206)))).await;
    assert!(results.iter().all(|r| r.as_ref() == Ok(&version(206))));
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

    // Now cached
    let hit = repo.fetch(&VersionId(206)).await.unwrap();
    assert_eq!(hit.source, CacheSource::Tier(TierKind::Memory));
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
  }

  /// Memory tier whose first lookup misses, as if read just before a
  /// concurrent fetch stored the value.
  struct LateTier {
    inner: MemoryTier<VersionId, BibleVersion>,
    missed: AtomicBool,
  }

  impl CacheTier<VersionId, BibleVersion> for LateTier {
    fn lookup(&self, key: &VersionId) -> Option<BibleVersion> {
      if !self.missed.swap(true, Ordering::SeqCst) {
        return None;
      }
      self.inner.lookup(key)
    }

    fn store(&self, key: &VersionId, value: &BibleVersion) {
      self.inner.store(key, value)
    }

    fn remove(&self, key: &VersionId) {
      self.inner.remove(key)
    }

    fn contains(&self, key: &VersionId) -> bool {
      self.inner.contains(key)
    }

    fn keys(&self) -> Vec<VersionId> {
      self.inner.keys()
    }

    fn clear(&self) {
      self.inner.clear()
    }
  }

  #[tokio::test]
  async fn test_value_stored_after_miss_is_not_refetched() {
    let memory = LateTier {
      inner: MemoryTier::new(),
      missed: AtomicBool::new(false),
    };
    memory.inner.store(&VersionId(206), &version(206));
    let cache = TieredCache::new(
      Arc::new(memory),
      Arc::new(MemoryTier::new()),
      Arc::new(MemoryTier::new()),
    );
    let remote = Arc::new(FakeVersions::default());
    let repo = ContentRepository::new(cache, remote.clone());

    let hit = repo.fetch(&VersionId(206)).await.unwrap();
    assert_eq!(hit.source, CacheSource::Tier(TierKind::Memory));
    assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_offline_error_shared_by_concurrent_callers() {
    let remote = Arc::new(FakeVersions {
      offline: true,
      ..Default::default()
    });
    let repo = versions(&remote);

    let (a, b) = tokio::join!(repo.get(&VersionId(206)), repo.get(&VersionId(206)));
    assert_eq!(a, Err(FetchError::Unavailable("offline".to_string())));
    assert_eq!(a, b);
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    assert!(repo.cache().resident_keys().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_writes_memory_and_disk() {
    let remote = Arc::new(FakeVersions::default());
    let repo = versions(&remote);

    repo.get(&VersionId(1)).await.unwrap();
    assert!(repo.cache().is_present_in_tier(&VersionId(1), TierKind::Memory));
    assert!(repo.cache().is_present_in_tier(&VersionId(1), TierKind::Disk));
  }

  #[tokio::test]
  async fn test_download_tier_value_promoted_without_remote_call() {
    let remote = Arc::new(FakeVersions::default());
    let repo = versions(&remote);
    repo
      .cache()
      .tier(TierKind::Download)
      .store(&VersionId(206), &version(206));

    let first = repo.fetch(&VersionId(206)).await.unwrap();
    assert_eq!(first.source, CacheSource::Tier(TierKind::Download));
    let second = repo.fetch(&VersionId(206)).await.unwrap();
    assert_eq!(second.source, CacheSource::Tier(TierKind::Memory));
    assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_ensure_downloaded_moves_out_of_disk_tier() {
    let remote = Arc::new(FakeVersions::default());
    let repo = versions(&remote);

    repo.get(&VersionId(206)).await.unwrap();
    repo.ensure_downloaded(&VersionId(206)).await.unwrap();

    assert!(repo.is_downloaded(&VersionId(206)));
    assert!(!repo.cache().is_present_in_tier(&VersionId(206), TierKind::Disk));

    // Already downloaded: no-op, no fetch
    repo.ensure_downloaded(&VersionId(206)).await.unwrap();
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_reconcile_is_idempotent() {
    let remote = Arc::new(FakeVersions::default());
    let repo = versions(&remote);
    for id in [1, 2, 3] {
      repo.get(&VersionId(id)).await.unwrap();
    }
    repo.ensure_downloaded(&VersionId(3)).await.unwrap();

    let permitted: HashSet<VersionId> = [VersionId(1)].into_iter().collect();
    assert_eq!(repo.reconcile(&permitted), 2);
    let once = repo.cache().resident_keys();

    assert_eq!(repo.reconcile(&permitted), 0);
    assert_eq!(repo.cache().resident_keys(), once);
    assert_eq!(once, vec![VersionId(1)]);
  }

  struct FixedPermissions(HashSet<VersionId>);

  #[async_trait]
  impl PermissionsSource for FixedPermissions {
    async fn permitted_version_ids(&self) -> Result<HashSet<VersionId>, FetchError> {
      Ok(self.0.clone())
    }
  }

  #[tokio::test]
  async fn test_reconcile_with_remote_permissions() {
    let remote = Arc::new(FakeVersions::default());
    let repo = versions(&remote);
    repo.get(&VersionId(1)).await.unwrap();
    repo.get(&VersionId(2)).await.unwrap();

    let permissions = FixedPermissions([VersionId(2)].into_iter().collect());
    assert_eq!(repo.reconcile_with(&permissions).await, Ok(1));
    assert_eq!(repo.cache().resident_keys(), vec![VersionId(2)]);
  }

  /// Serves queued chapter bodies in order, counting calls.
  struct ScriptedChapters {
    bodies: Mutex<VecDeque<String>>,
    calls: AtomicU32,
  }

  impl ScriptedChapters {
    fn new(bodies: &[&str]) -> Arc<Self> {
      Arc::new(Self {
        bodies: Mutex::new(bodies.iter().map(|b| b.to_string()).collect()),
        calls: AtomicU32::new(0),
      })
    }
  }

  #[async_trait]
  impl ChapterSource for ScriptedChapters {
    async fn fetch_chapter(&self, key: &ChapterKey) -> Result<ChapterText, FetchError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let content = self
        .bodies
        .lock()
        .unwrap()
        .pop_front()
        .ok_or_else(|| FetchError::Unavailable("no more bodies".to_string()))?;
      Ok(ChapterText {
        key: key.clone(),
        content,
      })
    }
  }

  fn gen(chapter: u32) -> ChapterKey {
    ChapterKey::new(VersionId(206), "GEN", chapter)
  }

  #[tokio::test]
  async fn test_corrupt_cached_chapter_purges_version_and_refetches() {
    let remote = ScriptedChapters::new(&["<p>In the beginning</p>"]);
    let repo = ChapterRepository::new(TieredCache::in_memory(), remote.clone());

    let cache = repo.repository().cache();
    let broken = ChapterText {
      key: gen(1),
      content: "<p>  </p>".to_string(),
    };
    cache.put(&gen(1), &broken, Placement::Cache);
    let sibling = ChapterText {
      key: gen(2),
      content: "<p>text</p>".to_string(),
    };
    cache.put(&gen(2), &sibling, Placement::Cache);

    let chapter = repo.get(&gen(1)).await.unwrap();
    assert_eq!(chapter.content, "<p>In the beginning</p>");
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    // The whole version was discarded
    assert!(cache.get(&gen(2)).is_none());
  }

  fn chapter(key: ChapterKey, content: &str) -> ChapterText {
    ChapterText {
      key,
      content: content.to_string(),
    }
  }

  #[tokio::test]
  async fn test_corrupt_cached_chapter_keeps_other_downloads() {
    let remote = ScriptedChapters::new(&["<p>In the beginning</p>"]);
    let repo = ChapterRepository::new(TieredCache::in_memory(), remote.clone());
    let cache = repo.repository().cache();

    cache.put(&gen(2), &chapter(gen(2), "<p>downloaded</p>"), Placement::Download);
    cache.put(&gen(1), &chapter(gen(1), "<p></p>"), Placement::Cache);

    repo.get(&gen(1)).await.unwrap();
    assert!(repo.is_downloaded(&gen(2)));
    assert_eq!(repo.get(&gen(2)).await.unwrap().content, "<p>downloaded</p>");
    assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_unusable_network_chapter_purges_nothing_else() {
    let remote = ScriptedChapters::new(&["", "<p>ok</p>"]);
    let repo = ChapterRepository::new(TieredCache::in_memory(), remote.clone());
    let cache = repo.repository().cache();

    cache.put(&gen(2), &chapter(gen(2), "<p>downloaded</p>"), Placement::Download);
    cache.put(&gen(3), &chapter(gen(3), "<p>cached</p>"), Placement::Cache);

    assert_eq!(repo.get(&gen(1)).await.unwrap().content, "<p>ok</p>");
    assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    assert!(repo.is_downloaded(&gen(2)));
    assert!(cache.is_present_in_tier(&gen(3), TierKind::Disk));
  }

  #[tokio::test]
  async fn test_corrupt_download_replaced_by_refetched_copy() {
    let remote = ScriptedChapters::new(&["<p>fresh</p>"]);
    let repo = ChapterRepository::new(TieredCache::in_memory(), remote.clone());
    let cache = repo.repository().cache();
    cache
      .tier(TierKind::Download)
      .store(&gen(1), &chapter(gen(1), "<p> </p>"));

    assert_eq!(repo.get(&gen(1)).await.unwrap().content, "<p>fresh</p>");
    assert!(repo.is_downloaded(&gen(1)));
    assert!(!cache.is_present_in_tier(&gen(1), TierKind::Disk));
  }

  #[tokio::test]
  async fn test_chapter_retried_only_once() {
    let remote = ScriptedChapters::new(&["<p></p>", "<p></p>", "<p>late</p>"]);
    let repo = ChapterRepository::new(TieredCache::in_memory(), remote.clone());

    let result = repo.get(&gen(1)).await;
    assert!(matches!(result, Err(FetchError::Malformed(_))));
    assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    assert!(repo.repository().cache().get(&gen(1)).is_none());
  }

  #[tokio::test]
  async fn test_chapter_download_and_reconcile_by_version() {
    let remote = ScriptedChapters::new(&["<p>a</p>", "<p>b</p>"]);
    let repo = ChapterRepository::new(TieredCache::in_memory(), remote.clone());

    repo.ensure_downloaded(&gen(1)).await.unwrap();
    assert!(repo.is_downloaded(&gen(1)));
    repo.get(&ChapterKey::new(VersionId(111), "GEN", 1)).await.unwrap();

    let permitted: HashSet<VersionId> = [VersionId(111)].into_iter().collect();
    assert_eq!(repo.reconcile(&permitted), 1);
    assert!(!repo.is_downloaded(&gen(1)));
  }

  #[test]
  fn test_has_readable_text() {
    let chapter = |content: &str| ChapterText {
      key: gen(1),
      content: content.to_string(),
    };
    assert!(has_readable_text(&chapter("<div><p>Text</p></div>")));
    assert!(!has_readable_text(&chapter("<div>\n  <p> </p></div>")));
    assert!(!has_readable_text(&chapter("")));
  }
}

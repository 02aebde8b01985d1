//! Glue between UI edits, the highlight cache and the mutation queue.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::HighlightsRemote;
use crate::bible::types::{ChapterKey, Highlight, Reference, SyncState, normalize_color};
use crate::error::FetchError;

use super::cache::{HighlightCache, Removal, Snapshot};
use super::queue::{MutationQueue, PendingOperation};

/// Result of [`HighlightsSyncCoordinator::load_chapter_highlights`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterLoad {
  /// Server highlights were merged; carries how many the server returned
  Refreshed(usize),
  /// Loaded within the refresh window, nothing fetched
  Throttled,
  /// Another load of the chapter is running
  AlreadyLoading,
}

/// Holds a chapter's loader slot. However the load ends, the chapter is
/// stamped as fetched and the slot released.
struct LoadingGuard<'a> {
  cache: &'a HighlightCache,
  chapter: &'a ChapterKey,
}

impl<'a> LoadingGuard<'a> {
  fn claim(cache: &'a HighlightCache, chapter: &'a ChapterKey) -> Option<Self> {
    cache
      .mark_chapter_as_loading(chapter)
      .then_some(Self { cache, chapter })
  }
}

impl Drop for LoadingGuard<'_> {
  fn drop(&mut self) {
    self.cache.record_chapter_fetch(self.chapter);
    self.cache.unmark_chapter_as_loading(self.chapter);
  }
}

/// Applies highlight edits locally first, then queues them for the server.
///
/// Every edit is grouped by color into one operation per group. Edits never
/// fail from the caller's point of view; the returned operation ids can be
/// looked up with [`MutationQueue::operation_result`].
pub struct HighlightsSyncCoordinator {
  cache: Arc<HighlightCache>,
  queue: MutationQueue,
  remote: Arc<dyn HighlightsRemote>,
}

impl HighlightsSyncCoordinator {
  pub fn new(
    cache: Arc<HighlightCache>,
    queue: MutationQueue,
    remote: Arc<dyn HighlightsRemote>,
  ) -> Self {
    Self {
      cache,
      queue,
      remote,
    }
  }

  pub fn cache(&self) -> &Arc<HighlightCache> {
    &self.cache
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
    self.cache.subscribe()
  }

  /// Visible highlights overlapping `range`.
  pub fn highlights_in(&self, range: &Reference) -> Vec<Highlight> {
    self.cache.highlights_overlapping(range)
  }

  /// True when a highlight is shown at exactly this reference.
  fn is_visible(&self, reference: &Reference) -> bool {
    self
      .cache
      .entry_at(reference)
      .is_some_and(|e| e.sync_state != SyncState::PendingDelete)
  }

  fn enqueue(&self, operation: PendingOperation) -> Uuid {
    let id = operation.id;
    self.queue.enqueue(operation);
    id
  }

  /// Highlight passages. A passage that is already highlighted is recolored
  /// instead, so a create that already went out is followed by an update.
  pub fn add_highlights(&self, highlights: &[Highlight]) -> Vec<Uuid> {
    let (recolor, create): (Vec<&Highlight>, Vec<&Highlight>) = highlights
      .iter()
      .partition(|h| self.is_visible(&h.reference));

    let mut ids = Vec::new();
    for (color, references) in group_by_color(recolor) {
      ids.extend(self.update_highlight_colors(&references, &color));
    }

    let create: Vec<Highlight> = create.into_iter().cloned().collect();
    if create.is_empty() {
      return ids;
    }
    self.cache.add_highlights(&create);
    for (color, references) in group_by_color(create.iter()) {
      ids.push(self.enqueue(PendingOperation::add(references, &color)));
    }
    ids
  }

  /// Recolor passages, highlighting those that have nothing yet.
  pub fn update_highlight_colors(&self, references: &[Reference], color: &str) -> Vec<Uuid> {
    let color = normalize_color(color);
    let visible: HashSet<Reference> = references
      .iter()
      .filter(|r| self.is_visible(r))
      .cloned()
      .collect();

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    for (reference, state) in self.cache.update_highlight_colors(references, &color) {
      match state {
        SyncState::PendingCreate if !visible.contains(&reference) => creates.push(reference),
        // The old color's create can simply be replaced while unsent
        SyncState::PendingCreate if self.queue.withdraw_add(&reference) => creates.push(reference),
        _ => updates.push(reference),
      }
    }

    let mut ids = Vec::new();
    if !creates.is_empty() {
      ids.push(self.enqueue(PendingOperation::add(creates, &color)));
    }
    if !updates.is_empty() {
      ids.push(self.enqueue(PendingOperation::update(updates, &color)));
    }
    ids
  }

  /// Remove highlights. Highlights the server never saw are simply dropped.
  pub fn remove_highlights(&self, references: &[Reference]) -> Option<Uuid> {
    let deletes: Vec<Reference> = self
      .cache
      .remove_highlights(references)
      .into_iter()
      .filter_map(|(reference, removal)| match removal {
        Removal::PendingDelete => Some(reference),
        Removal::Discarded if !self.queue.withdraw_add(&reference) => Some(reference),
        Removal::Discarded | Removal::NotFound => None,
      })
      .collect();

    if deletes.is_empty() {
      debug!("nothing to delete remotely");
      return None;
    }
    Some(self.enqueue(PendingOperation::remove(deletes)))
  }

  /// Refresh one chapter's highlights from the server.
  ///
  /// Skipped while a load of the chapter is running or one finished within
  /// the refresh window. Finishing includes failing and being dropped: the
  /// chapter is stamped and its loader slot released either way.
  pub async fn load_chapter_highlights(&self, chapter: &ChapterKey) -> Result<ChapterLoad, FetchError> {
    if self.cache.has_recently_loaded_chapter(chapter) {
      debug!(%chapter, "highlights fresh");
      return Ok(ChapterLoad::Throttled);
    }
    let Some(_guard) = LoadingGuard::claim(&self.cache, chapter) else {
      return Ok(ChapterLoad::AlreadyLoading);
    };

    let highlights = self
      .remote
      .list_highlights(chapter.version_id, &chapter.passage_id())
      .await?;
    self.cache.apply_server_highlights(chapter, &highlights);
    info!(%chapter, count = highlights.len(), "loaded highlights");
    Ok(ChapterLoad::Refreshed(highlights.len()))
  }

  pub fn retry_failed_operations(&self) {
    self.queue.retry_failed_operations();
  }

  pub fn failed_operation_count(&self) -> usize {
    self.queue.failed_operation_count()
  }

  /// Forget local highlights and refresh timestamps, e.g. on sign-out.
  ///
  /// Queued edits are left to complete or fail on their own.
  pub fn reset(&self) {
    self.cache.reset();
  }
}

/// Group references by color, colors in a stable order.
fn group_by_color<'a>(highlights: impl IntoIterator<Item = &'a Highlight>) -> BTreeMap<String, Vec<Reference>> {
  let mut groups: BTreeMap<String, Vec<Reference>> = BTreeMap::new();
  for highlight in highlights {
    groups
      .entry(highlight.color.clone())
      .or_default()
      .push(highlight.reference.clone());
  }
  groups
}

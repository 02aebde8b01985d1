//! Observable in-memory table of highlights, the UI's local source of truth.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

use crate::bible::types::{CachedHighlight, ChapterKey, Highlight, Reference, SyncState};

/// Default time a chapter refresh stays fresh, in seconds.
pub const DEFAULT_REFRESH_WINDOW_SECS: i64 = 5 * 60;

/// What happened to a reference passed to [`HighlightCache::remove_highlights`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
  /// The entry had never been sent; it is gone and the server need not know.
  Discarded,
  /// The entry is hidden and tombstoned until the server confirms the delete.
  PendingDelete,
  /// Nothing visible was highlighted there.
  NotFound,
}

/// Immutable view of the table at one point in time.
///
/// Cloning is cheap; writers copy the table before changing it, so a
/// snapshot never observes a half-applied mutation.
#[derive(Debug, Clone, Default)]
pub struct Snapshot(Arc<Vec<CachedHighlight>>);

impl Snapshot {
  /// Entries visible to the UI (tombstones excluded).
  pub fn visible(&self) -> impl Iterator<Item = &CachedHighlight> {
    self
      .0
      .iter()
      .filter(|e| e.sync_state != SyncState::PendingDelete)
  }

  pub fn overlapping(&self, range: &Reference) -> Vec<Highlight> {
    self
      .visible()
      .filter(|e| e.reference().overlaps(range))
      .map(|e| e.highlight.clone())
      .collect()
  }

  pub fn len(&self) -> usize {
    self.visible().count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[derive(Default)]
struct State {
  entries: Arc<Vec<CachedHighlight>>,
  /// Last successful server refresh per chapter
  recent_fetches: HashMap<ChapterKey, DateTime<Utc>>,
  loading: HashSet<ChapterKey>,
}

impl State {
  fn position(&self, reference: &Reference) -> Option<usize> {
    self.entries.iter().position(|e| e.reference() == reference)
  }
}

/// Highlights keyed by reference, at most one entry per reference.
///
/// Mutations are applied optimistically and published to subscribers as a
/// fresh [`Snapshot`].
pub struct HighlightCache {
  state: Mutex<State>,
  updates: watch::Sender<Snapshot>,
  refresh_window: Duration,
}

impl HighlightCache {
  pub fn new() -> Self {
    let (updates, _) = watch::channel(Snapshot::default());
    Self {
      state: Mutex::new(State::default()),
      updates,
      refresh_window: Duration::seconds(DEFAULT_REFRESH_WINDOW_SECS),
    }
  }

  pub fn with_refresh_window(mut self, window: Duration) -> Self {
    self.refresh_window = window;
    self
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Apply `change` to a private copy of the table and publish it.
  fn mutate<R>(&self, change: impl FnOnce(&mut Vec<CachedHighlight>) -> R) -> R {
    let mut state = self.state();
    let result = change(Arc::make_mut(&mut state.entries));
    let snapshot = Snapshot(Arc::clone(&state.entries));
    drop(state);
    self.updates.send_replace(snapshot);
    result
  }

  pub fn snapshot(&self) -> Snapshot {
    Snapshot(Arc::clone(&self.state().entries))
  }

  /// Receive a new snapshot after every mutation.
  pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
    self.updates.subscribe()
  }

  pub fn highlights_overlapping(&self, range: &Reference) -> Vec<Highlight> {
    self.snapshot().overlapping(range)
  }

  /// The entry at exactly this reference, tombstones included.
  pub fn entry_at(&self, reference: &Reference) -> Option<CachedHighlight> {
    let state = self.state();
    state.position(reference).map(|i| state.entries[i].clone())
  }

  /// Entries not yet confirmed by the server.
  pub fn pending_count(&self) -> usize {
    self
      .state()
      .entries
      .iter()
      .filter(|e| e.sync_state.is_pending())
      .count()
  }

  /// Insert highlights as pending creations, replacing anything at the same reference.
  pub fn add_highlights(&self, highlights: &[Highlight]) {
    self.mutate(|entries| {
      for highlight in highlights {
        entries.retain(|e| e.reference() != &highlight.reference);
        entries.push(CachedHighlight::new(
          highlight.clone(),
          SyncState::PendingCreate,
        ));
      }
    });
  }

  /// Remove highlights, reporting per reference whether the server must be told.
  pub fn remove_highlights(&self, references: &[Reference]) -> Vec<(Reference, Removal)> {
    self.mutate(|entries| {
      references
        .iter()
        .map(|reference| {
          let position = entries.iter().position(|e| e.reference() == reference);
          let removal = match position {
            None => Removal::NotFound,
            Some(i) => match entries[i].sync_state {
              SyncState::PendingCreate => {
                entries.remove(i);
                Removal::Discarded
              }
              SyncState::PendingDelete => Removal::NotFound,
              SyncState::RemoteSynced | SyncState::PendingUpdate => {
                let entry = &mut entries[i];
                entry.sync_state = SyncState::PendingDelete;
                entry.last_modified_at = Utc::now();
                Removal::PendingDelete
              }
            },
          };
          (reference.clone(), removal)
        })
        .collect()
    })
  }

  /// Recolor highlights, inserting pending creations where nothing is visible.
  ///
  /// Returns the resulting sync state of every reference.
  pub fn update_highlight_colors(
    &self,
    references: &[Reference],
    color: &str,
  ) -> Vec<(Reference, SyncState)> {
    let highlights: Vec<Highlight> = references
      .iter()
      .map(|r| Highlight::new(r.clone(), color))
      .collect();

    self.mutate(|entries| {
      highlights
        .into_iter()
        .map(|highlight| {
          let reference = highlight.reference.clone();
          let existing = entries
            .iter_mut()
            .find(|e| e.reference() == &reference && e.sync_state != SyncState::PendingDelete);

          let state = match existing {
            Some(entry) => {
              entry.highlight.color = highlight.color;
              entry.last_modified_at = Utc::now();
              if entry.sync_state != SyncState::PendingCreate {
                entry.sync_state = SyncState::PendingUpdate;
              }
              entry.sync_state
            }
            None => {
              entries.retain(|e| e.reference() != &reference);
              entries.push(CachedHighlight::new(highlight, SyncState::PendingCreate));
              SyncState::PendingCreate
            }
          };
          (reference, state)
        })
        .collect()
    })
  }

  /// Merge a server refresh for one chapter.
  ///
  /// Synced entries of the chapter are replaced by the server's set. Pending
  /// entries are never overwritten, but two of them change state, which a
  /// plain "leave pending entries alone" merge would not do:
  ///
  /// - a pending create or update the server reports with the same color is
  ///   promoted to synced, so later edits go out as updates
  /// - a tombstone the server no longer reports is dropped
  ///
  /// A pending entry whose color the server disagrees with stays pending.
  pub fn apply_server_highlights(&self, chapter: &ChapterKey, highlights: &[Highlight]) {
    let in_chapter: Vec<&Highlight> = highlights
      .iter()
      .filter(|h| &h.reference.chapter_key() == chapter)
      .collect();
    if in_chapter.len() != highlights.len() {
      debug!(%chapter, ignored = highlights.len() - in_chapter.len(), "ignoring highlights outside chapter");
    }

    self.mutate(|entries| {
      entries.retain(|e| {
        if &e.reference().chapter_key() != chapter {
          return true;
        }
        match e.sync_state {
          SyncState::RemoteSynced => false,
          SyncState::PendingDelete => in_chapter.iter().any(|h| &h.reference == e.reference()),
          SyncState::PendingCreate | SyncState::PendingUpdate => true,
        }
      });

      for highlight in in_chapter {
        match entries
          .iter_mut()
          .find(|e| e.reference() == &highlight.reference)
        {
          Some(local) => {
            let confirmed = matches!(
              local.sync_state,
              SyncState::PendingCreate | SyncState::PendingUpdate
            ) && local.highlight.color == highlight.color;
            if confirmed {
              local.sync_state = SyncState::RemoteSynced;
            }
          }
          None => entries.push(CachedHighlight::new(
            highlight.clone(),
            SyncState::RemoteSynced,
          )),
        }
      }
    });
  }

  pub fn has_recently_loaded_chapter(&self, chapter: &ChapterKey) -> bool {
    self
      .state()
      .recent_fetches
      .get(chapter)
      .is_some_and(|at| Utc::now() - *at < self.refresh_window)
  }

  pub fn record_chapter_fetch(&self, chapter: &ChapterKey) {
    self
      .state()
      .recent_fetches
      .insert(chapter.clone(), Utc::now());
  }

  /// Claim the single loader slot for a chapter. Returns false if another
  /// load already holds it.
  pub fn mark_chapter_as_loading(&self, chapter: &ChapterKey) -> bool {
    self.state().loading.insert(chapter.clone())
  }

  pub fn unmark_chapter_as_loading(&self, chapter: &ChapterKey) {
    self.state().loading.remove(chapter);
  }

  pub fn is_chapter_loading(&self, chapter: &ChapterKey) -> bool {
    self.state().loading.contains(chapter)
  }

  /// Forget everything, e.g. on sign-out.
  pub fn reset(&self) {
    {
      let mut state = self.state();
      state.recent_fetches.clear();
      state.loading.clear();
    }
    self.mutate(|entries| entries.clear());
  }
}

impl Default for HighlightCache {
  fn default() -> Self {
    Self::new()
  }
}

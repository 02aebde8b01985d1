//! Domain types for Bible versions, chapters, references and highlights.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::InvalidPassage;

/// Numeric id of a Bible version (e.g. 206 for the WEB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub u32);

impl fmt::Display for VersionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Composite key of a single chapter within a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChapterKey {
  pub version_id: VersionId,
  /// Upper-case USFM book code, e.g. "GEN"
  pub book: String,
  pub chapter: u32,
}

impl ChapterKey {
  pub fn new(version_id: VersionId, book: &str, chapter: u32) -> Self {
    Self {
      version_id,
      book: normalize_book(book),
      chapter,
    }
  }

  /// USFM passage id, e.g. `GEN.1`.
  pub fn passage_id(&self) -> String {
    format!("{}.{}", self.book, self.chapter)
  }

  /// Reference covering the whole chapter.
  pub fn reference(&self) -> Reference {
    Reference::chapter(self.version_id, &self.book, self.chapter)
  }
}

impl fmt::Display for ChapterKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.version_id, self.book, self.chapter)
  }
}

/// An address into Bible text: version, book, chapter and an optional verse range.
///
/// A reference without verses addresses the whole chapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
  pub version_id: VersionId,
  pub book: String,
  pub chapter: u32,
  pub verse_start: Option<u32>,
  pub verse_end: Option<u32>,
}

impl Reference {
  pub fn chapter(version_id: VersionId, book: &str, chapter: u32) -> Self {
    Self {
      version_id,
      book: normalize_book(book),
      chapter,
      verse_start: None,
      verse_end: None,
    }
  }

  pub fn verse(version_id: VersionId, book: &str, chapter: u32, verse: u32) -> Self {
    Self::verses(version_id, book, chapter, verse, verse)
  }

  /// A verse range. A single-verse range is stored without an end so that
  /// `GEN.1.3` and `GEN.1.3-3` are the same reference.
  pub fn verses(version_id: VersionId, book: &str, chapter: u32, start: u32, end: u32) -> Self {
    let (start, end) = if end < start { (end, start) } else { (start, end) };
    Self {
      version_id,
      book: normalize_book(book),
      chapter,
      verse_start: Some(start),
      verse_end: (end != start).then_some(end),
    }
  }

  /// Parse a USFM passage id (`GEN.1`, `GEN.1.3`, `GEN.1.3-5` or `GEN.1.3-GEN.1.5`).
  pub fn parse_passage(version_id: VersionId, passage: &str) -> Result<Self, InvalidPassage> {
    let invalid = || InvalidPassage(passage.to_string());
    let trimmed = passage.trim();
    let (head, tail) = match trimmed.split_once('-') {
      Some((head, tail)) => (head, Some(tail)),
      None => (trimmed, None),
    };

    let parts: Vec<&str> = head.split('.').collect();
    match parts.as_slice() {
      [book, chapter] if !book.is_empty() && tail.is_none() => {
        let chapter = chapter.parse().map_err(|_| invalid())?;
        Ok(Self::chapter(version_id, book, chapter))
      }
      [book, chapter, verse] if !book.is_empty() => {
        let chapter = chapter.parse().map_err(|_| invalid())?;
        let start: u32 = verse.parse().map_err(|_| invalid())?;
        let end = match tail {
          // The end may repeat the book and chapter
          Some(tail) => tail
            .rsplit('.')
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?,
          None => start,
        };
        Ok(Self::verses(version_id, book, chapter, start, end))
      }
      _ => Err(invalid()),
    }
  }

  pub fn chapter_key(&self) -> ChapterKey {
    ChapterKey {
      version_id: self.version_id,
      book: self.book.clone(),
      chapter: self.chapter,
    }
  }

  pub fn is_whole_chapter(&self) -> bool {
    self.verse_start.is_none() && self.verse_end.is_none()
  }

  pub fn same_chapter(&self, other: &Reference) -> bool {
    self.version_id == other.version_id && self.book == other.book && self.chapter == other.chapter
  }

  /// Inclusive verse span with a missing start defaulting to 1 and a
  /// missing end defaulting to the start.
  fn verse_span(&self) -> (u32, u32) {
    let start = self.verse_start.unwrap_or(1);
    let end = self.verse_end.unwrap_or(start).max(start);
    (start, end)
  }

  /// Whether two references share at least one verse of the same chapter.
  ///
  /// A whole-chapter reference overlaps every reference in its chapter.
  pub fn overlaps(&self, other: &Reference) -> bool {
    if !self.same_chapter(other) {
      return false;
    }
    if self.is_whole_chapter() || other.is_whole_chapter() {
      return true;
    }
    let (a_start, a_end) = self.verse_span();
    let (b_start, b_end) = other.verse_span();
    a_start.max(b_start) <= a_end.min(b_end)
  }

  /// USFM passage id: `GEN.1`, `GEN.1.3` or `GEN.1.3-5`.
  pub fn passage_id(&self) -> String {
    match (self.verse_start, self.verse_end) {
      (None, None) => format!("{}.{}", self.book, self.chapter),
      (Some(start), None) => format!("{}.{}.{}", self.book, self.chapter, start),
      (start, Some(end)) => format!(
        "{}.{}.{}-{}",
        self.book,
        self.chapter,
        start.unwrap_or(1),
        end
      ),
    }
  }
}

impl fmt::Display for Reference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.passage_id(), self.version_id)
  }
}

fn normalize_book(book: &str) -> String {
  book.trim().to_ascii_uppercase()
}

/// Normalize a hex color to six upper-case digits without a leading `#`.
pub fn normalize_color(color: &str) -> String {
  color.trim().trim_start_matches('#').to_ascii_uppercase()
}

/// A user highlight, addressed by where it is rather than by a record id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
  pub reference: Reference,
  pub color: String,
}

impl Highlight {
  pub fn new(reference: Reference, color: &str) -> Self {
    Self {
      reference,
      color: normalize_color(color),
    }
  }
}

/// Where a cached highlight stands relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
  RemoteSynced,
  PendingCreate,
  PendingUpdate,
  PendingDelete,
}

impl SyncState {
  pub fn is_pending(self) -> bool {
    !matches!(self, SyncState::RemoteSynced)
  }
}

/// A highlight as held by the local highlight cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedHighlight {
  pub local_id: Uuid,
  pub highlight: Highlight,
  pub sync_state: SyncState,
  pub last_modified_at: DateTime<Utc>,
}

impl CachedHighlight {
  pub fn new(highlight: Highlight, sync_state: SyncState) -> Self {
    Self {
      local_id: Uuid::new_v4(),
      highlight,
      sync_state,
      last_modified_at: Utc::now(),
    }
  }

  pub fn reference(&self) -> &Reference {
    &self.highlight.reference
  }
}

/// Metadata for one book of a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookInfo {
  /// USFM book code
  pub usfm: String,
  pub title: String,
  pub chapters: u32,
}

/// Immutable Bible version metadata as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BibleVersion {
  pub id: VersionId,
  pub abbreviation: String,
  pub title: String,
  pub language_tag: String,
  #[serde(default)]
  pub books: Vec<BookInfo>,
}

impl BibleVersion {
  pub fn book(&self, usfm: &str) -> Option<&BookInfo> {
    let usfm = normalize_book(usfm);
    self.books.iter().find(|b| b.usfm == usfm)
  }
}

/// Raw markup of one chapter, handed verbatim to the rendering pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterText {
  pub key: ChapterKey,
  pub content: String,
}

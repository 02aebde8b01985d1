//! Serde types matching the Bible API's JSON.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bible::types::{BibleVersion, BookInfo, ChapterKey, ChapterText, Highlight, Reference, VersionId};
use crate::error::FetchError;

// ============================================================================
// Bibles
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiBook {
  /// USFM code, e.g. `GEN`
  pub id: String,
  pub title: String,
  /// Chapter ids, e.g. `GEN.1`; intro chapters included
  #[serde(default)]
  pub chapters: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiBible {
  pub id: u32,
  pub abbreviation: String,
  pub title: String,
  pub language_tag: String,
  #[serde(default)]
  pub books: Vec<ApiBook>,
}

impl ApiBible {
  pub fn into_version(self, requested: VersionId) -> Result<BibleVersion, FetchError> {
    if self.id != requested.0 {
      return Err(FetchError::Malformed(format!(
        "asked for version {} but got {}",
        requested, self.id
      )));
    }

    let books = self
      .books
      .into_iter()
      .map(|book| {
        // Numbered chapters only; `GEN.INTRO` and the like are not readable chapters
        let prefix = format!("{}.", book.id);
        let chapters = book
          .chapters
          .iter()
          .filter_map(|c| c.strip_prefix(&prefix)?.parse::<u32>().ok())
          .count() as u32;
        BookInfo {
          usfm: book.id.to_ascii_uppercase(),
          title: book.title,
          chapters,
        }
      })
      .collect();

    Ok(BibleVersion {
      id: requested,
      abbreviation: self.abbreviation,
      title: self.title,
      language_tag: self.language_tag,
      books,
    })
  }
}

/// Page of the bibles the current user may read.
#[derive(Debug, Deserialize)]
pub struct ApiBibleIndex {
  #[serde(default)]
  pub data: Vec<ApiBibleRef>,
  pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiBibleRef {
  pub id: u32,
}

// ============================================================================
// Passages
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiPassage {
  pub id: String,
  pub content: String,
}

impl ApiPassage {
  pub fn into_chapter(self, key: &ChapterKey) -> Result<ChapterText, FetchError> {
    if !self.id.eq_ignore_ascii_case(&key.passage_id()) {
      return Err(FetchError::Malformed(format!(
        "asked for passage {} but got {}",
        key.passage_id(),
        self.id
      )));
    }
    Ok(ChapterText {
      key: key.clone(),
      content: self.content,
    })
  }
}

// ============================================================================
// Highlights
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiHighlight {
  pub bible_id: u32,
  pub passage_id: String,
  pub color: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiHighlightsResponse {
  #[serde(default)]
  pub data: Vec<ApiHighlight>,
}

impl ApiHighlightsResponse {
  /// Convert to domain highlights, skipping entries with unreadable passage ids.
  pub fn into_highlights(self) -> Vec<Highlight> {
    self
      .data
      .into_iter()
      .filter_map(|h| match Reference::parse_passage(VersionId(h.bible_id), &h.passage_id) {
        Ok(reference) => Some(Highlight::new(reference, &h.color)),
        Err(e) => {
          warn!("skipping highlight: {e}");
          None
        }
      })
      .collect()
  }
}

/// Body of create and update calls.
#[derive(Debug, Serialize)]
pub struct ApiHighlightWrite<'a> {
  pub bible_id: u32,
  pub passage_id: &'a str,
  pub color: &'a str,
}

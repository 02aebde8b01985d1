//! Bible content: domain types and the version/chapter repositories.

mod cache;
pub mod repository;
pub mod types;

pub use repository::{has_readable_text, ChapterRepository, ChapterValidator, ContentRepository, VersionRepository};
pub use types::{
  BibleVersion, BookInfo, CachedHighlight, ChapterKey, ChapterText, Highlight, Reference, SyncState,
  VersionId,
};

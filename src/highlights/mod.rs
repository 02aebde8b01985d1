//! User highlights: optimistic local table plus an offline-first sync engine.

pub mod cache;
pub mod queue;
pub mod sync;

pub use cache::{HighlightCache, Removal, Snapshot, DEFAULT_REFRESH_WINDOW_SECS};
pub use queue::{MutationQueue, OperationKind, OperationOutcome, PendingOperation, RetryPolicy};
pub use sync::{ChapterLoad, HighlightsSyncCoordinator};

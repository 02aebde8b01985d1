//! Offline-first data layer for a Bible reader.
//!
//! Immutable content (version metadata and chapter text) is served through
//! tiered caches with coalesced fetches. User highlights are edited locally
//! first and synced to the server by a retrying mutation queue.

pub mod api;
pub mod app;
pub mod bible;
pub mod cache;
pub mod config;
pub mod error;
pub mod highlights;
pub mod logging;

pub use app::Lectern;
pub use error::{FetchError, OperationError};

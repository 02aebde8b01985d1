//! Generic tiered caching layer for immutable remote resources.
//!
//! This module provides a resource-agnostic caching mechanism that:
//! - Chains a volatile memory tier, a purgeable disk tier and a
//!   user-intentional download tier, back-filling faster tiers on slow hits
//! - Treats unreadable storage as a miss and never fails a caller on a write
//! - Coalesces concurrent fetches of the same key into one remote call

mod inflight;
mod memory;
mod storage;
mod tiered;
mod traits;

pub use inflight::InFlightCoordinator;
pub use memory::{MemoryTier, NoopTier};
pub use storage::{SqliteStorage, SqliteTier, StorageLocations};
pub use tiered::{Placement, TieredCache};
pub use traits::{CacheKey, CacheResult, CacheSource, CacheTier, Cacheable, TierKind, VersionScoped};

//! SQLite-backed persistent tiers.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::memory::{MemoryTier, NoopTier};
use super::tiered::TieredCache;
use super::traits::{CacheKey, CacheTier, Cacheable};

/// A single stored row.
#[derive(Debug, Clone)]
pub struct StoredEntity {
  /// Serialized JSON
  pub data: Vec<u8>,
  /// When the entity was written
  pub cached_at: DateTime<Utc>,
}

/// One SQLite database file holding serialized entities of any type.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) a storage file at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory storage: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(STORAGE_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;
    Ok(())
  }

  pub fn get_entity(&self, entity_type: &str, entity_key: &str) -> Result<Option<StoredEntity>> {
    let conn = self.conn()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM entity_cache
         WHERE entity_type = ? AND entity_key = ?",
        params![entity_type, entity_key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entity {}: {}", entity_key, e))?;

    match row {
      Some((data, cached_at)) => Ok(Some(StoredEntity {
        data,
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  pub fn store_entity(&self, entity_type: &str, entity_key: &str, data: &[u8]) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, cached_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![entity_type, entity_key, data],
      )
      .map_err(|e| eyre!("Failed to store entity {}: {}", entity_key, e))?;
    Ok(())
  }

  pub fn remove_entity(&self, entity_type: &str, entity_key: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
        params![entity_type, entity_key],
      )
      .map_err(|e| eyre!("Failed to remove entity {}: {}", entity_key, e))?;
    Ok(())
  }

  pub fn contains_entity(&self, entity_type: &str, entity_key: &str) -> Result<bool> {
    let found: Option<i64> = self
      .conn()?
      .query_row(
        "SELECT 1 FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
        params![entity_type, entity_key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to check entity {}: {}", entity_key, e))?;
    Ok(found.is_some())
  }

  pub fn entity_keys(&self, entity_type: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT entity_key FROM entity_cache WHERE entity_type = ?")
      .map_err(|e| eyre!("Failed to prepare key query: {}", e))?;

    let keys = stmt
      .query_map(params![entity_type], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();
    Ok(keys)
  }

  pub fn clear_entities(&self, entity_type: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "DELETE FROM entity_cache WHERE entity_type = ?",
        params![entity_type],
      )
      .map_err(|e| eyre!("Failed to clear {}: {}", entity_type, e))?;
    Ok(())
  }
}

/// Schema for cache tables.
const STORAGE_SCHEMA: &str = r#"
-- Generic entity cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_key)
);
"#;

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// A persistent tier over one [`SqliteStorage`] file.
///
/// Errors are logged and degrade to a miss; an undecodable row is deleted so
/// the next write replaces it cleanly.
pub struct SqliteTier<K, V> {
  storage: Arc<SqliteStorage>,
  /// Label for log lines ("cache" or "downloads")
  location: &'static str,
  _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> SqliteTier<K, V> {
  pub fn new(storage: Arc<SqliteStorage>, location: &'static str) -> Self {
    Self {
      storage,
      location,
      _marker: PhantomData,
    }
  }
}

impl<K: CacheKey, V: Cacheable> CacheTier<K, V> for SqliteTier<K, V> {
  fn lookup(&self, key: &K) -> Option<V> {
    let storage_key = key.storage_key();
    let stored = match self.storage.get_entity(V::entity_type(), &storage_key) {
      Ok(Some(stored)) => stored,
      Ok(None) => return None,
      Err(e) => {
        warn!(location = self.location, key = %storage_key, "tier read failed: {e}");
        return None;
      }
    };

    match serde_json::from_slice(&stored.data) {
      Ok(value) => {
        debug!(location = self.location, key = %storage_key, cached_at = %stored.cached_at, "tier hit");
        Some(value)
      }
      Err(e) => {
        warn!(location = self.location, key = %storage_key, "discarding undecodable entry: {e}");
        self.remove(key);
        None
      }
    }
  }

  fn store(&self, key: &K, value: &V) {
    let storage_key = key.storage_key();
    let result = serde_json::to_vec(value)
      .map_err(|e| eyre!("Failed to serialize entity: {}", e))
      .and_then(|data| {
        self
          .storage
          .store_entity(V::entity_type(), &storage_key, &data)
      });
    if let Err(e) = result {
      warn!(location = self.location, key = %storage_key, "tier write failed: {e}");
    }
  }

  fn remove(&self, key: &K) {
    let storage_key = key.storage_key();
    if let Err(e) = self.storage.remove_entity(V::entity_type(), &storage_key) {
      warn!(location = self.location, key = %storage_key, "tier remove failed: {e}");
    }
  }

  fn contains(&self, key: &K) -> bool {
    self
      .storage
      .contains_entity(V::entity_type(), &key.storage_key())
      .unwrap_or_else(|e| {
        warn!(location = self.location, "tier lookup failed: {e}");
        false
      })
  }

  fn keys(&self) -> Vec<K> {
    match self.storage.entity_keys(V::entity_type()) {
      Ok(keys) => keys
        .iter()
        .filter_map(|k| K::from_storage_key(k))
        .collect(),
      Err(e) => {
        warn!(location = self.location, "tier key listing failed: {e}");
        Vec::new()
      }
    }
  }

  fn clear(&self) {
    if let Err(e) = self.storage.clear_entities(V::entity_type()) {
      warn!(location = self.location, "tier clear failed: {e}");
    }
  }
}

/// The two physical persistence locations: a purgeable cache and the
/// user-intentional download store.
#[derive(Clone)]
pub enum StorageLocations {
  Sqlite {
    cache: Arc<SqliteStorage>,
    downloads: Arc<SqliteStorage>,
  },
  /// Persistence disabled; only the memory tier holds anything.
  Disabled,
}

impl StorageLocations {
  /// Open both locations under the given directories.
  pub fn open(cache_dir: &Path, download_dir: &Path) -> Result<Self> {
    let cache = SqliteStorage::open(&cache_dir.join("cache.db"))?;
    let downloads = SqliteStorage::open(&download_dir.join("downloads.db"))?;
    Ok(Self::Sqlite {
      cache: Arc::new(cache),
      downloads: Arc::new(downloads),
    })
  }

  /// Both locations backed by private in-memory databases.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::Sqlite {
      cache: Arc::new(SqliteStorage::open_in_memory()?),
      downloads: Arc::new(SqliteStorage::open_in_memory()?),
    })
  }

  /// Default cache directory (`$XDG_CACHE_HOME/lectern`).
  pub fn default_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .map(|p| p.join("lectern"))
      .ok_or_else(|| eyre!("Could not determine cache directory"))
  }

  /// Default download directory (`$XDG_DATA_HOME/lectern`).
  pub fn default_download_dir() -> Result<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|p| p.join("lectern"))
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }

  /// Build the memory → disk → download chain for one resource type.
  pub fn tiered<K: CacheKey, V: Cacheable>(&self) -> TieredCache<K, V> {
    match self {
      Self::Sqlite { cache, downloads } => TieredCache::new(
        Arc::new(MemoryTier::new()),
        Arc::new(SqliteTier::new(Arc::clone(cache), "cache")),
        Arc::new(SqliteTier::new(Arc::clone(downloads), "downloads")),
      ),
      Self::Disabled => TieredCache::new(
        Arc::new(MemoryTier::new()),
        Arc::new(NoopTier),
        Arc::new(NoopTier),
      ),
    }
  }
}

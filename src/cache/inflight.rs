//! Request coalescing: at most one outstanding fetch per key.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::FetchError;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

type PendingMap<K, V> = Arc<Mutex<HashMap<K, SharedFetch<V>>>>;

/// Deduplicates concurrent fetches of the same key.
///
/// The first caller for a key starts the work; everyone arriving before it
/// completes awaits the same result. The entry is dropped on completion, so
/// failures are never cached and the next caller starts a new generation.
pub struct InFlightCoordinator<K, V> {
  pending: PendingMap<K, V>,
}

fn lock<K, V>(pending: &PendingMap<K, V>) -> MutexGuard<'_, HashMap<K, SharedFetch<V>>> {
  // The map is only touched by insert/remove; a poisoned lock holds a valid map
  pending.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K, V> InFlightCoordinator<K, V>
where
  K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self {
      pending: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Run `work` for `key` unless a run is already outstanding, in which case
  /// join it.
  pub async fn run_deduplicated<F, Fut>(&self, key: K, work: F) -> Result<V, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
  {
    let fetch = {
      let mut pending = lock(&self.pending);
      match pending.get(&key) {
        Some(existing) => {
          debug!(?key, "joining in-flight fetch");
          existing.clone()
        }
        None => {
          let registry = Arc::clone(&self.pending);
          let owned_key = key.clone();
          let work = work();
          let fetch = async move {
            let result = work.await;
            lock(&registry).remove(&owned_key);
            result
          }
          .boxed()
          .shared();
          pending.insert(key, fetch.clone());
          fetch
        }
      }
    };

    fetch.await
  }

  /// Number of keys with an outstanding fetch.
  pub fn in_flight_count(&self) -> usize {
    lock(&self.pending).len()
  }

  pub fn is_in_flight(&self, key: &K) -> bool {
    lock(&self.pending).contains_key(key)
  }
}

impl<K, V> Default for InFlightCoordinator<K, V>
where
  K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V> Clone for InFlightCoordinator<K, V> {
  fn clone(&self) -> Self {
    Self {
      pending: Arc::clone(&self.pending),
    }
  }
}

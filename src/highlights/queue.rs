//! Offline-first mutation queue draining highlight edits to the server.
//!
//! Operations are kept in enqueue order and applied by a single drain loop
//! at a time. Failed operations go back to the front of the queue and the
//! loop retries the batch with capped exponential backoff:
//!
//! ```text
//! Idle ──enqueue──▶ Draining ──all applied──▶ Idle
//!                     ▲    │
//!                     └────┘ failures (after backoff) or new work
//! ```

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::HighlightsRemote;
use crate::bible::types::Reference;
use crate::error::{FetchError, OperationError};

/// What a pending operation asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
  Add,
  Update,
  Remove,
}

/// One queued highlight mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
  pub id: Uuid,
  pub references: Vec<Reference>,
  /// Color for add and update
  pub payload: Option<String>,
  pub kind: OperationKind,
  pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
  pub fn new(kind: OperationKind, references: Vec<Reference>, payload: Option<String>) -> Self {
    Self {
      id: Uuid::new_v4(),
      references,
      payload,
      kind,
      enqueued_at: Utc::now(),
    }
  }

  pub fn add(references: Vec<Reference>, color: &str) -> Self {
    Self::new(OperationKind::Add, references, Some(color.to_string()))
  }

  pub fn update(references: Vec<Reference>, color: &str) -> Self {
    Self::new(OperationKind::Update, references, Some(color.to_string()))
  }

  pub fn remove(references: Vec<Reference>) -> Self {
    Self::new(OperationKind::Remove, references, None)
  }

  fn covers(&self, reference: &Reference) -> bool {
    self.references.contains(reference)
  }

  /// Same operation without `reference`, or None if nothing would be left.
  fn without(&self, reference: &Reference) -> Option<Self> {
    let references: Vec<Reference> = self
      .references
      .iter()
      .filter(|r| *r != reference)
      .cloned()
      .collect();
    (!references.is_empty()).then(|| Self {
      references,
      ..self.clone()
    })
  }
}

/// Last recorded result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
  pub operation_id: Uuid,
  pub success: bool,
  pub error: Option<String>,
  /// Failed attempts so far
  pub retry_count: u32,
}

/// Backoff between whole-batch retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// None retries forever. Otherwise an operation that failed this many
  /// times is set aside until [`MutationQueue::retry_failed_operations`].
  pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(60),
      max_attempts: None,
    }
  }
}

impl RetryPolicy {
  /// Delay before retry `attempt` (1-based): doubles each time, capped.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

#[derive(Default)]
struct QueueState {
  pending: Vec<PendingOperation>,
  draining: bool,
  /// Operations of the batch currently being applied
  in_flight: Vec<PendingOperation>,
  /// Operations that exhausted `max_attempts`
  abandoned: Vec<PendingOperation>,
  outcomes: HashMap<Uuid, OperationOutcome>,
  failures: HashMap<Uuid, u32>,
  batch_attempt: u32,
  /// References whose create may have reached the server and has not been
  /// deleted since
  created: HashSet<Reference>,
}

impl QueueState {
  fn has_failed(&self, op: &PendingOperation) -> bool {
    self.failures.get(&op.id).is_some_and(|n| *n > 0)
  }

  fn forget(&mut self, id: &Uuid) {
    self.failures.remove(id);
    self.outcomes.remove(id);
  }
}

struct Inner {
  remote: Arc<dyn HighlightsRemote>,
  policy: RetryPolicy,
  state: Mutex<QueueState>,
  /// True while no drain is running
  idle: watch::Sender<bool>,
  /// Cuts a backoff wait short
  wake: Notify,
}

/// Ordered queue of highlight mutations with a single-flight drain loop.
///
/// Enqueueing never blocks on the network: the drain runs on a spawned
/// task, so `enqueue` must be called from within a tokio runtime. Outcomes
/// are observed through [`operation_result`](Self::operation_result), never
/// as errors to the enqueuer.
#[derive(Clone)]
pub struct MutationQueue {
  inner: Arc<Inner>,
}

impl MutationQueue {
  pub fn new(remote: Arc<dyn HighlightsRemote>, policy: RetryPolicy) -> Self {
    let (idle, _) = watch::channel(true);
    Self {
      inner: Arc::new(Inner {
        remote,
        policy,
        state: Mutex::new(QueueState::default()),
        idle,
        wake: Notify::new(),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, QueueState> {
    self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Claim the drain slot. Caller must run the drain loop if this returns true.
  fn begin_drain(state: &mut QueueState) -> bool {
    if state.draining {
      return false;
    }
    state.draining = true;
    true
  }

  fn spawn_drain(&self) {
    self.inner.idle.send_replace(false);
    let queue = self.clone();
    tokio::spawn(async move { queue.drain_loop().await });
  }

  /// Append an operation and make sure a drain is running.
  pub fn enqueue(&self, operation: PendingOperation) {
    debug!(id = %operation.id, kind = ?operation.kind, "enqueue");
    let start = {
      let mut state = self.state();
      state.pending.push(operation);
      // Stable: equal timestamps keep their enqueue order
      state.pending.sort_by_key(|op| op.enqueued_at);
      Self::begin_drain(&mut state)
    };
    if start {
      self.spawn_drain();
    }
  }

  /// Run a drain on the current task. A no-op if one is already running.
  pub async fn drain(&self) {
    let start = Self::begin_drain(&mut self.state());
    if start {
      self.inner.idle.send_replace(false);
      self.drain_loop().await;
    }
  }

  /// Re-queue operations that were set aside and retry failures immediately.
  pub fn retry_failed_operations(&self) {
    let start = {
      let mut state = self.state();
      let abandoned = std::mem::take(&mut state.abandoned);
      for op in &abandoned {
        state.failures.insert(op.id, 0);
      }
      state.pending.extend(abandoned);
      state.pending.sort_by_key(|op| op.enqueued_at);

      if state.pending.is_empty() {
        return;
      }
      Self::begin_drain(&mut state)
    };

    if start {
      self.spawn_drain();
    } else {
      // A drain is sleeping in backoff
      self.inner.wake.notify_one();
    }
  }

  /// Take back any not-yet-sent `Add` covering `reference`.
  ///
  /// Returns true when the server holds no highlight from us at the
  /// reference: a queued add was withdrawn, none is being applied right now
  /// and no earlier create went out. Returns false if a create may already
  /// have reached the server.
  pub fn withdraw_add(&self, reference: &Reference) -> bool {
    let mut guard = self.state();
    let state = &mut *guard;
    let sent = state.created.contains(reference)
      || state
        .in_flight
        .iter()
        .any(|op| op.kind == OperationKind::Add && op.covers(reference));

    let mut withdrawn = false;
    let mut removed_ids = Vec::new();
    for list in [&mut state.pending, &mut state.abandoned] {
      let mut kept = Vec::with_capacity(list.len());
      for op in list.drain(..) {
        if op.kind == OperationKind::Add && op.covers(reference) {
          withdrawn = true;
          match op.without(reference) {
            Some(narrowed) => kept.push(narrowed),
            None => removed_ids.push(op.id),
          }
        } else {
          kept.push(op);
        }
      }
      *list = kept;
    }
    for id in &removed_ids {
      state.forget(id);
    }

    if withdrawn {
      debug!(%reference, "withdrew unsent add");
    }
    withdrawn && !sent
  }

  /// Resolves once nothing is pending and no drain is running.
  pub async fn wait_idle(&self) {
    let mut idle = self.inner.idle.subscribe();
    // The sender lives in `inner`, so the channel cannot close under us
    let _ = idle.wait_for(|idle| *idle).await;
  }

  pub fn operation_result(&self, id: &Uuid) -> Option<OperationOutcome> {
    self.state().outcomes.get(id).cloned()
  }

  pub fn clear_results(&self) {
    self.state().outcomes.clear();
  }

  /// Operations whose last attempt failed and that are still awaiting a retry.
  pub fn failed_operation_count(&self) -> usize {
    let state = self.state();
    state.pending.iter().filter(|op| state.has_failed(op)).count() + state.abandoned.len()
  }

  /// Queued operations, oldest first.
  pub fn pending_operations(&self) -> Vec<PendingOperation> {
    self.state().pending.clone()
  }

  pub fn abandoned_operations(&self) -> Vec<PendingOperation> {
    self.state().abandoned.clone()
  }

  pub fn is_draining(&self) -> bool {
    self.state().draining
  }

  async fn drain_loop(&self) {
    loop {
      let batch = {
        let mut state = self.state();
        if state.pending.is_empty() {
          state.draining = false;
          state.batch_attempt = 0;
          self.inner.idle.send_replace(true);
          return;
        }
        let batch = std::mem::take(&mut state.pending);
        state.in_flight = batch.clone();
        batch
      };

      info!(count = batch.len(), "draining highlight operations");
      let mut failed = Vec::new();
      for mut op in batch {
        let result = self.apply(&mut op).await;
        if self.record(&op, result) {
          failed.push(op);
        }
      }

      let delay = {
        let mut state = self.state();
        state.in_flight.clear();
        if failed.is_empty() {
          state.batch_attempt = 0;
          continue;
        }

        let (retry, give_up): (Vec<_>, Vec<_>) = failed.into_iter().partition(|op| {
          match self.inner.policy.max_attempts {
            Some(max) => state.failures.get(&op.id).copied().unwrap_or(0) < max,
            None => true,
          }
        });
        if !give_up.is_empty() {
          warn!(count = give_up.len(), "giving up on highlight operations");
          state.abandoned.extend(give_up);
        }
        if retry.is_empty() {
          continue;
        }

        // Failures go back in front of anything enqueued meanwhile
        let mut requeued = retry;
        requeued.append(&mut state.pending);
        state.pending = requeued;

        state.batch_attempt += 1;
        self.inner.policy.backoff(state.batch_attempt)
      };

      warn!(?delay, "highlight sync failed, retrying");
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = self.inner.wake.notified() => debug!("backoff cut short"),
      }
    }
  }

  /// Record an outcome. Returns true if the operation should be retried.
  fn record(&self, op: &PendingOperation, result: Result<(), OperationError>) -> bool {
    let mut state = self.state();
    let (success, error, retry) = match result {
      Ok(()) => (true, None, false),
      Err(e) => {
        warn!(id = %op.id, kind = ?op.kind, "highlight operation failed: {e}");
        let retry = e.is_retryable();
        (false, Some(e.to_string()), retry)
      }
    };

    let retry_count = if retry {
      let count = state.failures.entry(op.id).or_insert(0);
      *count += 1;
      *count
    } else {
      state.failures.remove(&op.id).unwrap_or(0)
    };

    state.outcomes.insert(
      op.id,
      OperationOutcome {
        operation_id: op.id,
        success,
        error,
        retry_count,
      },
    );
    retry
  }

  fn track_created(&self, kind: OperationKind, reference: &Reference) {
    let mut state = self.state();
    match kind {
      OperationKind::Add => {
        state.created.insert(reference.clone());
      }
      OperationKind::Remove => {
        state.created.remove(reference);
      }
      OperationKind::Update => {}
    }
  }

  /// One remote call per reference; the operation succeeds only if all do.
  ///
  /// Confirmed references are taken off `op`, so a retry only replays the
  /// calls that have not gone through.
  async fn apply(&self, op: &mut PendingOperation) -> Result<(), OperationError> {
    let remote = &self.inner.remote;
    let color = match op.kind {
      OperationKind::Add | OperationKind::Update => {
        Some(op.payload.clone().ok_or(OperationError::MissingPayload)?)
      }
      OperationKind::Remove => None,
    };

    while let Some(reference) = op.references.first().cloned() {
      if op.kind == OperationKind::Add {
        // Counts as sent from here on, whatever the reply
        self.track_created(op.kind, &reference);
      }
      let passage_id = reference.passage_id();
      let bible_id = reference.version_id;
      let accepted = match (op.kind, color.as_deref()) {
        (OperationKind::Add, Some(color)) => {
          remote.create_highlight(bible_id, &passage_id, color).await?
        }
        (OperationKind::Update, Some(color)) => {
          remote.update_highlight(bible_id, &passage_id, color).await?
        }
        (OperationKind::Remove, _) => remote.delete_highlight(bible_id, &passage_id).await?,
        (_, None) => return Err(OperationError::MissingPayload),
      };
      if accepted && op.kind == OperationKind::Remove {
        self.track_created(op.kind, &reference);
      } else if !accepted {
        return Err(
          FetchError::Unavailable(format!("server declined {:?} of {}", op.kind, passage_id)).into(),
        );
      }
      op.references.remove(0);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bible::types::{Highlight, VersionId};
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicBool, Ordering};

  /// Records every call; fails while `offline` is set.
  #[derive(Default)]
  struct FakeRemote {
    calls: Mutex<Vec<(OperationKind, String)>>,
    offline: AtomicBool,
  }

  impl FakeRemote {
    fn calls(&self) -> Vec<(OperationKind, String)> {
      self.calls.lock().unwrap().clone()
    }

    fn call(&self, kind: OperationKind, passage_id: &str) -> Result<bool, FetchError> {
      if self.offline.load(Ordering::SeqCst) {
        return Err(FetchError::Unavailable("offline".to_string()));
      }
      self.calls.lock().unwrap().push((kind, passage_id.to_string()));
      Ok(true)
    }
  }

  #[async_trait]
  impl HighlightsRemote for FakeRemote {
    async fn create_highlight(&self, _: VersionId, passage_id: &str, _: &str) -> Result<bool, FetchError> {
      self.call(OperationKind::Add, passage_id)
    }

    async fn update_highlight(&self, _: VersionId, passage_id: &str, _: &str) -> Result<bool, FetchError> {
      self.call(OperationKind::Update, passage_id)
    }

    async fn delete_highlight(&self, _: VersionId, passage_id: &str) -> Result<bool, FetchError> {
      self.call(OperationKind::Remove, passage_id)
    }

    async fn list_highlights(&self, _: VersionId, _: &str) -> Result<Vec<Highlight>, FetchError> {
      Ok(Vec::new())
    }
  }

  fn verse(n: u32) -> Reference {
    Reference::verse(VersionId(206), "GEN", 1, n)
  }

  fn queue(remote: &Arc<FakeRemote>) -> MutationQueue {
    let policy = RetryPolicy {
      base_delay: Duration::from_secs(10),
      max_delay: Duration::from_secs(60),
      max_attempts: None,
    };
    MutationQueue::new(remote.clone(), policy)
  }

  async fn settle() {
    for _ in 0..10 {
      tokio::task::yield_now().await;
    }
  }

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy {
      base_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(4),
      max_attempts: None,
    };
    assert_eq!(policy.backoff(1), Duration::from_millis(500));
    assert_eq!(policy.backoff(2), Duration::from_secs(1));
    assert_eq!(policy.backoff(4), Duration::from_secs(4));
    assert_eq!(policy.backoff(40), Duration::from_secs(4));
  }

  #[tokio::test]
  async fn test_operations_applied_in_enqueue_order() {
    let remote = Arc::new(FakeRemote::default());
    let queue = queue(&remote);

    let mut first = PendingOperation::add(vec![Reference::verses(VersionId(206), "GEN", 1, 1, 3)], "FF0000");
    let mut second = PendingOperation::update(vec![verse(2)], "00FF00");
    second.enqueued_at = first.enqueued_at + chrono::Duration::seconds(1);
    first.enqueued_at -= chrono::Duration::seconds(1);

    // Enqueue out of order; timestamps decide
    queue.enqueue(second);
    queue.enqueue(first);
    queue.wait_idle().await;

    assert_eq!(
      remote.calls(),
      vec![
        (OperationKind::Add, "GEN.1.1-3".to_string()),
        (OperationKind::Update, "GEN.1.2".to_string()),
      ]
    );
  }

  #[tokio::test]
  async fn test_missing_payload_fails_without_remote_call() {
    let remote = Arc::new(FakeRemote::default());
    let queue = queue(&remote);

    let op = PendingOperation::new(OperationKind::Add, vec![verse(1)], None);
    let id = op.id;
    queue.enqueue(op);
    queue.wait_idle().await;

    let outcome = queue.operation_result(&id).unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.retry_count, 0);
    assert!(remote.calls().is_empty());
    assert_eq!(queue.failed_operation_count(), 0);
  }

  #[tokio::test]
  async fn test_failed_operation_requeued_then_cleared_by_retry() {
    let remote = Arc::new(FakeRemote::default());
    remote.offline.store(true, Ordering::SeqCst);
    let queue = queue(&remote);

    let op = PendingOperation::remove(vec![verse(4)]);
    let id = op.id;
    queue.enqueue(op);
    settle().await;

    // Sitting in backoff with the operation back in the queue
    assert!(queue.is_draining());
    assert_eq!(queue.failed_operation_count(), 1);
    assert_eq!(queue.pending_operations().len(), 1);
    let outcome = queue.operation_result(&id).unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.retry_count, 1);

    remote.offline.store(false, Ordering::SeqCst);
    queue.retry_failed_operations();
    queue.wait_idle().await;

    assert_eq!(queue.failed_operation_count(), 0);
    assert!(queue.pending_operations().is_empty());
    let outcome = queue.operation_result(&id).unwrap();
    assert!(outcome.success);
    assert_eq!(remote.calls(), vec![(OperationKind::Remove, "GEN.1.4".to_string())]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_until_server_returns() {
    let remote = Arc::new(FakeRemote::default());
    remote.offline.store(true, Ordering::SeqCst);
    let queue = queue(&remote);

    let op = PendingOperation::add(vec![verse(1)], "FF0000");
    let id = op.id;
    queue.enqueue(op);

    // Several backoff rounds pass on the paused clock
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(queue.operation_result(&id).unwrap().retry_count >= 3);

    remote.offline.store(false, Ordering::SeqCst);
    queue.wait_idle().await;
    assert!(queue.operation_result(&id).unwrap().success);
  }

  #[tokio::test(start_paused = true)]
  async fn test_max_attempts_sets_operation_aside() {
    let remote = Arc::new(FakeRemote::default());
    remote.offline.store(true, Ordering::SeqCst);
    let queue = MutationQueue::new(
      remote.clone(),
      RetryPolicy {
        max_attempts: Some(2),
        ..RetryPolicy::default()
      },
    );

    queue.enqueue(PendingOperation::add(vec![verse(1)], "FF0000"));
    queue.wait_idle().await;

    assert_eq!(queue.abandoned_operations().len(), 1);
    assert_eq!(queue.failed_operation_count(), 1);

    remote.offline.store(false, Ordering::SeqCst);
    queue.retry_failed_operations();
    queue.wait_idle().await;
    assert!(queue.abandoned_operations().is_empty());
    assert_eq!(remote.calls(), vec![(OperationKind::Add, "GEN.1.1".to_string())]);
  }

  #[tokio::test]
  async fn test_withdraw_unsent_add() {
    let remote = Arc::new(FakeRemote::default());
    let queue = queue(&remote);

    // No await between enqueue and withdraw: the drain task has not run yet
    queue.enqueue(PendingOperation::add(vec![verse(1), verse(2)], "FF0000"));
    assert!(queue.withdraw_add(&verse(1)));
    queue.wait_idle().await;

    assert_eq!(remote.calls(), vec![(OperationKind::Add, "GEN.1.2".to_string())]);
    assert!(!queue.withdraw_add(&verse(2)));
  }

  #[tokio::test]
  async fn test_withdraw_reports_earlier_create() {
    let remote = Arc::new(FakeRemote::default());
    let queue = queue(&remote);

    queue.enqueue(PendingOperation::add(vec![verse(1)], "FF0000"));
    queue.wait_idle().await;

    // A second add is withdrawn, but the first one is on the server
    queue.enqueue(PendingOperation::add(vec![verse(1)], "00FF00"));
    assert!(!queue.withdraw_add(&verse(1)));
    assert!(queue.pending_operations().is_empty());

    queue.enqueue(PendingOperation::remove(vec![verse(1)]));
    queue.wait_idle().await;
    queue.enqueue(PendingOperation::add(vec![verse(1)], "0000FF"));
    assert!(queue.withdraw_add(&verse(1)));
  }

  #[tokio::test]
  async fn test_drain_is_single_flight() {
    let remote = Arc::new(FakeRemote::default());
    let queue = queue(&remote);

    queue.enqueue(PendingOperation::add(vec![verse(1)], "FF0000"));
    // The spawned drain holds the slot; this one returns immediately
    queue.drain().await;
    queue.wait_idle().await;
    assert_eq!(remote.calls().len(), 1);
  }
}

//! # Offline Queue
//!
//! Ordered, durable queue of local ChangeSets waiting to be pushed.
//!
//! ## Action State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   enqueue ──► Pending ──► InFlight ──ack──► Acknowledged (removed)     │
//! │                  ▲            │                                         │
//! │                  │            ├──fail, retry_count < max──┐             │
//! │                  │            │                           ▼             │
//! │                  └────────────┼────── Pending (next_attempt_at set)     │
//! │                               │                                         │
//! │                               └──fail, retry_count = max──► Abandoned  │
//! │                                                             (removed,  │
//! │                                                              reported) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Drain
//! Head to tail, one action at a time. The drain stops (without skipping
//! ahead) when:
//! - the head is not due yet (`next_attempt_at` in the future)
//! - the head's push failed and will be retried later
//! - the adapter has no session (no retry is charged)
//!
//! An abandoned head is removed and the drain moves on to the next entry.
//!
//! ## Concurrency
//! The in-memory mirror sits behind a lock that is never held across a
//! push. Enqueue only appends at the tail while the drain only removes or
//! rewrites the head it pushed, so the two never touch the same entry.
//! Every mutation is written through to the [`LocalStore`] first.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hearth_core::{ChangeSet, ChangeVersion, Clock, RetryDecision, RetryPolicy, SyncAction};

use crate::adapter::SyncAdapter;
use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;

// =============================================================================
// Drain Report
// =============================================================================

/// An action removed after reaching the retry ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct AbandonedAction {
    pub action: SyncAction,
    pub error: String,
}

/// Why a drain stopped before emptying the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStop {
    /// The queue is empty.
    Drained,
    /// The head is scheduled for a later retry.
    Deferred,
    /// The head's push failed; it stays at the head.
    Failed,
    /// The adapter has no session.
    Disconnected,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub pushed: usize,
    pub failed: usize,
    pub abandoned: Vec<AbandonedAction>,
    pub stopped: DrainStop,
    pub last_error: Option<String>,
}

impl Default for DrainReport {
    fn default() -> Self {
        DrainReport {
            pushed: 0,
            failed: 0,
            abandoned: Vec::new(),
            stopped: DrainStop::Drained,
            last_error: None,
        }
    }
}

// =============================================================================
// Offline Queue
// =============================================================================

/// Exclusive owner of the household's pending SyncActions.
#[derive(Debug)]
pub struct OfflineQueue {
    store: Arc<dyn LocalStore>,
    policy: RetryPolicy,
    pending: Mutex<VecDeque<SyncAction>>,
}

impl OfflineQueue {
    /// Opens the queue, restoring whatever the store persisted.
    pub async fn open(store: Arc<dyn LocalStore>, policy: RetryPolicy) -> SyncResult<Self> {
        let restored = store.load_queue().await?;
        if !restored.is_empty() {
            info!(pending = restored.len(), "Restored offline queue");
        }

        Ok(OfflineQueue {
            store,
            policy,
            pending: Mutex::new(restored.into()),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Appends a change at the tail.
    ///
    /// The change is ordered after every version of its entity this device
    /// already knows (queued or cached), so replaying the queue anywhere
    /// gives the same result as applying the mutations in order.
    pub async fn enqueue(&self, change: ChangeSet, clock: &dyn Clock) -> SyncResult<SyncAction> {
        let mut pending = self.pending.lock().await;

        let queued = pending
            .iter()
            .filter(|a| a.change_set().same_entity(&change))
            .map(|a| a.change_set().version())
            .max();
        let cached = self
            .store
            .entity(change.entity_type(), change.entity_id())
            .await?
            .map(|record| record.version);
        let change = match queued.max(cached) {
            Some(floor) if change.version() <= floor => {
                debug!(
                    entity_id = %change.entity_id(),
                    requested = %change.timestamp(),
                    floor = %floor.timestamp,
                    "Local change stamped after known version"
                );
                change.ordered_after(&floor)
            }
            _ => change,
        };

        let action = SyncAction::new(change, clock.now());
        self.store.enqueue(&action).await?;
        pending.push_back(action.clone());

        debug!(
            action_id = %action.id(),
            entity_type = %action.change_set().entity_type(),
            entity_id = %action.change_set().entity_id(),
            operation = %action.change_set().operation(),
            pending = pending.len(),
            "Enqueued local change"
        );
        Ok(action)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Copy of the queue, head first.
    pub async fn snapshot(&self) -> Vec<SyncAction> {
        self.pending.lock().await.iter().cloned().collect()
    }

    /// Pushes the queue head to tail through `adapter`.
    ///
    /// Transport failures are absorbed into the report; only storage
    /// failures are returned as errors.
    pub async fn drain(&self, adapter: &dyn SyncAdapter, clock: &dyn Clock) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();

        loop {
            let Some(head) = self.pending.lock().await.front().cloned() else {
                report.stopped = DrainStop::Drained;
                break;
            };

            if !adapter.is_connected() {
                debug!("Adapter disconnected, stopping drain");
                report.stopped = DrainStop::Disconnected;
                break;
            }

            if !head.is_due(clock.now()) {
                debug!(
                    action_id = %head.id(),
                    next_attempt_at = ?head.next_attempt_at(),
                    "Head not due yet, stopping drain"
                );
                report.stopped = DrainStop::Deferred;
                break;
            }

            match adapter.push(head.change_set()).await {
                Ok(()) => {
                    self.remove(head.id()).await?;
                    report.pushed += 1;
                    debug!(action_id = %head.id(), entity_id = %head.change_set().entity_id(), "Pushed");
                }
                Err(SyncError::NotConnected) => {
                    report.stopped = DrainStop::Disconnected;
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let reason = e.to_string();
                    report.last_error = Some(reason.clone());

                    let mut action = head;
                    match action.record_failure(&self.policy, clock.now(), reason.clone()) {
                        RetryDecision::RetryAt(at) => {
                            warn!(
                                action_id = %action.id(),
                                entity_id = %action.change_set().entity_id(),
                                retry_count = action.retry_count(),
                                retry_at = %at,
                                error = %reason,
                                "Push failed, will retry"
                            );
                            self.replace(action).await?;
                            report.failed += 1;
                            report.stopped = DrainStop::Failed;
                            break;
                        }
                        RetryDecision::Abandon => {
                            warn!(
                                action_id = %action.id(),
                                entity_id = %action.change_set().entity_id(),
                                retry_count = action.retry_count(),
                                error = %reason,
                                "Retry ceiling reached, abandoning action"
                            );
                            self.remove(action.id()).await?;
                            report.abandoned.push(AbandonedAction {
                                action,
                                error: reason,
                            });
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Removes pending actions on `incoming`'s entity that lose to it.
    pub async fn discard_superseded(&self, incoming: &ChangeSet) -> SyncResult<Vec<SyncAction>> {
        let mut pending = self.pending.lock().await;
        let version = incoming.version();

        let losers: Vec<SyncAction> = pending
            .iter()
            .filter(|a| a.change_set().same_entity(incoming) && a.change_set().version() < version)
            .cloned()
            .collect();

        for action in &losers {
            self.store.remove_action(action.id()).await?;
            pending.retain(|a| a.id() != action.id());
        }

        Ok(losers)
    }

    /// Newest version among pending actions on `incoming`'s entity.
    pub async fn latest_pending_version(&self, incoming: &ChangeSet) -> Option<ChangeVersion> {
        self.pending
            .lock()
            .await
            .iter()
            .filter(|a| a.change_set().same_entity(incoming))
            .map(|a| a.change_set().version())
            .max()
    }

    async fn remove(&self, id: &str) -> SyncResult<()> {
        let mut pending = self.pending.lock().await;
        self.store.remove_action(id).await?;
        pending.retain(|a| a.id() != id);
        Ok(())
    }

    async fn replace(&self, action: SyncAction) -> SyncResult<()> {
        let mut pending = self.pending.lock().await;
        self.store.update_action(&action).await?;
        if let Some(slot) = pending.iter_mut().find(|a| a.id() == action.id()) {
            *slot = action;
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{LocalAdapter, MemoryAdapter, MemoryBackend};
    use crate::store::{MemoryStore, SqliteStore};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use hearth_core::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(3, std::time::Duration::from_secs(5))
    }

    async fn queue() -> OfflineQueue {
        OfflineQueue::open(Arc::new(MemoryStore::new()), policy())
            .await
            .unwrap()
    }

    async fn connected(backend: &MemoryBackend) -> MemoryAdapter {
        let adapter = MemoryAdapter::new(backend.clone());
        adapter.connect("h1", "A").await.unwrap();
        adapter
    }

    fn update(id: &str, n: i64, at: DateTime<Utc>) -> ChangeSet {
        ChangeSet::update("expense", id, json!({ "n": n }), at, "A").unwrap()
    }

    #[tokio::test]
    async fn test_drain_preserves_mutation_order() {
        let clock = ManualClock::new(t0());
        let queue = queue().await;
        let backend = MemoryBackend::new();
        let adapter = connected(&backend).await;

        for n in 1..=5 {
            queue.enqueue(update("e1", n, t0()), &clock).await.unwrap();
        }
        queue
            .enqueue(ChangeSet::delete("expense", "e1", t0() + Duration::seconds(1), "A").unwrap(), &clock)
            .await
            .unwrap();
        queue
            .enqueue(
                ChangeSet::create("expense", "e1", json!({"n": 9}), t0() + Duration::seconds(2), "A")
                    .unwrap(),
                &clock,
            )
            .await
            .unwrap();

        let report = queue.drain(&adapter, &clock).await.unwrap();

        assert_eq!(report.pushed, 7);
        assert_eq!(report.stopped, DrainStop::Drained);
        assert_eq!(queue.pending_count().await, 0);
        let doc = backend.document("h1", "expense", "e1").unwrap();
        assert_eq!(doc.payload(), &json!({"n": 9}));
    }

    #[tokio::test]
    async fn test_sequential_timestamps_replay_like_direct_application() {
        let clock = ManualClock::new(t0());
        let queue = queue().await;
        let backend = MemoryBackend::new();
        let adapter = connected(&backend).await;

        let direct = MemoryBackend::new();
        for n in 0..6 {
            let change = update("e1", n, t0() + Duration::seconds(n));
            direct.commit("h1", &change).unwrap();
            queue.enqueue(change, &clock).await.unwrap();
        }

        queue.drain(&adapter, &clock).await.unwrap();
        assert_eq!(
            backend.document("h1", "expense", "e1"),
            direct.document("h1", "expense", "e1")
        );
    }

    #[tokio::test]
    async fn test_edits_at_the_same_instant_keep_their_order() {
        let clock = ManualClock::new(t0());
        let queue = queue().await;
        let backend = MemoryBackend::new();
        let adapter = connected(&backend).await;

        queue.enqueue(update("e1", 1, t0()), &clock).await.unwrap();
        let second = queue.enqueue(update("e1", 2, t0()), &clock).await.unwrap();
        assert!(second.change_set().timestamp() > t0());

        let report = queue.drain(&adapter, &clock).await.unwrap();
        assert_eq!(report.pushed, 2);
        let doc = backend.document("h1", "expense", "e1").unwrap();
        assert_eq!(doc.payload(), &json!({ "n": 2 }));
    }

    #[tokio::test]
    async fn test_edit_after_newer_cached_version_still_wins() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::open(store.clone(), policy()).await.unwrap();

        // A remote edit stamped ahead of this device's clock is already cached.
        let ahead = t0() + Duration::seconds(30);
        let remote = ChangeSet::update("expense", "e1", json!({ "n": 1 }), ahead, "B").unwrap();
        store.apply_remote(&remote).await.unwrap();

        let local = queue.enqueue(update("e1", 2, t0()), &clock).await.unwrap();
        assert!(local.change_set().version() > remote.version());
        let record = store.entity("expense", "e1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({ "n": 2 }));
    }

    #[tokio::test]
    async fn test_sub_millisecond_edits_replay_in_order_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.db");
        let clock = ManualClock::new(t0());
        let backend = MemoryBackend::new();

        {
            let store = Arc::new(SqliteStore::open(Some(path.clone()), "h1").await.unwrap());
            let queue = OfflineQueue::open(store.clone(), policy()).await.unwrap();
            let create = ChangeSet::create(
                "expense",
                "e1",
                json!({ "n": 1 }),
                t0() + Duration::microseconds(100),
                "A",
            )
            .unwrap();
            queue.enqueue(create, &clock).await.unwrap();
            queue
                .enqueue(update("e1", 2, t0() + Duration::microseconds(400)), &clock)
                .await
                .unwrap();
            store.database().close().await;
        }

        let store = Arc::new(SqliteStore::open(Some(path), "h1").await.unwrap());
        let queue = OfflineQueue::open(store.clone(), policy()).await.unwrap();
        let adapter = connected(&backend).await;

        let report = queue.drain(&adapter, &clock).await.unwrap();
        assert_eq!(report.pushed, 2);
        let doc = backend.document("h1", "expense", "e1").unwrap();
        assert_eq!(doc.payload(), &json!({ "n": 2 }));
        let cached = store.entity("expense", "e1").await.unwrap().unwrap();
        assert_eq!(cached.payload, json!({ "n": 2 }));
    }

    #[tokio::test]
    async fn test_failure_stops_drain_and_schedules_retry() {
        let clock = ManualClock::new(t0());
        let queue = queue().await;
        let backend = MemoryBackend::new();
        let adapter = connected(&backend).await;
        backend.reject_entity("bad");

        queue.enqueue(update("bad", 1, t0()), &clock).await.unwrap();
        queue.enqueue(update("good", 1, t0()), &clock).await.unwrap();

        let report = queue.drain(&adapter, &clock).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.stopped, DrainStop::Failed);
        assert!(report.last_error.is_some());

        let head = &queue.snapshot().await[0];
        assert_eq!(head.retry_count(), 1);
        assert_eq!(head.next_attempt_at(), Some(t0() + Duration::seconds(5)));
        assert!(backend.document("h1", "expense", "good").is_none());

        // Not due yet: nothing is pushed, nothing is charged.
        let report = queue.drain(&adapter, &clock).await.unwrap();
        assert_eq!(report.stopped, DrainStop::Deferred);
        assert_eq!(queue.snapshot().await[0].retry_count(), 1);

        backend.accept_entity("bad");
        clock.advance(Duration::seconds(5));
        let report = queue.drain(&adapter, &clock).await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_retry_ceiling_abandons_after_max_attempts() {
        let clock = ManualClock::new(t0());
        let queue = queue().await;
        let backend = MemoryBackend::new();
        let adapter = connected(&backend).await;
        backend.reject_entity("bad");

        queue.enqueue(update("bad", 1, t0()), &clock).await.unwrap();
        queue.enqueue(update("next", 1, t0()), &clock).await.unwrap();

        let mut abandoned = Vec::new();
        for _ in 0..3 {
            let report = queue.drain(&adapter, &clock).await.unwrap();
            abandoned.extend(report.abandoned);
            clock.advance(Duration::seconds(5));
        }

        assert_eq!(backend.commit_count(), 1);
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].action.change_set().entity_id(), "bad");
        assert_eq!(abandoned[0].action.retry_count(), 3);

        // The entry behind the abandoned one went through on the same pass.
        assert_eq!(queue.pending_count().await, 0);
        assert!(backend.document("h1", "expense", "next").is_some());
        assert!(backend.document("h1", "expense", "bad").is_none());
    }

    #[tokio::test]
    async fn test_disconnected_adapter_charges_nothing() {
        let clock = ManualClock::new(t0());
        let queue = queue().await;
        let adapter = MemoryAdapter::new(MemoryBackend::new());

        queue.enqueue(update("e1", 1, t0()), &clock).await.unwrap();
        let report = queue.drain(&adapter, &clock).await.unwrap();

        assert_eq!(report.stopped, DrainStop::Disconnected);
        assert_eq!(queue.snapshot().await[0].retry_count(), 0);
    }

    #[tokio::test]
    async fn test_local_adapter_drains_everything() {
        let clock = ManualClock::new(t0());
        let queue = queue().await;
        let adapter = LocalAdapter::new();
        adapter.connect("h1", "A").await.unwrap();

        for n in 0..3 {
            queue.enqueue(update("e1", n, t0()), &clock).await.unwrap();
        }
        let report = queue.drain(&adapter, &clock).await.unwrap();

        assert_eq!(report.pushed, 3);
        assert_eq!(adapter.stats().total_pushed, 3);
    }

    #[tokio::test]
    async fn test_storage_failure_is_fatal() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::open(store.clone(), policy()).await.unwrap();
        let backend = MemoryBackend::new();
        let adapter = connected(&backend).await;

        queue.enqueue(update("e1", 1, t0()), &clock).await.unwrap();
        store.set_fail_writes(true);

        let err = queue.drain(&adapter, &clock).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(queue.enqueue(update("e2", 1, t0()), &clock).await.is_err());
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_discard_superseded() {
        let clock = ManualClock::new(t0());
        let queue = queue().await;

        queue.enqueue(update("e1", 1, t0()), &clock).await.unwrap();
        queue
            .enqueue(update("e1", 2, t0() + Duration::seconds(10)), &clock)
            .await
            .unwrap();
        queue.enqueue(update("e2", 1, t0()), &clock).await.unwrap();

        let remote = ChangeSet::update("expense", "e1", json!({}), t0() + Duration::seconds(5), "B")
            .unwrap();
        assert_eq!(
            queue.latest_pending_version(&remote).await.map(|v| v.timestamp),
            Some(t0() + Duration::seconds(10))
        );

        let dropped = queue.discard_superseded(&remote).await.unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].change_set().timestamp(), t0());
        assert_eq!(queue.pending_count().await, 2);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.db");
        let clock = ManualClock::new(t0());

        {
            let store = Arc::new(SqliteStore::open(Some(path.clone()), "h1").await.unwrap());
            let queue = OfflineQueue::open(store.clone(), policy()).await.unwrap();
            queue.enqueue(update("e1", 1, t0()), &clock).await.unwrap();
            queue.enqueue(update("e2", 1, t0()), &clock).await.unwrap();
            store.database().close().await;
        }

        let store = Arc::new(SqliteStore::open(Some(path), "h1").await.unwrap());
        let queue = OfflineQueue::open(store, policy()).await.unwrap();
        let ids: Vec<String> = queue
            .snapshot()
            .await
            .iter()
            .map(|a| a.change_set().entity_id().to_string())
            .collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }
}

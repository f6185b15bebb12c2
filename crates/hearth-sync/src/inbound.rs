//! # Inbound Changes
//!
//! Applies a pulled batch to local state, resolving conflicts against
//! pending local actions first.
//!
//! ## Per-Change Resolution
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  for each pulled change, in the order the backend returned them:       │
//! │                                                                         │
//! │  1. Pending local actions on the same entity that are OLDER            │
//! │     → removed from the queue (the remote change supersedes them)       │
//! │                                                                         │
//! │  2. A pending local action on the same entity that is NEWER            │
//! │     → remote change discarded; the local one will be pushed            │
//! │                                                                         │
//! │  3. Otherwise → LWW apply to the entity cache                          │
//! │     (no-op if the cache already holds an equal or newer version)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entities are resolved independently; nothing is rolled back across
//! entities.

use tracing::{debug, warn};

use hearth_core::{ChangeSet, ConflictMode, Resolution, SyncAction};

use crate::error::SyncResult;
use crate::queue::OfflineQueue;
use crate::store::LocalStore;

/// What happened to one pulled batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundReport {
    /// Remote changes written to the entity cache.
    pub applied: usize,
    /// Remote changes that lost to local state.
    pub skipped: usize,
    /// Pending local actions dropped because a remote change won.
    pub superseded: Vec<SyncAction>,
}

/// Applies pulled changes under the configured conflict mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct InboundApplier {
    mode: ConflictMode,
}

impl InboundApplier {
    pub fn new(mode: ConflictMode) -> Self {
        InboundApplier { mode }
    }

    pub async fn apply_batch(
        &self,
        changes: &[ChangeSet],
        queue: &OfflineQueue,
        store: &dyn LocalStore,
    ) -> SyncResult<InboundReport> {
        let mut report = InboundReport::default();

        for change in changes {
            if self.local_wins(change, queue).await? {
                debug!(
                    entity_type = %change.entity_type(),
                    entity_id = %change.entity_id(),
                    "Remote change loses to pending local change"
                );
                report.skipped += 1;
                continue;
            }

            let superseded = queue.discard_superseded(change).await?;
            for action in &superseded {
                warn!(
                    action_id = %action.id(),
                    entity_id = %change.entity_id(),
                    remote_user = %change.origin_user_id(),
                    "Pending local change superseded by a newer remote change"
                );
            }
            report.superseded.extend(superseded);

            if store.apply_remote(change).await? {
                report.applied += 1;
            } else {
                report.skipped += 1;
            }
        }

        Ok(report)
    }

    async fn local_wins(&self, change: &ChangeSet, queue: &OfflineQueue) -> SyncResult<bool> {
        match queue.latest_pending_version(change).await {
            Some(pending) => Ok(self.mode.resolve(&change.version(), &pending)? == Resolution::Existing),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use hearth_core::{ManualClock, RetryPolicy};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn t5() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 5).unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, OfflineQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::open(store.clone(), RetryPolicy::default())
            .await
            .unwrap();
        (store, queue)
    }

    #[tokio::test]
    async fn test_pulled_delete_wins_in_either_order() {
        let update = ChangeSet::update("expense", "e2", json!({"amount": 3}), t5(), "A").unwrap();
        let delete =
            ChangeSet::delete("expense", "e2", t5() + Duration::milliseconds(1), "B").unwrap();
        let applier = InboundApplier::default();

        for batch in [
            vec![update.clone(), delete.clone()],
            vec![delete.clone(), update.clone()],
        ] {
            let (store, queue) = setup().await;
            applier.apply_batch(&batch, &queue, store.as_ref()).await.unwrap();

            let record = store.entity("expense", "e2").await.unwrap().unwrap();
            assert!(record.deleted);
            assert!(store.entities("expense").await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_newer_pending_local_beats_remote() {
        let (store, queue) = setup().await;
        let clock = ManualClock::new(t5());
        let local = ChangeSet::update("chore", "c1", json!({"done": true}), t5(), "A").unwrap();
        queue.enqueue(local, &clock).await.unwrap();

        let remote = ChangeSet::update(
            "chore",
            "c1",
            json!({"done": false}),
            t5() - Duration::seconds(1),
            "B",
        )
        .unwrap();
        let report = InboundApplier::default()
            .apply_batch(&[remote], &queue, store.as_ref())
            .await
            .unwrap();

        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(queue.pending_count().await, 1);
        let record = store.entity("chore", "c1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"done": true}));
    }

    #[tokio::test]
    async fn test_newer_remote_supersedes_pending_local() {
        let (store, queue) = setup().await;
        let clock = ManualClock::new(t5());
        let local = ChangeSet::update("chore", "c1", json!({"done": true}), t5(), "A").unwrap();
        queue.enqueue(local, &clock).await.unwrap();

        let remote = ChangeSet::update(
            "chore",
            "c1",
            json!({"done": false}),
            t5() + Duration::seconds(1),
            "B",
        )
        .unwrap();
        let report = InboundApplier::default()
            .apply_batch(&[remote], &queue, store.as_ref())
            .await
            .unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.superseded.len(), 1);
        assert_eq!(queue.pending_count().await, 0);
        let record = store.entity("chore", "c1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"done": false}));
    }

    #[tokio::test]
    async fn test_echo_of_own_change_is_noop() {
        let (store, queue) = setup().await;
        let change = ChangeSet::create("chore", "c1", json!({}), t5(), "A").unwrap();
        store.apply_remote(&change).await.unwrap();

        let report = InboundApplier::default()
            .apply_batch(&[change], &queue, store.as_ref())
            .await
            .unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_manual_mode_is_rejected_on_conflict() {
        let (store, queue) = setup().await;
        let clock = ManualClock::new(t5());
        queue
            .enqueue(ChangeSet::update("chore", "c1", json!({}), t5(), "A").unwrap(), &clock)
            .await
            .unwrap();

        let remote =
            ChangeSet::update("chore", "c1", json!({}), t5() - Duration::seconds(1), "B").unwrap();
        let result = InboundApplier::new(ConflictMode::Manual)
            .apply_batch(&[remote], &queue, store.as_ref())
            .await;

        assert!(result.is_err());
        assert_eq!(queue.pending_count().await, 1);
    }
}

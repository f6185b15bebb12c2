//! # In-Process Backend
//!
//! A shared document store that honours the backend contract, plus the
//! adapter that talks to it. Several orchestrators holding adapters onto
//! one [`MemoryBackend`] behave like devices sharing a household.
//!
//! ## Backend Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  household ──► documents: (entity_type, entity_id) → latest ChangeSet  │
//! │            └─► presence:  user_id → PresenceInfo                       │
//! │                                                                         │
//! │  commit(change)                                                        │
//! │     stored.version >= change.version  → keep stored, still ACK         │
//! │     otherwise                          → replace (Delete = tombstone)  │
//! │                                                                         │
//! │  Re-sending an acknowledged change is therefore harmless.              │
//! │                                                                         │
//! │  changes_since(since) → documents with timestamp >= since,             │
//! │                         ordered by (timestamp, origin_user_id)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fault Injection
//! - `set_unreachable`: every call fails as a transport error
//! - `reject_entity`: pushes for that entity id are refused
//! - `lose_next_acks`: the next N commits apply but report failure

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use hearth_core::{ChangeSet, ConnectionStatus, PresenceInfo, PresenceStatus};

use super::{AdapterCounters, AdapterStats, SessionState, SyncAdapter};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Backend
// =============================================================================

#[derive(Debug, Default)]
struct HouseholdDocs {
    documents: BTreeMap<(String, String), ChangeSet>,
    presence: HashMap<String, PresenceInfo>,
}

#[derive(Debug, Default)]
struct Faults {
    unreachable: bool,
    rejected: HashSet<String>,
    lost_acks: u32,
}

#[derive(Debug, Default)]
struct BackendState {
    households: HashMap<String, HouseholdDocs>,
    faults: Faults,
    commits: u64,
}

/// Shared in-process document store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_reachable(state: &BackendState) -> Result<(), String> {
        if state.faults.unreachable {
            Err("backend unreachable".to_string())
        } else {
            Ok(())
        }
    }

    /// Upserts one change under Last-Write-Wins.
    pub fn commit(&self, household_id: &str, change: &ChangeSet) -> Result<(), String> {
        let mut state = self.lock();
        Self::ensure_reachable(&state)?;

        if state.faults.rejected.contains(change.entity_id()) {
            return Err(format!("entity {} rejected by backend", change.entity_id()));
        }

        let key = (
            change.entity_type().to_string(),
            change.entity_id().to_string(),
        );
        let docs = state
            .households
            .entry(household_id.to_string())
            .or_default();

        let newer = docs
            .documents
            .get(&key)
            .map_or(true, |stored| change.version() > stored.version());
        if newer {
            docs.documents.insert(key, change.clone());
        }
        state.commits += 1;

        if state.faults.lost_acks > 0 {
            state.faults.lost_acks -= 1;
            return Err("acknowledgement lost".to_string());
        }
        Ok(())
    }

    /// Documents with `timestamp >= since`, oldest first.
    pub fn changes_since(
        &self,
        household_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChangeSet>, String> {
        let state = self.lock();
        Self::ensure_reachable(&state)?;

        let mut changes: Vec<ChangeSet> = state
            .households
            .get(household_id)
            .map(|docs| {
                docs.documents
                    .values()
                    .filter(|c| since.map_or(true, |s| c.timestamp() >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        changes.sort_by_key(|c| c.version());
        Ok(changes)
    }

    pub fn set_presence(&self, info: PresenceInfo) -> Result<(), String> {
        let mut state = self.lock();
        Self::ensure_reachable(&state)?;
        state
            .households
            .entry(info.household_id.clone())
            .or_default()
            .presence
            .insert(info.user_id.clone(), info);
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Stored document (tombstones included).
    pub fn document(&self, household_id: &str, entity_type: &str, entity_id: &str) -> Option<ChangeSet> {
        self.lock().households.get(household_id).and_then(|docs| {
            docs.documents
                .get(&(entity_type.to_string(), entity_id.to_string()))
                .cloned()
        })
    }

    /// Live (non-deleted) documents of one type.
    pub fn live_documents(&self, household_id: &str, entity_type: &str) -> Vec<ChangeSet> {
        self.lock()
            .households
            .get(household_id)
            .map(|docs| {
                docs.documents
                    .values()
                    .filter(|c| c.entity_type() == entity_type && !c.is_delete())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn presence(&self, household_id: &str) -> Vec<PresenceInfo> {
        let mut board: Vec<PresenceInfo> = self
            .lock()
            .households
            .get(household_id)
            .map(|docs| docs.presence.values().cloned().collect())
            .unwrap_or_default();
        board.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        board
    }

    /// Number of commits that reached the store.
    pub fn commit_count(&self) -> u64 {
        self.lock().commits
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().faults.unreachable = unreachable;
    }

    pub fn reject_entity(&self, entity_id: &str) {
        self.lock().faults.rejected.insert(entity_id.to_string());
    }

    pub fn accept_entity(&self, entity_id: &str) {
        self.lock().faults.rejected.remove(entity_id);
    }

    /// The next `count` commits are applied but reported as failed.
    pub fn lose_next_acks(&self, count: u32) {
        self.lock().faults.lost_acks = count;
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Adapter onto a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryAdapter {
    backend: MemoryBackend,
    session: SessionState,
    counters: AdapterCounters,
}

impl MemoryAdapter {
    pub fn new(backend: MemoryBackend) -> Self {
        MemoryAdapter {
            backend,
            session: SessionState::default(),
            counters: AdapterCounters::default(),
        }
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    fn household(&self) -> SyncResult<String> {
        self.session
            .current()
            .map(|s| s.household_id)
            .ok_or(SyncError::NotConnected)
    }
}

#[async_trait]
impl SyncAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, household_id: &str, user_id: &str) -> SyncResult<()> {
        if self.session.is_open_for(household_id, user_id) {
            return Ok(());
        }
        if self.backend.lock().faults.unreachable {
            return Err(SyncError::Connection("backend unreachable".into()));
        }
        self.session.open(household_id, user_id);
        debug!(household_id = %household_id, user_id = %user_id, "Memory adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> SyncResult<()> {
        self.session.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_open()
    }

    async fn push(&self, change: &ChangeSet) -> SyncResult<()> {
        let household = self.household()?;
        let started = Instant::now();

        match self.backend.commit(&household, change) {
            Ok(()) => {
                self.counters.record_push();
                self.session.heartbeat(started.elapsed());
                Ok(())
            }
            Err(reason) => {
                warn!(entity_id = %change.entity_id(), %reason, "Memory push failed");
                Err(SyncError::push(change.entity_id(), reason))
            }
        }
    }

    async fn pull(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<ChangeSet>> {
        let household = self.household()?;
        let started = Instant::now();

        let changes = self
            .backend
            .changes_since(&household, since)
            .map_err(SyncError::Pull)?;

        self.counters.record_pull(changes.len());
        self.session.heartbeat(started.elapsed());
        Ok(changes)
    }

    async fn update_presence(&self, status: PresenceStatus) -> SyncResult<()> {
        let session = self.session.current().ok_or(SyncError::NotConnected)?;
        let info = PresenceInfo::new(session.household_id, session.user_id, status, Utc::now());
        self.backend.set_presence(info).map_err(SyncError::Connection)
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.session.status()
    }

    fn stats(&self) -> AdapterStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 20, 0, 0).unwrap()
    }

    #[test]
    fn test_commit_is_idempotent() {
        let backend = MemoryBackend::new();
        let change = ChangeSet::create("expense", "e1", json!({"amount": 9}), t0(), "A").unwrap();

        backend.commit("h1", &change).unwrap();
        let once = backend.changes_since("h1", None).unwrap();

        backend.commit("h1", &change).unwrap();
        assert_eq!(backend.changes_since("h1", None).unwrap(), once);
        assert_eq!(backend.commit_count(), 2);
    }

    #[test]
    fn test_commit_keeps_newest_version() {
        let backend = MemoryBackend::new();
        let delete = ChangeSet::delete("expense", "e2", t0() + Duration::milliseconds(1), "B")
            .unwrap();
        let update = ChangeSet::update("expense", "e2", json!({"amount": 3}), t0(), "A").unwrap();

        backend.commit("h1", &delete).unwrap();
        backend.commit("h1", &update).unwrap();

        assert_eq!(backend.document("h1", "expense", "e2"), Some(delete));
        assert!(backend.live_documents("h1", "expense").is_empty());
    }

    #[test]
    fn test_changes_since_filters_and_orders() {
        let backend = MemoryBackend::new();
        let late = ChangeSet::create("chore", "c2", json!({}), t0() + Duration::seconds(10), "A")
            .unwrap();
        let early = ChangeSet::create("chore", "c1", json!({}), t0(), "A").unwrap();
        backend.commit("h1", &late).unwrap();
        backend.commit("h1", &early).unwrap();

        assert_eq!(
            backend.changes_since("h1", None).unwrap(),
            vec![early.clone(), late.clone()]
        );
        assert_eq!(
            backend
                .changes_since("h1", Some(t0() + Duration::seconds(10)))
                .unwrap(),
            vec![late]
        );
        assert!(backend.changes_since("other", None).unwrap().is_empty());
    }

    #[test]
    fn test_lost_ack_still_commits() {
        let backend = MemoryBackend::new();
        let change = ChangeSet::create("expense", "e1", json!({"amount": 1}), t0(), "A").unwrap();

        backend.lose_next_acks(1);
        assert!(backend.commit("h1", &change).is_err());
        assert_eq!(backend.document("h1", "expense", "e1"), Some(change.clone()));
        assert!(backend.commit("h1", &change).is_ok());
    }

    #[tokio::test]
    async fn test_adapter_requires_session() {
        let adapter = MemoryAdapter::new(MemoryBackend::new());
        let change = ChangeSet::create("expense", "e1", json!({"amount": 1}), t0(), "A").unwrap();

        assert!(matches!(adapter.push(&change).await, Err(SyncError::NotConnected)));
        assert!(matches!(adapter.pull(None).await, Err(SyncError::NotConnected)));

        adapter.connect("h1", "A").await.unwrap();
        adapter.push(&change).await.unwrap();
        assert_eq!(adapter.pull(None).await.unwrap().len(), 1);
        assert_eq!(
            adapter.stats(),
            AdapterStats {
                total_pushed: 1,
                total_pulled: 1
            }
        );
    }

    #[tokio::test]
    async fn test_adapter_surfaces_faults() {
        let backend = MemoryBackend::new();
        let adapter = MemoryAdapter::new(backend.clone());

        backend.set_unreachable(true);
        assert!(matches!(
            adapter.connect("h1", "A").await,
            Err(SyncError::Connection(_))
        ));

        backend.set_unreachable(false);
        adapter.connect("h1", "A").await.unwrap();

        backend.reject_entity("bad");
        let change = ChangeSet::create("expense", "bad", json!({}), t0(), "A").unwrap();
        let err = adapter.push(&change).await.unwrap_err();
        assert!(matches!(err, SyncError::Push { .. }));
        assert_eq!(adapter.stats().total_pushed, 0);

        backend.set_unreachable(true);
        assert!(matches!(adapter.pull(None).await, Err(SyncError::Pull(_))));
        assert!(adapter.update_presence(PresenceStatus::Online).await.is_err());
    }

    #[tokio::test]
    async fn test_presence_board() {
        let backend = MemoryBackend::new();
        let alice = MemoryAdapter::new(backend.clone());
        let bob = MemoryAdapter::new(backend.clone());
        alice.connect("h1", "alice").await.unwrap();
        bob.connect("h1", "bob").await.unwrap();

        alice.update_presence(PresenceStatus::Online).await.unwrap();
        bob.update_presence(PresenceStatus::Away).await.unwrap();

        let board = backend.presence("h1");
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].status, PresenceStatus::Online);
        assert_eq!(board[1].status, PresenceStatus::Away);
    }
}

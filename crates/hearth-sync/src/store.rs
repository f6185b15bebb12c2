//! # Local Store
//!
//! The device's durable replication state for one household: the sync
//! queue, the entity cache and the sync metadata.
//!
//! ## Persisted State
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     LocalStore (one household)                          │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────────┐  │
//! │  │   sync queue     │  │  entity cache    │  │   sync state         │  │
//! │  │  SyncAction[]    │  │ LWW winner per   │  │  last_sync           │  │
//! │  │  FIFO by seq     │  │ (type, id),      │  │  is_online           │  │
//! │  │                  │  │ tombstones kept  │  │                      │  │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────────┘  │
//! │                                                                         │
//! │  enqueue() writes queue row + cache row in one transaction             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`SqliteStore`] is the production implementation. [`MemoryStore`] keeps
//! everything in process and can be told to fail writes.
//!
//! Every storage failure surfaces as [`SyncError::QueueStorage`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use hearth_core::{ChangeSet, EntityRecord, SyncAction};
use hearth_db::{Database, DbConfig};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Trait
// =============================================================================

/// Durable local state for one household session.
#[async_trait]
pub trait LocalStore: Send + Sync + std::fmt::Debug {
    /// The persisted queue, oldest first.
    async fn load_queue(&self) -> SyncResult<Vec<SyncAction>>;

    /// Appends an action and applies its change to the entity cache.
    ///
    /// Returns true if the change won in the cache.
    async fn enqueue(&self, action: &SyncAction) -> SyncResult<bool>;

    /// Persists the retry bookkeeping of a queued action.
    async fn update_action(&self, action: &SyncAction) -> SyncResult<()>;

    /// Removes a queued action. Removing an unknown id is a no-op.
    async fn remove_action(&self, id: &str) -> SyncResult<()>;

    /// Applies a pulled change to the entity cache under Last-Write-Wins.
    async fn apply_remote(&self, change: &ChangeSet) -> SyncResult<bool>;

    /// One cached entity, tombstones included.
    async fn entity(&self, entity_type: &str, entity_id: &str)
        -> SyncResult<Option<EntityRecord>>;

    /// Live cached entities of one type.
    async fn entities(&self, entity_type: &str) -> SyncResult<Vec<EntityRecord>>;

    async fn last_sync(&self) -> SyncResult<Option<DateTime<Utc>>>;

    async fn set_last_sync(&self, at: DateTime<Utc>) -> SyncResult<()>;

    async fn is_online(&self) -> SyncResult<bool>;

    async fn set_online(&self, online: bool) -> SyncResult<()>;
}

// =============================================================================
// SQLite
// =============================================================================

/// [`LocalStore`] over the hearth SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Database,
    household_id: String,
}

impl SqliteStore {
    pub fn new(db: Database, household_id: impl Into<String>) -> Self {
        SqliteStore {
            db,
            household_id: household_id.into(),
        }
    }

    /// Opens (creating and migrating if needed) the database at `path`,
    /// or an in-memory database when `path` is `None`.
    pub async fn open(path: Option<PathBuf>, household_id: impl Into<String>) -> SyncResult<Self> {
        let config = match path {
            Some(path) => DbConfig::new(path),
            None => DbConfig::in_memory(),
        };
        let db = Database::new(config).await?;
        Ok(SqliteStore::new(db, household_id))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn household_id(&self) -> &str {
        &self.household_id
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn load_queue(&self) -> SyncResult<Vec<SyncAction>> {
        Ok(self.db.sync_queue().load(&self.household_id).await?)
    }

    async fn enqueue(&self, action: &SyncAction) -> SyncResult<bool> {
        Ok(self
            .db
            .sync_queue()
            .enqueue(&self.household_id, action)
            .await?)
    }

    async fn update_action(&self, action: &SyncAction) -> SyncResult<()> {
        Ok(self.db.sync_queue().update(action).await?)
    }

    async fn remove_action(&self, id: &str) -> SyncResult<()> {
        Ok(self.db.sync_queue().remove(id).await?)
    }

    async fn apply_remote(&self, change: &ChangeSet) -> SyncResult<bool> {
        Ok(self
            .db
            .entity_cache()
            .apply(&self.household_id, change)
            .await?)
    }

    async fn entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<Option<EntityRecord>> {
        Ok(self
            .db
            .entity_cache()
            .get(&self.household_id, entity_type, entity_id)
            .await?)
    }

    async fn entities(&self, entity_type: &str) -> SyncResult<Vec<EntityRecord>> {
        Ok(self
            .db
            .entity_cache()
            .list(&self.household_id, entity_type)
            .await?)
    }

    async fn last_sync(&self) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.db.sync_state().last_sync(&self.household_id).await?)
    }

    async fn set_last_sync(&self, at: DateTime<Utc>) -> SyncResult<()> {
        Ok(self
            .db
            .sync_state()
            .set_last_sync(&self.household_id, at)
            .await?)
    }

    async fn is_online(&self) -> SyncResult<bool> {
        Ok(self.db.sync_state().is_online(&self.household_id).await?)
    }

    async fn set_online(&self, online: bool) -> SyncResult<()> {
        Ok(self
            .db
            .sync_state()
            .set_online(&self.household_id, online)
            .await?)
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    queue: Vec<SyncAction>,
    entities: HashMap<(String, String), EntityRecord>,
    last_sync: Option<DateTime<Utc>>,
    online: bool,
    fail_writes: bool,
}

/// [`LocalStore`] held entirely in process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn writable(&self) -> SyncResult<MutexGuard<'_, MemoryState>> {
        let state = self.lock();
        if state.fail_writes {
            return Err(SyncError::QueueStorage("write rejected by store".into()));
        }
        Ok(state)
    }

    fn merge(state: &mut MemoryState, change: &ChangeSet) -> bool {
        let key = (
            change.entity_type().to_string(),
            change.entity_id().to_string(),
        );
        match EntityRecord::merge(state.entities.get(&key), change) {
            Some(record) => {
                state.entities.insert(key, record);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn load_queue(&self) -> SyncResult<Vec<SyncAction>> {
        Ok(self.lock().queue.clone())
    }

    async fn enqueue(&self, action: &SyncAction) -> SyncResult<bool> {
        let mut state = self.writable()?;
        if state.queue.iter().any(|a| a.id() == action.id()) {
            return Err(SyncError::QueueStorage(format!(
                "duplicate queue entry: {}",
                action.id()
            )));
        }

        state.queue.push(action.clone());
        Ok(Self::merge(&mut state, action.change_set()))
    }

    async fn update_action(&self, action: &SyncAction) -> SyncResult<()> {
        let mut state = self.writable()?;
        let slot = state
            .queue
            .iter_mut()
            .find(|a| a.id() == action.id())
            .ok_or_else(|| SyncError::QueueStorage(format!("queue entry {} not found", action.id())))?;
        *slot = action.clone();
        Ok(())
    }

    async fn remove_action(&self, id: &str) -> SyncResult<()> {
        let mut state = self.writable()?;
        state.queue.retain(|a| a.id() != id);
        Ok(())
    }

    async fn apply_remote(&self, change: &ChangeSet) -> SyncResult<bool> {
        let mut state = self.writable()?;
        let applied = Self::merge(&mut state, change);
        debug!(entity_id = %change.entity_id(), applied, "Applied remote change in memory");
        Ok(applied)
    }

    async fn entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> SyncResult<Option<EntityRecord>> {
        let key = (entity_type.to_string(), entity_id.to_string());
        Ok(self.lock().entities.get(&key).cloned())
    }

    async fn entities(&self, entity_type: &str) -> SyncResult<Vec<EntityRecord>> {
        let state = self.lock();
        let mut live: Vec<EntityRecord> = state
            .entities
            .values()
            .filter(|r| r.entity_type == entity_type && !r.deleted)
            .cloned()
            .collect();
        live.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(live)
    }

    async fn last_sync(&self) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.lock().last_sync)
    }

    async fn set_last_sync(&self, at: DateTime<Utc>) -> SyncResult<()> {
        self.writable()?.last_sync = Some(at);
        Ok(())
    }

    async fn is_online(&self) -> SyncResult<bool> {
        Ok(self.lock().online)
    }

    async fn set_online(&self, online: bool) -> SyncResult<()> {
        self.writable()?.online = online;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    /// The same sequence against both implementations.
    async fn exercise(store: &dyn LocalStore) {
        let create = ChangeSet::create("chore", "c1", json!({"title": "bins"}), t0(), "A").unwrap();
        let first = SyncAction::new(create, t0());
        assert!(store.enqueue(&first).await.unwrap());

        let delete = ChangeSet::delete("chore", "c1", t0() + Duration::seconds(1), "A").unwrap();
        let second = SyncAction::new(delete, t0());
        assert!(store.enqueue(&second).await.unwrap());

        let queue = store.load_queue().await.unwrap();
        assert_eq!(
            queue.iter().map(|a| a.id()).collect::<Vec<_>>(),
            vec![first.id(), second.id()]
        );

        // Tombstoned, so not listed but still readable.
        assert!(store.entities("chore").await.unwrap().is_empty());
        assert!(store.entity("chore", "c1").await.unwrap().unwrap().deleted);

        // An older remote update loses to the tombstone.
        let stale = ChangeSet::update("chore", "c1", json!({"title": "x"}), t0(), "Z").unwrap();
        assert!(!store.apply_remote(&stale).await.unwrap());

        store.remove_action(first.id()).await.unwrap();
        store.remove_action(first.id()).await.unwrap();
        assert_eq!(store.load_queue().await.unwrap().len(), 1);

        assert_eq!(store.last_sync().await.unwrap(), None);
        store.set_last_sync(t0()).await.unwrap();
        assert_eq!(store.last_sync().await.unwrap(), Some(t0()));

        store.set_online(true).await.unwrap();
        assert!(store.is_online().await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteStore::open(None, "h1").await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_scopes_by_household() {
        let a = SqliteStore::open(None, "h1").await.unwrap();
        let b = SqliteStore::new(a.database().clone(), "h2");

        let change = ChangeSet::create("expense", "e1", json!({}), t0(), "A").unwrap();
        a.enqueue(&SyncAction::new(change, t0())).await.unwrap();

        assert_eq!(a.load_queue().await.unwrap().len(), 1);
        assert!(b.load_queue().await.unwrap().is_empty());
        assert!(b.entity("expense", "e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);

        let change = ChangeSet::create("expense", "e1", json!({}), t0(), "A").unwrap();
        let err = store.enqueue(&SyncAction::new(change, t0())).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(store.load_queue().await.unwrap().is_empty());
    }
}

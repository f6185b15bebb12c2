//! # Sync Queue Repository
//!
//! Durable, ordered queue of pending local changes.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  LOCAL MUTATION (record_local_change)                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. INSERT INTO sync_queue (id, household_id, ..., payload)    │   │
//! │  │                                                                 │   │
//! │  │  2. UPSERT entity_cache  (only if the change wins LWW)         │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← Both succeed or both fail                                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            DRAIN (single-flight, head to tail)                  │   │
//! │  │                                                                 │   │
//! │  │  1. SELECT * FROM sync_queue WHERE household_id = ? ORDER BY seq│   │
//! │  │  2. For each entry:                                            │   │
//! │  │     a. push to backend                                         │   │
//! │  │     b. On success: DELETE FROM sync_queue WHERE id = ?         │   │
//! │  │     c. On failure: UPDATE retry_count, next_attempt_at,        │   │
//! │  │                    last_error  (or DELETE when abandoned)      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • A mutation is never recorded without its queue entry                │
//! │  • FIFO order survives restarts (seq is AUTOINCREMENT)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use hearth_core::{ChangeSet, Operation, SyncAction};

use super::{entity, from_nanos, to_nanos};
use crate::error::{DbError, DbResult};

const TABLE: &str = "sync_queue";

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: String,
    change_timestamp: i64,
    origin_user_id: String,
    retry_count: i64,
    enqueued_at: i64,
    next_attempt_at: Option<i64>,
    last_error: Option<String>,
}

impl QueueRow {
    fn into_action(self) -> DbResult<SyncAction> {
        let id = self.id;
        let corrupt = |reason: String| DbError::corrupt(TABLE, &id, reason);

        let operation: Operation = self
            .operation
            .parse()
            .map_err(|e: hearth_core::CoreError| corrupt(e.to_string()))?;
        let payload = serde_json::from_str(&self.payload).map_err(|e| corrupt(e.to_string()))?;
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| corrupt(format!("retry_count {} out of range", self.retry_count)))?;

        let change_set = ChangeSet::new(
            self.entity_type,
            self.entity_id,
            operation,
            payload,
            from_nanos(self.change_timestamp),
            self.origin_user_id,
        )
        .map_err(|e| corrupt(e.to_string()))?;

        Ok(SyncAction::restore(
            id,
            change_set,
            retry_count,
            from_nanos(self.enqueued_at),
            self.next_attempt_at.map(from_nanos),
            self.last_error,
        ))
    }
}

async fn insert(
    conn: &mut SqliteConnection,
    household_id: &str,
    action: &SyncAction,
) -> DbResult<()> {
    let change = action.change_set();
    let payload =
        serde_json::to_string(change.payload()).map_err(|e| DbError::Internal(e.to_string()))?;
    let next_attempt_at = action.next_attempt_at().map(to_nanos).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO sync_queue (
            id, household_id, entity_type, entity_id, operation, payload,
            change_timestamp, origin_user_id, retry_count, enqueued_at,
            next_attempt_at, last_error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(action.id())
    .bind(household_id)
    .bind(change.entity_type())
    .bind(change.entity_id())
    .bind(change.operation().as_str())
    .bind(payload)
    .bind(to_nanos(change.timestamp())?)
    .bind(change.origin_user_id())
    .bind(i64::from(action.retry_count()))
    .bind(to_nanos(action.enqueued_at())?)
    .bind(next_attempt_at)
    .bind(action.last_error())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Repository for the durable sync queue.
#[derive(Debug, Clone)]
pub struct SyncQueueRepository {
    pool: SqlitePool,
}

impl SyncQueueRepository {
    /// Creates a new SyncQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncQueueRepository { pool }
    }

    /// Appends an action to the tail of the household's queue and applies
    /// its change to the entity cache, atomically.
    ///
    /// Returns true if the change also won in the entity cache.
    pub async fn enqueue(&self, household_id: &str, action: &SyncAction) -> DbResult<bool> {
        debug!(
            household_id = %household_id,
            action_id = %action.id(),
            entity_type = %action.change_set().entity_type(),
            entity_id = %action.change_set().entity_id(),
            operation = %action.change_set().operation(),
            "Queuing for sync"
        );

        let mut tx = self.pool.begin().await?;
        insert(&mut tx, household_id, action).await?;
        let applied = entity::apply_change(&mut tx, household_id, action.change_set()).await?;
        tx.commit().await?;

        Ok(applied)
    }

    /// Loads the household's queue in FIFO order.
    pub async fn load(&self, household_id: &str) -> DbResult<Vec<SyncAction>> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, entity_type, entity_id, operation, payload, change_timestamp,
                   origin_user_id, retry_count, enqueued_at, next_attempt_at, last_error
            FROM sync_queue
            WHERE household_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(household_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueRow::into_action).collect()
    }

    /// Persists the retry bookkeeping of an action (retry count, next
    /// attempt, last error). Queue position is unchanged.
    pub async fn update(&self, action: &SyncAction) -> DbResult<()> {
        let next_attempt_at = action.next_attempt_at().map(to_nanos).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET retry_count = ?2, next_attempt_at = ?3, last_error = ?4
            WHERE id = ?1
            "#,
        )
        .bind(action.id())
        .bind(i64::from(action.retry_count()))
        .bind(next_attempt_at)
        .bind(action.last_error())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("SyncAction", action.id()));
        }
        Ok(())
    }

    /// Removes an action (acknowledged, abandoned or superseded).
    ///
    /// Removing an action that is already gone is not an error.
    pub async fn remove(&self, id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        debug!(action_id = %id, "Removed from sync queue");
        Ok(())
    }

    /// Number of pending actions for a household.
    pub async fn count(&self, household_id: &str) -> DbResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE household_id = ?1")
            .bind(household_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count as usize)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use hearth_core::RetryPolicy;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn action(entity_id: &str, seconds: i64) -> SyncAction {
        let at = t0() + Duration::seconds(seconds);
        let change =
            ChangeSet::update("expense", entity_id, json!({"amount": seconds}), at, "alice").unwrap();
        SyncAction::new(change, at)
    }

    #[tokio::test]
    async fn test_enqueue_preserves_fifo_order() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sync_queue();

        let actions = vec![action("e3", 0), action("e1", 1), action("e2", 2)];
        for a in &actions {
            repo.enqueue("h1", a).await.unwrap();
        }

        let loaded = repo.load("h1").await.unwrap();
        assert_eq!(loaded, actions);
        assert_eq!(repo.count("h1").await.unwrap(), 3);
        assert_eq!(repo.count("h2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_writes_entity_cache() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.sync_queue().enqueue("h1", &action("e1", 5)).await.unwrap();

        let record = db.entity_cache().get("h1", "expense", "e1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"amount": 5}));
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sync_queue();

        let mut a = action("e1", 0);
        repo.enqueue("h1", &a).await.unwrap();

        a.record_failure(&RetryPolicy::default(), t0(), "connection reset");
        repo.update(&a).await.unwrap();

        let loaded = repo.load("h1").await.unwrap();
        assert_eq!(loaded[0].retry_count(), 1);
        assert_eq!(loaded[0].last_error(), Some("connection reset"));
        assert_eq!(loaded[0].next_attempt_at(), a.next_attempt_at());

        repo.remove(a.id()).await.unwrap();
        assert_eq!(repo.count("h1").await.unwrap(), 0);

        // Removed entries can no longer be updated.
        assert!(matches!(repo.update(&a).await, Err(DbError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected_atomically() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sync_queue();
        let a = action("e1", 0);

        repo.enqueue("h1", &a).await.unwrap();
        let err = repo.enqueue("h1", &a).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
        assert_eq!(repo.count("h1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sync_queue();
        repo.enqueue("h1", &action("e1", 0)).await.unwrap();

        sqlx::query("UPDATE sync_queue SET payload = 'not json'")
            .execute(db.pool())
            .await
            .unwrap();

        assert!(matches!(repo.load("h1").await, Err(DbError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let a = action("e1", 0);
        let b = action("e1", 1);

        {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            db.sync_queue().enqueue("h1", &a).await.unwrap();
            db.sync_queue().enqueue("h1", &b).await.unwrap();
            db.close().await;
        }

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        assert_eq!(db.sync_queue().load("h1").await.unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_sub_millisecond_order_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let created_at = t0() + Duration::microseconds(100);
        let updated_at = t0() + Duration::microseconds(400);
        let create = SyncAction::new(
            ChangeSet::create("expense", "e1", json!({"n": 1}), created_at, "alice").unwrap(),
            created_at,
        );
        let update = SyncAction::new(
            ChangeSet::update("expense", "e1", json!({"n": 2}), updated_at, "alice").unwrap(),
            updated_at,
        );

        {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            db.sync_queue().enqueue("h1", &create).await.unwrap();
            db.sync_queue().enqueue("h1", &update).await.unwrap();
            db.close().await;
        }

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let loaded = db.sync_queue().load("h1").await.unwrap();
        assert_eq!(loaded[0].change_set().timestamp(), created_at);
        assert_eq!(loaded[1].change_set().timestamp(), updated_at);
        assert!(loaded[1].change_set().version() > loaded[0].change_set().version());

        let record = db.entity_cache().get("h1", "expense", "e1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"n": 2}));
        assert_eq!(record.version.timestamp, updated_at);
    }
}

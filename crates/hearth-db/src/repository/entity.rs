//! # Entity Cache Repository
//!
//! Latest known state of every replicated entity on this device.
//!
//! Rows only ever move forward under Last-Write-Wins: a write whose
//! version does not beat the stored version is dropped. Deletes stay as
//! tombstones (`deleted = 1`) so a stale update cannot revive the entity.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use hearth_core::{ChangeSet, ChangeVersion, EntityRecord};

use super::{from_nanos, to_nanos};
use crate::error::{DbError, DbResult};

const TABLE: &str = "entity_cache";

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    entity_type: String,
    entity_id: String,
    payload: String,
    deleted: bool,
    version_timestamp: i64,
    version_user: String,
}

impl EntityRow {
    fn into_record(self) -> DbResult<EntityRecord> {
        let key = format!("{}/{}", self.entity_type, self.entity_id);
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| DbError::corrupt(TABLE, &key, e))?;

        Ok(EntityRecord {
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            payload,
            deleted: self.deleted,
            version: ChangeVersion::new(from_nanos(self.version_timestamp), self.version_user),
        })
    }
}

// =============================================================================
// Connection-level helpers (shared with the queue's enqueue transaction)
// =============================================================================

pub(crate) async fn fetch(
    conn: &mut SqliteConnection,
    household_id: &str,
    entity_type: &str,
    entity_id: &str,
) -> DbResult<Option<EntityRecord>> {
    let row: Option<EntityRow> = sqlx::query_as(
        r#"
        SELECT entity_type, entity_id, payload, deleted, version_timestamp, version_user
        FROM entity_cache
        WHERE household_id = ?1 AND entity_type = ?2 AND entity_id = ?3
        "#,
    )
    .bind(household_id)
    .bind(entity_type)
    .bind(entity_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(EntityRow::into_record).transpose()
}

async fn write(
    conn: &mut SqliteConnection,
    household_id: &str,
    record: &EntityRecord,
) -> DbResult<()> {
    let payload =
        serde_json::to_string(&record.payload).map_err(|e| DbError::Internal(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO entity_cache (
            household_id, entity_type, entity_id, payload, deleted,
            version_timestamp, version_user, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT (household_id, entity_type, entity_id) DO UPDATE SET
            payload = excluded.payload,
            deleted = excluded.deleted,
            version_timestamp = excluded.version_timestamp,
            version_user = excluded.version_user,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(household_id)
    .bind(&record.entity_type)
    .bind(&record.entity_id)
    .bind(payload)
    .bind(record.deleted)
    .bind(to_nanos(record.version.timestamp)?)
    .bind(&record.version.origin_user_id)
    .bind(to_nanos(Utc::now())?)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Applies `change` to the cache if it wins. Returns true if the row changed.
pub(crate) async fn apply_change(
    conn: &mut SqliteConnection,
    household_id: &str,
    change: &ChangeSet,
) -> DbResult<bool> {
    let existing = fetch(
        &mut *conn,
        household_id,
        change.entity_type(),
        change.entity_id(),
    )
    .await?;

    match EntityRecord::merge(existing.as_ref(), change) {
        Some(record) => {
            write(&mut *conn, household_id, &record).await?;
            debug!(
                household_id = %household_id,
                entity_type = %record.entity_type,
                entity_id = %record.entity_id,
                deleted = record.deleted,
                "Entity cache updated"
            );
            Ok(true)
        }
        None => Ok(false),
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the entity cache.
#[derive(Debug, Clone)]
pub struct EntityCacheRepository {
    pool: SqlitePool,
}

impl EntityCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EntityCacheRepository { pool }
    }

    /// Applies a change under Last-Write-Wins. Returns true if it won.
    pub async fn apply(&self, household_id: &str, change: &ChangeSet) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let applied = apply_change(&mut tx, household_id, change).await?;
        tx.commit().await?;
        Ok(applied)
    }

    /// Gets one entity, tombstones included.
    pub async fn get(
        &self,
        household_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> DbResult<Option<EntityRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, household_id, entity_type, entity_id).await
    }

    /// Lists live (non-deleted) entities of one type, ordered by id.
    pub async fn list(&self, household_id: &str, entity_type: &str) -> DbResult<Vec<EntityRecord>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            r#"
            SELECT entity_type, entity_id, payload, deleted, version_timestamp, version_user
            FROM entity_cache
            WHERE household_id = ?1 AND entity_type = ?2 AND deleted = 0
            ORDER BY entity_id
            "#,
        )
        .bind(household_id)
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EntityRow::into_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::{DateTime, Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    async fn repo() -> EntityCacheRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().entity_cache()
    }

    #[tokio::test]
    async fn test_apply_and_get() {
        let repo = repo().await;
        let create = ChangeSet::create("expense", "e1", json!({"amount": 40}), t0(), "A").unwrap();

        assert!(repo.apply("h1", &create).await.unwrap());

        let record = repo.get("h1", "expense", "e1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"amount": 40}));
        assert!(!record.deleted);

        // Other households are isolated.
        assert!(repo.get("h2", "expense", "e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_older_change_is_dropped() {
        let repo = repo().await;
        let newer = ChangeSet::update(
            "expense",
            "e1",
            json!({"amount": 2}),
            t0() + Duration::seconds(1),
            "A",
        )
        .unwrap();
        let older = ChangeSet::update("expense", "e1", json!({"amount": 1}), t0(), "A").unwrap();

        assert!(repo.apply("h1", &newer).await.unwrap());
        assert!(!repo.apply("h1", &older).await.unwrap());

        let record = repo.get("h1", "expense", "e1").await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"amount": 2}));
    }

    #[tokio::test]
    async fn test_list_skips_tombstones() {
        let repo = repo().await;
        let a = ChangeSet::create("chore", "a", json!({"t": "a"}), t0(), "A").unwrap();
        let b = ChangeSet::create("chore", "b", json!({"t": "b"}), t0(), "A").unwrap();
        let del = ChangeSet::delete("chore", "a", t0() + Duration::seconds(1), "A").unwrap();

        repo.apply("h1", &a).await.unwrap();
        repo.apply("h1", &b).await.unwrap();
        repo.apply("h1", &del).await.unwrap();

        let live = repo.list("h1", "chore").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].entity_id, "b");

        let tombstone = repo.get("h1", "chore", "a").await.unwrap().unwrap();
        assert!(tombstone.deleted);
    }
}

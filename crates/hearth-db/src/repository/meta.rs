//! # Sync State Repository
//!
//! Per-household replication metadata: when the last successful pull
//! started, and the last known reachability.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{from_nanos, to_nanos};
use crate::error::DbResult;

/// Repository for per-household sync metadata.
#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncStateRepository { pool }
    }

    /// Start time of the last successful pull, if any.
    pub async fn last_sync(&self, household_id: &str) -> DbResult<Option<DateTime<Utc>>> {
        let nanos: Option<Option<i64>> =
            sqlx::query_scalar("SELECT last_sync FROM sync_state WHERE household_id = ?1")
                .bind(household_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(nanos.flatten().map(from_nanos))
    }

    pub async fn set_last_sync(&self, household_id: &str, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (household_id, last_sync, is_online, updated_at)
            VALUES (?1, ?2, 0, ?3)
            ON CONFLICT (household_id) DO UPDATE SET
                last_sync = excluded.last_sync,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(household_id)
        .bind(to_nanos(at)?)
        .bind(to_nanos(Utc::now())?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Last recorded reachability; false when never recorded.
    pub async fn is_online(&self, household_id: &str) -> DbResult<bool> {
        let online: Option<bool> =
            sqlx::query_scalar("SELECT is_online FROM sync_state WHERE household_id = ?1")
                .bind(household_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(online.unwrap_or(false))
    }

    pub async fn set_online(&self, household_id: &str, online: bool) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (household_id, last_sync, is_online, updated_at)
            VALUES (?1, NULL, ?2, ?3)
            ON CONFLICT (household_id) DO UPDATE SET
                is_online = excluded.is_online,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(household_id)
        .bind(online)
        .bind(to_nanos(Utc::now())?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_sync_state_defaults_and_updates() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sync_state();

        assert_eq!(repo.last_sync("h1").await.unwrap(), None);
        assert!(!repo.is_online("h1").await.unwrap());

        repo.set_online("h1", true).await.unwrap();
        assert!(repo.is_online("h1").await.unwrap());
        assert_eq!(repo.last_sync("h1").await.unwrap(), None);

        let at = Utc.with_ymd_and_hms(2024, 7, 4, 18, 0, 0).unwrap();
        repo.set_last_sync("h1", at).await.unwrap();
        assert_eq!(repo.last_sync("h1").await.unwrap(), Some(at));

        // Setting the sync time leaves reachability alone.
        assert!(repo.is_online("h1").await.unwrap());
    }
}

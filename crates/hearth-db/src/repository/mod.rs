//! # Repository Module
//!
//! Database repositories for the replication engine's durable state.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Durable Local State                                  │
//! │                                                                         │
//! │  SqliteStore (hearth-sync)                                             │
//! │       │                                                                 │
//! │       ├── db.sync_queue()     SyncQueueRepository                      │
//! │       │     ├── enqueue (queue row + cache row, one transaction)       │
//! │       │     ├── load (FIFO by seq)                                     │
//! │       │     └── update / remove                                        │
//! │       │                                                                 │
//! │       ├── db.entity_cache()   EntityCacheRepository                    │
//! │       │     └── apply (LWW) / get / list                               │
//! │       │                                                                 │
//! │       └── db.sync_state()     SyncStateRepository                      │
//! │             └── last_sync / is_online                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`queue::SyncQueueRepository`] - Durable FIFO of pending SyncActions
//! - [`entity::EntityCacheRepository`] - Latest known state per entity
//! - [`meta::SyncStateRepository`] - Per-household sync metadata

pub mod entity;
pub mod meta;
pub mod queue;

use chrono::{DateTime, Utc};

use crate::error::{DbError, DbResult};

/// Instants are stored as Unix nanoseconds, so two changes made within
/// the same millisecond keep their order across a restart.
pub(crate) fn to_nanos(at: DateTime<Utc>) -> DbResult<i64> {
    at.timestamp_nanos_opt()
        .ok_or_else(|| DbError::Internal(format!("timestamp {at} outside the storable range")))
}

pub(crate) fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

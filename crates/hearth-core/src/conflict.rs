//! # Conflict Resolution
//!
//! Last-Write-Wins over `(timestamp, origin_user_id)`.
//!
//! ## Resolution Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Last-Write-Wins                                   │
//! │                                                                         │
//! │  incoming.version  >  existing.version   →  Incoming (apply)           │
//! │  incoming.version  <= existing.version   →  Existing (discard)         │
//! │                                                                         │
//! │  version = (timestamp, origin_user_id), compared lexicographically     │
//! │                                                                         │
//! │  • The user id breaks timestamp ties, so every device agrees on a      │
//! │    winner regardless of arrival order.                                  │
//! │  • An equal version is the same change seen twice: no-op.              │
//! │  • A Delete is an ordinary change; a later Create resurrects.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::types::ChangeSet;

// =============================================================================
// Version
// =============================================================================

/// Total order over changes to one entity.
///
/// Field order matters: the derived `Ord` compares `timestamp` first and
/// falls back to `origin_user_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeVersion {
    pub timestamp: DateTime<Utc>,
    pub origin_user_id: String,
}

impl ChangeVersion {
    pub fn new(timestamp: DateTime<Utc>, origin_user_id: impl Into<String>) -> Self {
        ChangeVersion {
            timestamp,
            origin_user_id: origin_user_id.into(),
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Which side of a conflict survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Incoming,
    Existing,
}

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictMode {
    #[default]
    LastWriteWins,
    /// Reserved for a user-driven merge flow.
    Manual,
}

impl std::fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictMode::LastWriteWins => write!(f, "last_write_wins"),
            ConflictMode::Manual => write!(f, "manual"),
        }
    }
}

impl ConflictMode {
    /// Resolves a conflict between two versions of the same entity.
    pub fn resolve(
        &self,
        incoming: &ChangeVersion,
        existing: &ChangeVersion,
    ) -> CoreResult<Resolution> {
        match self {
            ConflictMode::LastWriteWins => Ok(resolve(incoming, existing)),
            ConflictMode::Manual => Err(CoreError::UnsupportedConflictMode(self.to_string())),
        }
    }
}

/// Last-Write-Wins: the incoming change applies only if strictly newer.
pub fn resolve(incoming: &ChangeVersion, existing: &ChangeVersion) -> Resolution {
    if incoming > existing {
        Resolution::Incoming
    } else {
        Resolution::Existing
    }
}

/// Returns whichever of two changes wins, independent of argument order.
pub fn winner<'a>(a: &'a ChangeSet, b: &'a ChangeSet) -> &'a ChangeSet {
    if a.version() >= b.version() {
        a
    } else {
        b
    }
}

// =============================================================================
// Entity Record
// =============================================================================

/// Latest known state of one entity on this device.
///
/// Deletes are kept as tombstones so that an older change arriving later
/// cannot bring the entity back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub deleted: bool,
    pub version: ChangeVersion,
}

impl EntityRecord {
    /// The record a ChangeSet produces on an empty slot.
    pub fn from_change(change: &ChangeSet) -> Self {
        EntityRecord {
            entity_type: change.entity_type().to_string(),
            entity_id: change.entity_id().to_string(),
            payload: change.payload().clone(),
            deleted: change.is_delete(),
            version: change.version(),
        }
    }

    /// Applies `change` if it wins against this record.
    ///
    /// Returns true if the record changed.
    pub fn apply(&mut self, change: &ChangeSet) -> bool {
        match resolve(&change.version(), &self.version) {
            Resolution::Incoming => {
                *self = EntityRecord::from_change(change);
                true
            }
            Resolution::Existing => false,
        }
    }

    /// Merges `change` into an optional existing record.
    ///
    /// Returns the resulting record when the change won, `None` otherwise.
    pub fn merge(existing: Option<&EntityRecord>, change: &ChangeSet) -> Option<EntityRecord> {
        match existing {
            None => Some(EntityRecord::from_change(change)),
            Some(record) => {
                let mut next = record.clone();
                next.apply(change).then_some(next)
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_later_timestamp_wins() {
        let older = ChangeVersion::new(t0(), "zed");
        let newer = ChangeVersion::new(t0() + Duration::milliseconds(1), "amy");

        assert_eq!(resolve(&newer, &older), Resolution::Incoming);
        assert_eq!(resolve(&older, &newer), Resolution::Existing);
    }

    #[test]
    fn test_user_id_breaks_ties() {
        let a = ChangeVersion::new(t0(), "A");
        let b = ChangeVersion::new(t0(), "B");

        assert_eq!(resolve(&b, &a), Resolution::Incoming);
        assert_eq!(resolve(&a, &b), Resolution::Existing);
    }

    #[test]
    fn test_equal_versions_keep_existing() {
        let v = ChangeVersion::new(t0(), "A");
        assert_eq!(resolve(&v, &v.clone()), Resolution::Existing);
    }

    #[test]
    fn test_manual_mode_is_unsupported() {
        let v = ChangeVersion::new(t0(), "A");
        let err = ConflictMode::Manual.resolve(&v, &v).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedConflictMode(_)));
        assert!(ConflictMode::LastWriteWins.resolve(&v, &v).is_ok());
    }

    #[test]
    fn test_winner_is_order_independent() {
        let a = ChangeSet::update("expense", "e1", json!({"v": 1}), t0(), "A").unwrap();
        let b = ChangeSet::update("expense", "e1", json!({"v": 2}), t0(), "B").unwrap();

        assert_eq!(winner(&a, &b), &b);
        assert_eq!(winner(&b, &a), &b);
    }

    #[test]
    fn test_tombstone_blocks_older_update() {
        let delete = ChangeSet::delete("expense", "e2", t0() + Duration::milliseconds(1), "B")
            .unwrap();
        let update = ChangeSet::update("expense", "e2", json!({"amount": 9}), t0(), "A").unwrap();

        let mut record = EntityRecord::from_change(&delete);
        assert!(!record.apply(&update));
        assert!(record.deleted);
        assert_eq!(record.version.origin_user_id, "B");
    }

    #[test]
    fn test_later_create_resurrects() {
        let delete = ChangeSet::delete("chore", "c1", t0(), "A").unwrap();
        let create = ChangeSet::create(
            "chore",
            "c1",
            json!({"title": "mop"}),
            t0() + Duration::seconds(1),
            "A",
        )
        .unwrap();

        let mut record = EntityRecord::from_change(&delete);
        assert!(record.apply(&create));
        assert!(!record.deleted);
        assert_eq!(record.payload, json!({"title": "mop"}));
    }

    #[test]
    fn test_merge_into_empty_slot() {
        let create = ChangeSet::create("chore", "c2", json!({"title": "dust"}), t0(), "A").unwrap();
        let merged = EntityRecord::merge(None, &create).unwrap();
        assert_eq!(merged.entity_id, "c2");

        // Same change again is a no-op.
        assert!(EntityRecord::merge(Some(&merged), &create).is_none());
    }
}

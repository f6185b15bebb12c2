//! # Domain Types
//!
//! Core replication types used throughout Hearth.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Replication Types                               │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   ChangeSet     │   │   SyncAction    │   │   Operation     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  entity_type    │◄──│  change_set     │   │  Create         │       │
//! │  │  entity_id      │   │  id (UUID v4)   │   │  Update         │       │
//! │  │  operation      │   │  retry_count    │   │  Delete         │       │
//! │  │  payload        │   │  enqueued_at    │   └─────────────────┘       │
//! │  │  timestamp      │   │  next_attempt_at│                             │
//! │  │  origin_user_id │   └─────────────────┘                             │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐                             │
//! │  │ConnectionStatus │   │  PresenceInfo   │                             │
//! │  │  connected      │   │  user_id        │                             │
//! │  │  last_heartbeat │   │  status         │                             │
//! │  │  latency        │   │  updated_at     │                             │
//! │  └─────────────────┘   └─────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Immutability
//! A ChangeSet is never edited after construction: its fields are private
//! and only readable. Corrections are new ChangeSets.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use uuid::Uuid;

use crate::conflict::ChangeVersion;
use crate::error::{CoreError, CoreResult};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::validation::{validate_identifier, validate_payload};

/// The oldest representable instant.
///
/// Stands in for a missing timestamp on pulled data so that such a change
/// always loses conflict resolution instead of blocking it.
pub fn oldest_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

// =============================================================================
// Operation
// =============================================================================

/// Kind of mutation a ChangeSet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// New entity; payload is the full snapshot.
    Create,
    /// Changed entity; payload is the full snapshot.
    Update,
    /// Removed entity; payload is empty (tombstone).
    Delete,
}

impl Operation {
    /// Storage/wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// ChangeSet
// =============================================================================

/// One mutation on one entity: the atomic unit of replication.
///
/// ## Example
/// ```rust
/// use chrono::Utc;
/// use hearth_core::{ChangeSet, Operation};
/// use serde_json::json;
///
/// let change = ChangeSet::create("expense", "e1", json!({"amount": 1250}), Utc::now(), "alice")
///     .unwrap();
/// assert_eq!(change.operation(), Operation::Create);
/// assert_eq!(change.entity_id(), "e1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    entity_type: String,
    entity_id: String,
    operation: Operation,
    #[serde(default)]
    payload: Value,
    #[serde(default = "oldest_timestamp")]
    timestamp: DateTime<Utc>,
    origin_user_id: String,
}

impl ChangeSet {
    /// Builds and validates a ChangeSet.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Value,
        timestamp: DateTime<Utc>,
        origin_user_id: impl Into<String>,
    ) -> CoreResult<Self> {
        let change = ChangeSet {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload,
            timestamp,
            origin_user_id: origin_user_id.into(),
        };
        change.validate()?;
        Ok(change)
    }

    /// A Create carrying the full entity snapshot.
    pub fn create(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        timestamp: DateTime<Utc>,
        origin_user_id: impl Into<String>,
    ) -> CoreResult<Self> {
        Self::new(entity_type, entity_id, Operation::Create, payload, timestamp, origin_user_id)
    }

    /// An Update carrying the full entity snapshot.
    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        timestamp: DateTime<Utc>,
        origin_user_id: impl Into<String>,
    ) -> CoreResult<Self> {
        Self::new(entity_type, entity_id, Operation::Update, payload, timestamp, origin_user_id)
    }

    /// A Delete; carries no payload.
    pub fn delete(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        origin_user_id: impl Into<String>,
    ) -> CoreResult<Self> {
        Self::new(
            entity_type,
            entity_id,
            Operation::Delete,
            Value::Null,
            timestamp,
            origin_user_id,
        )
    }

    /// Checks the fields the replication engine relies on.
    ///
    /// Pulled ChangeSets are deserialized without this check; the entity
    /// layer owns payload schema.
    pub fn validate(&self) -> CoreResult<()> {
        validate_identifier("entity_type", &self.entity_type)?;
        validate_identifier("entity_id", &self.entity_id)?;
        validate_identifier("origin_user_id", &self.origin_user_id)?;
        validate_payload(self.operation, &self.payload)?;
        Ok(())
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn origin_user_id(&self) -> &str {
        &self.origin_user_id
    }

    /// Returns true for a Delete.
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// The (timestamp, origin user) pair conflict resolution orders by.
    pub fn version(&self) -> ChangeVersion {
        ChangeVersion::new(self.timestamp, self.origin_user_id.clone())
    }

    /// Moves this change just past `floor` unless it already sorts after it.
    ///
    /// A device's successive edits to one entity must carry increasing
    /// versions even when its clock repeats a value or steps backwards.
    pub fn ordered_after(mut self, floor: &ChangeVersion) -> Self {
        if self.version() <= *floor {
            self.timestamp = floor
                .timestamp
                .checked_add_signed(chrono::Duration::nanoseconds(1))
                .unwrap_or(floor.timestamp);
        }
        self
    }

    /// Returns true if both ChangeSets target the same entity.
    pub fn same_entity(&self, other: &ChangeSet) -> bool {
        self.entity_type == other.entity_type && self.entity_id == other.entity_id
    }
}

// =============================================================================
// SyncAction (queue entry)
// =============================================================================

/// A ChangeSet plus its replication bookkeeping in the offline queue.
///
/// `retry_count` only ever grows; an action leaves the queue on remote
/// acknowledgement or when the retry ceiling is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAction {
    id: String,
    change_set: ChangeSet,
    retry_count: u32,
    enqueued_at: DateTime<Utc>,
    #[serde(default)]
    next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error: Option<String>,
}

impl SyncAction {
    /// Wraps a fresh ChangeSet in a new queue entry with a UUID v4 id.
    pub fn new(change_set: ChangeSet, enqueued_at: DateTime<Utc>) -> Self {
        SyncAction {
            id: Uuid::new_v4().to_string(),
            change_set,
            retry_count: 0,
            enqueued_at,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Rebuilds a queue entry from durable storage.
    pub fn restore(
        id: String,
        change_set: ChangeSet,
        retry_count: u32,
        enqueued_at: DateTime<Utc>,
        next_attempt_at: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) -> Self {
        SyncAction {
            id,
            change_set,
            retry_count,
            enqueued_at,
            next_attempt_at,
            last_error,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn change_set(&self) -> &ChangeSet {
        &self.change_set
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns true if the action may be pushed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Records a failed push and schedules the next attempt.
    ///
    /// Returns [`RetryDecision::Abandon`] once the retry ceiling is reached;
    /// the caller removes the action in that case.
    pub fn record_failure(
        &mut self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        error: impl Into<String>,
    ) -> RetryDecision {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());

        let decision = policy.decide(self.retry_count, now);
        if let RetryDecision::RetryAt(at) = decision {
            self.next_attempt_at = Some(at);
        }
        decision
    }
}

// =============================================================================
// Connection Status
// =============================================================================

/// Point-in-time view of an adapter session.
///
/// Derived on every adapter interaction; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Whether a session is established.
    pub connected: bool,
    /// Time of the last successful round trip.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Duration of the last successful round trip.
    pub latency: Duration,
}

impl ConnectionStatus {
    /// Status of an adapter with no session.
    pub fn disconnected() -> Self {
        ConnectionStatus::default()
    }
}

// =============================================================================
// Presence
// =============================================================================

/// A user's availability as broadcast to the rest of the household.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    #[default]
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Away => write!(f, "away"),
            PresenceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Presence of one user in one household, valid for the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInfo {
    pub household_id: String,
    pub user_id: String,
    pub status: PresenceStatus,
    pub updated_at: DateTime<Utc>,
}

impl PresenceInfo {
    pub fn new(
        household_id: impl Into<String>,
        user_id: impl Into<String>,
        status: PresenceStatus,
        updated_at: DateTime<Utc>,
    ) -> Self {
        PresenceInfo {
            household_id: household_id.into(),
            user_id: user_id.into(),
            status,
            updated_at,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

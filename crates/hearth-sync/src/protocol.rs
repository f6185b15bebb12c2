//! # Sync Protocol Messages
//!
//! Message types exchanged between the WebSocket adapter and the sync
//! backend.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol Messages                             │
//! │                                                                         │
//! │  HANDSHAKE FLOW                                                        │
//! │  ──────────────                                                        │
//! │  DEVICE    ───► Hello { householdId, userId, protocolVersion }         │
//! │  BACKEND   ◄─── Welcome { serverTime }                                 │
//! │                                                                         │
//! │  PUSH (one ChangeSet per request, upsert / tombstone on the backend)   │
//! │  ────                                                                  │
//! │  DEVICE    ───► Push { requestId, change }                             │
//! │  BACKEND   ◄─── PushAck { requestId } | PushRejected { requestId, ..} │
//! │                                                                         │
//! │  PULL                                                                  │
//! │  ────                                                                  │
//! │  DEVICE    ───► Pull { requestId, since? }                             │
//! │  BACKEND   ◄─── PullResult { requestId, changes: [...] }               │
//! │                                                                         │
//! │  PRESENCE (fire-and-forget)                                            │
//! │  ────────                                                              │
//! │  DEVICE    ───► Presence { userId, status, updatedAt }                 │
//! │                                                                         │
//! │  KEEPALIVE / ERROR                                                     │
//! │  ─────────────────                                                     │
//! │  Both      ◄──► Ping / Pong                                            │
//! │  Both      ◄──► Error { code, message }                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format (JSON)
//! Messages are serialized as adjacently tagged JSON:
//! ```json
//! { "type": "Push", "payload": { "requestId": 7, "change": { ... } } }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hearth_core::{ChangeSet, PresenceStatus};

use crate::error::{SyncError, SyncResult};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncMessage {
    // =========================================================================
    // Handshake Messages
    // =========================================================================
    /// First message on a new session.
    Hello(HelloPayload),

    /// Backend accepted the session.
    Welcome(WelcomePayload),

    // =========================================================================
    // Replication Messages
    // =========================================================================
    /// Commit one change remotely.
    #[serde(rename_all = "camelCase")]
    Push { request_id: u64, change: ChangeSet },

    /// The change is committed.
    #[serde(rename_all = "camelCase")]
    PushAck { request_id: u64 },

    /// The backend refused the change.
    #[serde(rename_all = "camelCase")]
    PushRejected { request_id: u64, reason: String },

    /// Ask for changes with `timestamp >= since`.
    #[serde(rename_all = "camelCase")]
    Pull {
        request_id: u64,
        #[serde(default)]
        since: Option<DateTime<Utc>>,
    },

    /// One finite batch of changes, ordered by timestamp.
    #[serde(rename_all = "camelCase")]
    PullResult {
        request_id: u64,
        changes: Vec<ChangeSet>,
    },

    // =========================================================================
    // Presence
    // =========================================================================
    /// A user's availability; never answered.
    #[serde(rename_all = "camelCase")]
    Presence {
        user_id: String,
        status: PresenceStatus,
        updated_at: DateTime<Utc>,
    },

    // =========================================================================
    // Keepalive Messages
    // =========================================================================
    Ping { timestamp: DateTime<Utc> },

    #[serde(rename_all = "camelCase")]
    Pong {
        ping_timestamp: DateTime<Utc>,
        pong_timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Error Messages
    // =========================================================================
    Error { code: String, message: String },
}

// =============================================================================
// Handshake Payloads
// =============================================================================

/// Hello message sent by the device on connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub household_id: String,
    pub user_id: String,
    pub protocol_version: u32,
}

/// Welcome message sent by the backend after a successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    /// Backend clock, for diagnosing device clock skew.
    pub server_time: DateTime<Utc>,
}

// =============================================================================
// Helper Functions
// =============================================================================

impl SyncMessage {
    /// Returns the message type name as a string (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Hello(_) => "Hello",
            SyncMessage::Welcome(_) => "Welcome",
            SyncMessage::Push { .. } => "Push",
            SyncMessage::PushAck { .. } => "PushAck",
            SyncMessage::PushRejected { .. } => "PushRejected",
            SyncMessage::Pull { .. } => "Pull",
            SyncMessage::PullResult { .. } => "PullResult",
            SyncMessage::Presence { .. } => "Presence",
            SyncMessage::Ping { .. } => "Ping",
            SyncMessage::Pong { .. } => "Pong",
            SyncMessage::Error { .. } => "Error",
        }
    }

    /// Request id of a request or its response, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            SyncMessage::Push { request_id, .. }
            | SyncMessage::PushAck { request_id }
            | SyncMessage::PushRejected { request_id, .. }
            | SyncMessage::Pull { request_id, .. }
            | SyncMessage::PullResult { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Creates a Hello message.
    pub fn hello(household_id: &str, user_id: &str) -> Self {
        SyncMessage::Hello(HelloPayload {
            household_id: household_id.to_string(),
            user_id: user_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    /// Creates a Welcome message.
    pub fn welcome(server_time: DateTime<Utc>) -> Self {
        SyncMessage::Welcome(WelcomePayload { server_time })
    }

    /// Creates a Ping message.
    pub fn ping() -> Self {
        SyncMessage::Ping {
            timestamp: Utc::now(),
        }
    }

    /// Creates a Pong message.
    pub fn pong(ping_timestamp: DateTime<Utc>) -> Self {
        SyncMessage::Pong {
            ping_timestamp,
            pong_timestamp: Utc::now(),
        }
    }

    /// Creates an Error message.
    pub fn error(code: &str, message: &str) -> Self {
        SyncMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Serializes to a JSON text frame.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("invalid message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let t = Utc.with_ymd_and_hms(2024, 9, 1, 7, 0, 0).unwrap();
        let change = ChangeSet::create("medication", "m1", json!({"dose": "5mg"}), t, "alice")
            .unwrap();
        let msg = SyncMessage::Push {
            request_id: 7,
            change,
        };

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "Push");
        assert_eq!(value["payload"]["requestId"], 7);
        assert_eq!(value["payload"]["change"]["entityId"], "m1");
        assert_eq!(msg.request_id(), Some(7));
    }

    #[test]
    fn test_pull_without_since() {
        let msg = SyncMessage::from_json(r#"{"type":"Pull","payload":{"requestId":3}}"#).unwrap();
        assert_eq!(
            msg,
            SyncMessage::Pull {
                request_id: 3,
                since: None
            }
        );
    }

    #[test]
    fn test_hello_carries_version() {
        match SyncMessage::hello("h1", "alice") {
            SyncMessage::Hello(hello) => {
                assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
                assert_eq!(hello.household_id, "h1");
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let err = SyncMessage::from_json("{not json").unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(SyncMessage::from_json(r#"{"type":"Bogus","payload":{}}"#).is_err());
    }
}

//! # Sync Error Types
//!
//! Error types for replication operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Transport      │  │     Fatal       │  │     Configuration       │ │
//! │  │  (retryable)    │  │  (halts drain)  │  │                         │ │
//! │  │                 │  │                 │  │  InvalidConfig          │ │
//! │  │  Connection     │  │  QueueStorage   │  │  MissingHouseholdId     │ │
//! │  │  NotConnected   │  │  Halted         │  │  MissingUserId          │ │
//! │  │  Push           │  │                 │  │  InvalidUrl             │ │
//! │  │  Pull           │  │                 │  │  ConfigLoad/SaveFailed  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Transport errors stay inside the queue: they surface only as a        │
//! │  non-zero pending count and `last_error` in SyncStatus.                │
//! │  Fatal errors propagate to the caller of sync()/record_local_change(). │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use hearth_core::CoreError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible replication failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The adapter could not establish a session.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// An operation that needs a session was attempted without one.
    #[error("Not connected to the sync backend")]
    NotConnected,

    /// One change could not be committed remotely.
    #[error("Push failed for {entity_id}: {reason}")]
    Push { entity_id: String, reason: String },

    /// Remote changes could not be retrieved.
    #[error("Pull failed: {0}")]
    Pull(String),

    // =========================================================================
    // Fatal Errors
    // =========================================================================
    /// Durable queue storage failed or is corrupt.
    #[error("Queue storage error: {0}")]
    QueueStorage(String),

    /// Draining is halted after a fatal error until reset.
    #[error("Sync halted after a fatal error; reset required")]
    Halted,

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Household id is required.
    #[error("Household ID not configured")]
    MissingHouseholdId,

    /// User id is required.
    #[error("User ID not configured")]
    MissingUserId,

    /// Invalid backend URL.
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The backend sent something unexpected.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failed to (de)serialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// A local change failed validation.
    #[error(transparent)]
    Validation(#[from] CoreError),

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<hearth_db::DbError> for SyncError {
    fn from(err: hearth_db::DbError) -> Self {
        SyncError::QueueStorage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::NotConnected,
            WsError::Io(io) => SyncError::Connection(io.to_string()),
            WsError::Tls(tls) => SyncError::Connection(tls.to_string()),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Builds a push error for one entity.
    pub fn push(entity_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SyncError::Push {
            entity_id: entity_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the operation can be retried later.
    ///
    /// ## Retryable Errors
    /// - Connection failures and missing sessions
    /// - Push / pull transport failures (timeouts included)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_)
                | SyncError::NotConnected
                | SyncError::Push { .. }
                | SyncError::Pull(_)
        )
    }

    /// Returns true if this error must halt automatic draining.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::QueueStorage(_) | SyncError::Halted)
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingHouseholdId
                | SyncError::MissingUserId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Connection("network unreachable".into()).is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(SyncError::push("e1", "timeout").is_retryable());
        assert!(SyncError::Pull("timeout".into()).is_retryable());

        assert!(!SyncError::QueueStorage("disk full".into()).is_retryable());
        assert!(!SyncError::MissingHouseholdId.is_retryable());
    }

    #[test]
    fn test_db_errors_are_fatal() {
        let err: SyncError = hearth_db::DbError::corrupt("sync_queue", "a1", "bad json").into();
        assert!(err.is_fatal());
        assert!(SyncError::Halted.is_fatal());
        assert!(!SyncError::NotConnected.is_fatal());
    }

    #[test]
    fn test_config_errors() {
        assert!(SyncError::InvalidUrl("nope".into()).is_config_error());
        assert!(!SyncError::Pull("x".into()).is_config_error());
    }

    #[test]
    fn test_push_error_display() {
        let err = SyncError::push("expense-7", "rejected by backend");
        assert_eq!(err.to_string(), "Push failed for expense-7: rejected by backend");
    }
}

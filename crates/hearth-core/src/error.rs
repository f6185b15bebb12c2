//! # Error Types
//!
//! Domain-specific error types for hearth-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  hearth-core errors (this file)                                        │
//! │  ├── CoreError        - Replication model errors                       │
//! │  └── ValidationError  - ChangeSet shape failures                       │
//! │                                                                         │
//! │  hearth-db errors (separate crate)                                     │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  hearth-sync errors (separate crate)                                   │
//! │  └── SyncError        - Connection / Push / Pull / QueueStorage        │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → status.last_error     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Replication model errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The configured conflict mode has no implementation yet.
    ///
    /// ## When This Occurs
    /// - `ConflictMode::Manual` is selected; it is reserved for a future
    ///   user-driven merge flow.
    #[error("Conflict mode '{0}' is not implemented")]
    UnsupportedConflictMode(String),

    /// Unknown operation name in stored or wire data.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// ChangeSet validation errors.
///
/// Payload schema is the entity layer's business; these only cover the
/// fields the replication engine itself depends on.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Payload shape does not match the operation.
    #[error("{operation} payload is invalid: {reason}")]
    InvalidPayload { operation: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "entity_id".to_string(),
        };
        assert_eq!(err.to_string(), "entity_id is required");

        let err = ValidationError::InvalidPayload {
            operation: "delete".to_string(),
            reason: "must be empty".to_string(),
        };
        assert_eq!(err.to_string(), "delete payload is invalid: must be empty");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "entity_type".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}

//! # Validation Module
//!
//! Shape checks for ChangeSets before they enter the replication queue.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Entity layer (expense, chore, medication)                    │
//! │  └── Payload schema, business rules                                    │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── entity_type / entity_id / origin_user_id present                 │
//! │  └── payload matches operation (Delete carries none)                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  └── NOT NULL constraints on sync_queue                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use hearth_core::validation::validate_identifier;
//!
//! assert!(validate_identifier("entity_id", "e1").is_ok());
//! assert!(validate_identifier("entity_id", "  ").is_err());
//! ```

use serde_json::Value;

use crate::error::ValidationError;
use crate::types::Operation;
use crate::MAX_IDENTIFIER_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates an identifier-like field (entity type, entity id, user id).
///
/// ## Rules
/// - Must not be empty or whitespace
/// - At most [`MAX_IDENTIFIER_LEN`] characters
pub fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_IDENTIFIER_LEN,
        });
    }

    Ok(())
}

// =============================================================================
// Payload Validators
// =============================================================================

/// Validates that a payload matches its operation.
///
/// ## Rules
/// - Create/Update carry a full snapshot: a JSON object
/// - Delete carries nothing: `null`
pub fn validate_payload(operation: Operation, payload: &Value) -> ValidationResult<()> {
    match operation {
        Operation::Create | Operation::Update => {
            if !payload.is_object() {
                return Err(ValidationError::InvalidPayload {
                    operation: operation.to_string(),
                    reason: "expected a full entity snapshot object".to_string(),
                });
            }
        }
        Operation::Delete => {
            if !payload.is_null() {
                return Err(ValidationError::InvalidPayload {
                    operation: operation.to_string(),
                    reason: "must be empty".to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("entity_id", "expense-1").is_ok());
        assert!(validate_identifier("entity_id", "").is_err());
        assert!(validate_identifier("entity_id", "   ").is_err());
        assert!(validate_identifier("entity_id", &"x".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_payload() {
        assert!(validate_payload(Operation::Create, &json!({"amount": 4})).is_ok());
        assert!(validate_payload(Operation::Update, &json!({"amount": 5})).is_ok());
        assert!(validate_payload(Operation::Delete, &Value::Null).is_ok());

        assert!(validate_payload(Operation::Create, &Value::Null).is_err());
        assert!(validate_payload(Operation::Update, &json!([1, 2])).is_err());
        assert!(validate_payload(Operation::Delete, &json!({"amount": 5})).is_err());
    }
}

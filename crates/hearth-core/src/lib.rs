//! # hearth-core: Pure Replication Model for Hearth
//!
//! This crate holds the data model and decision rules of the change
//! replication engine, as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Hearth Replication Stack                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 hearth-sync (Orchestrator, Queue)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ hearth-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │ conflict  │  │   retry   │  │   clock   │  │   │
//! │  │   │ ChangeSet │  │    LWW    │  │  Policy   │  │  System   │  │   │
//! │  │   │SyncAction │  │  Version  │  │ Decision  │  │  Manual   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    hearth-db (Database Layer)                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - ChangeSet, SyncAction, presence and connection types
//! - [`conflict`] - Last-Write-Wins resolution and the entity cache record
//! - [`retry`] - Retry ceiling and `next_attempt_at` scheduling
//! - [`clock`] - Injectable time source
//! - [`validation`] - ChangeSet shape checks
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use hearth_core::{conflict, ChangeSet};
//! use serde_json::json;
//!
//! let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
//! let update = ChangeSet::update("expense", "e2", json!({"amount": 12}), t0, "A").unwrap();
//! let delete = ChangeSet::delete("expense", "e2", t0 + Duration::milliseconds(1), "B").unwrap();
//!
//! // Arrival order does not matter: the later change wins.
//! assert_eq!(conflict::winner(&update, &delete), &delete);
//! assert_eq!(conflict::winner(&delete, &update), &delete);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod conflict;
pub mod error;
pub mod retry;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{ChangeVersion, ConflictMode, EntityRecord, Resolution};
pub use error::{CoreError, CoreResult, ValidationError};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default retry ceiling: push attempts before an action is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default fixed delay between push attempts, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Maximum accepted length for entity types and identifiers.
pub const MAX_IDENTIFIER_LEN: usize = 256;

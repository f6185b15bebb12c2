//! # hearth-sync: Change-Replication Engine for Hearth
//!
//! Keeps a device's local household data consistent with the shared
//! household dataset, including long stretches fully offline.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Replication Engine Architecture                     │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncOrchestrator (control loop)                  │  │
//! │  │                                                                  │  │
//! │  │  record_local_change • sync (single flight) • status • presence  │  │
//! │  └──────┬───────────────────────┬───────────────────────┬───────────┘  │
//! │         ▼                       ▼                       ▼               │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌────────────────────┐    │
//! │  │ OfflineQueue   │  │ SyncAdapter        │  │ ConnectivityMonitor│    │
//! │  │                │  │                    │  │                    │    │
//! │  │ FIFO, durable, │  │ Local  (no-op)     │  │ BecameOnline /     │    │
//! │  │ retry ceiling, │  │ Memory (in-proc)   │  │ BecameOffline      │    │
//! │  │ next_attempt_at│  │ WebSocket (remote) │  │ broadcast events   │    │
//! │  └───────┬────────┘  └────────────────────┘  └────────────────────┘    │
//! │          ▼                                                              │
//! │  ┌────────────────┐  ┌────────────────────┐                            │
//! │  │ LocalStore     │  │ InboundApplier     │                            │
//! │  │ SQLite / memory│◄─│ LWW apply of pulls │                            │
//! │  └────────────────┘  └────────────────────┘                            │
//! │                                                                         │
//! │  STATUS EVENTS (to the UI via SyncEventEmitter):                       │
//! │  • status   - online, syncing, pending, last sync, last error          │
//! │  • progress - pending / pushed after each pass                         │
//! │  • error    - transport (retryable) or storage (fatal) failures        │
//! │  • abandoned - one event per action dropped at the retry ceiling       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`orchestrator`] - `SyncOrchestrator`, status, background loop
//! - [`queue`] - Offline queue and drain policy
//! - [`adapter`] - Adapter trait plus local, in-memory and WebSocket adapters
//! - [`connectivity`] - Reachability events and probes
//! - [`inbound`] - Conflict resolution of pulled changes
//! - [`store`] - Durable local state (SQLite) and its in-memory twin
//! - [`protocol`] - WebSocket wire messages
//! - [`config`] - Session configuration (TOML + environment)
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hearth_core::ChangeSet;
//! use hearth_sync::{SyncConfig, SyncOrchestrator};
//! use serde_json::json;
//!
//! let config = SyncConfig::load_or_default(None);
//! let sync = SyncOrchestrator::builder(config).build().await?;
//! let handle = sync.spawn();
//! sync.connect().await?;
//!
//! let change = ChangeSet::create("expense", "e1", json!({"amount": 12}), now, "alice")?;
//! sync.record_local_change(change).await?;
//!
//! let status = sync.status().await;
//! println!("pending: {}", status.pending_count);
//! handle.shutdown().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod adapter;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod inbound;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use adapter::{
    AdapterStats, LocalAdapter, MemoryAdapter, MemoryBackend, SyncAdapter, WsAdapter,
};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ReachabilityProbe, TcpProbe};
pub use error::{SyncError, SyncResult};
pub use inbound::{InboundApplier, InboundReport};
pub use orchestrator::{
    NoOpEmitter, OrchestratorHandle, SyncEventEmitter, SyncOrchestrator, SyncOrchestratorBuilder,
    SyncOutcome, SyncReport, SyncStatus,
};
pub use protocol::SyncMessage;
pub use queue::{AbandonedAction, DrainReport, DrainStop, OfflineQueue};
pub use store::{LocalStore, MemoryStore, SqliteStore};

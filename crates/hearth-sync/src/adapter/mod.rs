//! # Sync Adapters
//!
//! How changes travel between this device and the shared household store.
//!
//! ## Adapter Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAdapter                                      │
//! │                                                                         │
//! │  connect(household, user)  idempotent for the same pair                │
//! │  disconnect()              no-op when already disconnected             │
//! │  is_connected()            sync, side-effect free                      │
//! │  push(change)              fails loudly; total_pushed += 1 on success  │
//! │  pull(since?)              finite batch; total_pulled += len           │
//! │  update_presence(status)   best effort                                 │
//! │  connection_status()       point-in-time snapshot                      │
//! │                                                                         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────────┐    │
//! │  │ LocalAdapter │   │MemoryAdapter │   │ WsAdapter                │    │
//! │  │ no-op,       │   │ in-process   │   │ JSON over WebSocket to   │    │
//! │  │ always OK    │   │ MemoryBackend│   │ the sync backend         │    │
//! │  └──────────────┘   └──────────────┘   └──────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The orchestrator owns exactly one adapter, passed in at construction.
//! Adapters hold no durable state.

pub mod local;
pub mod memory;
pub mod remote;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hearth_core::{ChangeSet, ConnectionStatus, PresenceStatus};

use crate::error::SyncResult;

pub use local::LocalAdapter;
pub use memory::{MemoryAdapter, MemoryBackend};
pub use remote::WsAdapter;

// =============================================================================
// Trait
// =============================================================================

/// Transport for ChangeSets.
#[async_trait]
pub trait SyncAdapter: Send + Sync + std::fmt::Debug {
    /// Short name for logs and status ("local", "memory", "websocket").
    fn name(&self) -> &'static str;

    /// Establishes a session scoped to one household and one user.
    async fn connect(&self, household_id: &str, user_id: &str) -> SyncResult<()>;

    /// Releases the session.
    async fn disconnect(&self) -> SyncResult<()>;

    fn is_connected(&self) -> bool;

    /// Commits one change remotely.
    async fn push(&self, change: &ChangeSet) -> SyncResult<()>;

    /// Changes with `timestamp >= since` (all when `None`).
    async fn pull(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<ChangeSet>>;

    /// Broadcasts this user's presence. Callers treat failures as non-fatal.
    async fn update_presence(&self, status: PresenceStatus) -> SyncResult<()>;

    fn connection_status(&self) -> ConnectionStatus;

    fn stats(&self) -> AdapterStats;
}

// =============================================================================
// Counters
// =============================================================================

/// Snapshot of an adapter's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStats {
    pub total_pushed: u64,
    pub total_pulled: u64,
}

/// Lock-free counters shared by the adapter implementations.
#[derive(Debug, Default)]
pub(crate) struct AdapterCounters {
    pushed: AtomicU64,
    pulled: AtomicU64,
}

impl AdapterCounters {
    pub(crate) fn record_push(&self) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pull(&self, count: usize) {
        self.pulled.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AdapterStats {
        AdapterStats {
            total_pushed: self.pushed.load(Ordering::Relaxed),
            total_pulled: self.pulled.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Session bookkeeping
// =============================================================================

/// The household/user pair an adapter is connected for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub household_id: String,
    pub user_id: String,
}

#[derive(Debug, Default)]
struct SessionInner {
    session: Option<Session>,
    last_heartbeat: Option<DateTime<Utc>>,
    latency: Duration,
}

/// Session and heartbeat state behind a short-lived lock.
///
/// Never held across an await.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    inner: Mutex<SessionInner>,
}

impl SessionState {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true if already connected for this exact pair.
    pub(crate) fn is_open_for(&self, household_id: &str, user_id: &str) -> bool {
        self.lock()
            .session
            .as_ref()
            .is_some_and(|s| s.household_id == household_id && s.user_id == user_id)
    }

    pub(crate) fn open(&self, household_id: &str, user_id: &str) {
        let mut inner = self.lock();
        inner.session = Some(Session {
            household_id: household_id.to_string(),
            user_id: user_id.to_string(),
        });
        inner.last_heartbeat = Some(Utc::now());
        inner.latency = Duration::ZERO;
    }

    /// Ends the session; returns it if there was one.
    pub(crate) fn close(&self) -> Option<Session> {
        let mut inner = self.lock();
        inner.last_heartbeat = None;
        inner.latency = Duration::ZERO;
        inner.session.take()
    }

    pub(crate) fn current(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock().session.is_some()
    }

    /// Records a successful round trip.
    pub(crate) fn heartbeat(&self, latency: Duration) {
        let mut inner = self.lock();
        inner.last_heartbeat = Some(Utc::now());
        inner.latency = latency;
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        let inner = self.lock();
        ConnectionStatus {
            connected: inner.session.is_some(),
            last_heartbeat: inner.last_heartbeat,
            latency: inner.latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let state = SessionState::default();
        assert!(!state.is_open());
        assert_eq!(state.status(), ConnectionStatus::disconnected());

        state.open("h1", "alice");
        assert!(state.is_open_for("h1", "alice"));
        assert!(!state.is_open_for("h1", "bob"));
        assert!(state.status().connected);
        assert!(state.status().last_heartbeat.is_some());

        state.heartbeat(Duration::from_millis(12));
        assert_eq!(state.status().latency, Duration::from_millis(12));

        assert_eq!(state.close().map(|s| s.user_id), Some("alice".to_string()));
        assert!(state.close().is_none());
        assert!(!state.status().connected);
    }

    #[test]
    fn test_counters() {
        let counters = AdapterCounters::default();
        counters.record_push();
        counters.record_push();
        counters.record_pull(5);
        assert_eq!(
            counters.snapshot(),
            AdapterStats {
                total_pushed: 2,
                total_pulled: 5
            }
        );
    }
}

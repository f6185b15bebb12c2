//! # Local Adapter
//!
//! The adapter used when sync is disabled (local-only mode, tests).
//!
//! Behaves like a backend that accepts everything and never has anything
//! new: `push` succeeds, `pull` returns an empty batch, and both still
//! update the counters. Like the network adapters, both need a session.
//! Disabling sync changes no control flow, only the absence of remote
//! effects.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use hearth_core::{ChangeSet, ConnectionStatus, PresenceStatus};

use super::{AdapterCounters, AdapterStats, SessionState, SyncAdapter};
use crate::error::{SyncError, SyncResult};

/// No-op adapter.
#[derive(Debug, Default)]
pub struct LocalAdapter {
    session: SessionState,
    counters: AdapterCounters,
}

impl LocalAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncAdapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn connect(&self, household_id: &str, user_id: &str) -> SyncResult<()> {
        if !self.session.is_open_for(household_id, user_id) {
            self.session.open(household_id, user_id);
            info!(household_id = %household_id, user_id = %user_id, "Local adapter connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> SyncResult<()> {
        if self.session.close().is_some() {
            info!("Local adapter disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_open()
    }

    async fn push(&self, change: &ChangeSet) -> SyncResult<()> {
        if !self.session.is_open() {
            return Err(SyncError::NotConnected);
        }
        debug!(
            entity_type = %change.entity_type(),
            entity_id = %change.entity_id(),
            "Local push (no-op)"
        );
        self.counters.record_push();
        self.session.heartbeat(Duration::ZERO);
        Ok(())
    }

    async fn pull(&self, _since: Option<DateTime<Utc>>) -> SyncResult<Vec<ChangeSet>> {
        if !self.session.is_open() {
            return Err(SyncError::NotConnected);
        }
        self.counters.record_pull(0);
        self.session.heartbeat(Duration::ZERO);
        Ok(Vec::new())
    }

    async fn update_presence(&self, status: PresenceStatus) -> SyncResult<()> {
        debug!(%status, "Local presence update (no-op)");
        Ok(())
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.session.status()
    }

    fn stats(&self) -> AdapterStats {
        self.counters.snapshot()
    }
}

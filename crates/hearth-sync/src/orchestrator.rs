//! # Sync Orchestrator
//!
//! Binds the offline queue, the adapter and the connectivity monitor into
//! the one control loop the application talks to.
//!
//! ## Orchestrator Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncOrchestrator                                 │
//! │                                                                         │
//! │  record_local_change() ──► OfflineQueue.enqueue ──► (realtime) sync()  │
//! │                                                                         │
//! │  sync()  ── single flight ──────────────────────────────────────────┐  │
//! │    │                                                                 │  │
//! │    ├─ halted?          → Err(Halted)                                 │  │
//! │    ├─ already running? → AlreadyRunning                              │  │
//! │    ├─ offline?         → Offline                                     │  │
//! │    ├─ adapter.connect  (ConnectionError → Offline + last_error)      │  │
//! │    ├─ queue.drain      (transport errors → last_error, retry later)  │  │
//! │    ├─ adapter.pull(full window) → InboundApplier                     │  │
//! │    └─ Completed(SyncReport)                                          │  │
//! │                                                                      │  │
//! │  Storage failures halt automatic draining until reset().  ◄─────────┘  │
//! │                                                                         │
//! │  BACKGROUND LOOP (spawn):                                              │
//! │  • BecameOnline  → settle delay → sync()                               │
//! │  • BecameOffline → status only; in-flight pushes fail naturally        │
//! │  • poll interval → sync()                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Events
//! Every status change goes to the [`SyncEventEmitter`], which the UI layer
//! implements. [`NoOpEmitter`] discards them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use hearth_core::{
    ChangeSet, Clock, ConnectionStatus, EntityRecord, PresenceInfo, PresenceStatus, SyncAction,
    SystemClock,
};

use crate::adapter::SyncAdapter;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::{SyncError, SyncResult};
use crate::inbound::InboundApplier;
use crate::queue::{AbandonedAction, DrainStop, OfflineQueue};
use crate::store::{LocalStore, SqliteStore};

// =============================================================================
// Sync Status
// =============================================================================

/// Replication status for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Whether the backend is reachable.
    pub online: bool,

    /// Whether a sync pass is running.
    pub syncing: bool,

    /// Local changes not yet acknowledged.
    pub pending_count: usize,

    /// Start time of the last successful pull.
    #[ts(type = "string | null")]
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Last error message, if the last pass hit one.
    pub last_error: Option<String>,

    /// Abandoned actions not yet acknowledged by the user.
    pub abandoned_count: usize,

    /// Automatic draining is stopped until reset().
    pub halted: bool,

    #[ts(skip)]
    #[serde(skip)]
    pub connection: ConnectionStatus,
}

/// Outcome of a [`SyncOrchestrator::sync`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Another pass was in progress; this call did nothing.
    AlreadyRunning,
    /// The backend is unreachable; nothing was attempted or connect failed.
    Offline,
    Completed(SyncReport),
}

/// Counts from one completed sync pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub pushed: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub pulled: usize,
    pub applied: usize,
    pub superseded: usize,
    pub pending: usize,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receiver of orchestrator events (implemented by the UI integration).
pub trait SyncEventEmitter: Send + Sync {
    fn emit_status(&self, status: &SyncStatus);

    /// `pending` still queued, `pushed` in the pass that just ran.
    fn emit_progress(&self, pending: usize, pushed: usize);

    fn emit_error(&self, message: &str, retryable: bool);

    /// Called once per abandoned action.
    fn emit_abandoned(&self, abandoned: &AbandonedAction);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _pending: usize, _pushed: usize) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
    fn emit_abandoned(&self, _abandoned: &AbandonedAction) {}
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Debug, Default)]
struct RunState {
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    abandoned: Vec<AbandonedAction>,
    presence: Option<PresenceInfo>,
}

struct Inner {
    config: SyncConfig,
    adapter: Arc<dyn SyncAdapter>,
    store: Arc<dyn LocalStore>,
    queue: OfflineQueue,
    connectivity: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
    emitter: Arc<dyn SyncEventEmitter>,
    inbound: InboundApplier,
    syncing: AtomicBool,
    halted: AtomicBool,
    state: RwLock<RunState>,
}

/// The replication engine for one household session.
///
/// Cheap to clone: clones drive the same session.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

/// Clears the in-flight flag however the pass ends, including when the
/// caller drops the `sync()` future.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncOrchestrator {
    pub fn builder(config: SyncConfig) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn adapter(&self) -> &Arc<dyn SyncAdapter> {
        &self.inner.adapter
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Opens the adapter session for the configured household and user.
    ///
    /// A failure marks the session offline and is returned.
    pub async fn connect(&self) -> SyncResult<()> {
        let inner = &self.inner;
        match inner
            .adapter
            .connect(inner.config.household_id(), inner.config.user_id())
            .await
        {
            Ok(()) => {
                inner.state.write().await.presence = None;
                inner.connectivity.report(true);
                self.persist_online(true).await;
                info!(
                    household_id = %inner.config.household_id(),
                    adapter = inner.adapter.name(),
                    "Sync session connected"
                );
                self.publish_status().await;
                Ok(())
            }
            Err(e) => {
                self.connection_failed(&e).await;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> SyncResult<()> {
        self.inner.adapter.disconnect().await?;
        self.inner.state.write().await.presence = None;
        info!(household_id = %self.inner.config.household_id(), "Sync session disconnected");
        self.publish_status().await;
        Ok(())
    }

    // =========================================================================
    // Local Changes
    // =========================================================================

    /// Queues a local change, then kicks off a background sync when
    /// realtime push is enabled and the backend is reachable.
    pub async fn record_local_change(&self, change: ChangeSet) -> SyncResult<SyncAction> {
        let inner = &self.inner;
        if inner.halted.load(Ordering::SeqCst) {
            return Err(SyncError::Halted);
        }

        let action = match inner.queue.enqueue(change, inner.clock.as_ref()).await {
            Ok(action) => action,
            Err(e) => return Err(self.fail(e).await),
        };
        inner
            .emitter
            .emit_progress(inner.queue.pending_count().await, 0);

        if inner.config.sync.realtime && inner.connectivity.is_online() {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.sync().await {
                    error!(error = %e, "Realtime sync failed");
                }
            });
        }

        Ok(action)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Drains the queue and pulls remote changes.
    ///
    /// Concurrent calls collapse into one: the losers return
    /// [`SyncOutcome::AlreadyRunning`]. Transport problems are reported in
    /// the status, never as errors; only storage failures are returned.
    pub async fn sync(&self) -> SyncResult<SyncOutcome> {
        let inner = &self.inner;
        if inner.halted.load(Ordering::SeqCst) {
            return Err(SyncError::Halted);
        }
        if inner
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync already in progress");
            return Ok(SyncOutcome::AlreadyRunning);
        }
        let _flight = FlightGuard(&inner.syncing);

        let outcome = self.run_pass().await;
        self.publish_status().await;
        outcome
    }

    async fn run_pass(&self) -> SyncResult<SyncOutcome> {
        let inner = &self.inner;

        if !inner.connectivity.is_online() {
            debug!("Offline, skipping sync");
            return Ok(SyncOutcome::Offline);
        }

        if !inner.adapter.is_connected() {
            if let Err(e) = inner
                .adapter
                .connect(inner.config.household_id(), inner.config.user_id())
                .await
            {
                self.connection_failed(&e).await;
                return Ok(SyncOutcome::Offline);
            }
            inner.state.write().await.presence = None;
        }

        self.publish_status().await;
        let started = inner.clock.now();
        let mut report = SyncReport::default();
        let mut last_error = None;

        // Push
        let drain = match inner
            .queue
            .drain(inner.adapter.as_ref(), inner.clock.as_ref())
            .await
        {
            Ok(drain) => drain,
            Err(e) => return Err(self.fail(e).await),
        };
        report.pushed = drain.pushed;
        report.failed = drain.failed;
        report.abandoned = drain.abandoned.len();
        if drain.last_error.is_some() {
            last_error = drain.last_error.clone();
        }
        for abandoned in &drain.abandoned {
            inner.emitter.emit_abandoned(abandoned);
        }

        // Pull
        if drain.stopped != DrainStop::Disconnected {
            // Change timestamps come from the authoring device, so a change
            // pushed late can be older than our last pull. Pull the whole
            // window; replays are LWW no-ops.
            match inner.adapter.pull(None).await {
                Ok(changes) => {
                    report.pulled = changes.len();
                    let applied = match inner
                        .inbound
                        .apply_batch(&changes, &inner.queue, inner.store.as_ref())
                        .await
                    {
                        Ok(applied) => applied,
                        Err(e) => return Err(self.fail(e).await),
                    };
                    report.applied = applied.applied;
                    report.superseded = applied.superseded.len();

                    if let Err(e) = inner.store.set_last_sync(started).await {
                        return Err(self.fail(e).await);
                    }
                    inner.state.write().await.last_sync_at = Some(started);
                }
                Err(e) => {
                    warn!(error = %e, "Pull failed");
                    last_error = Some(e.to_string());
                }
            }
        } else {
            last_error.get_or_insert_with(|| SyncError::NotConnected.to_string());
        }

        report.pending = inner.queue.pending_count().await;
        {
            let mut state = inner.state.write().await;
            state.abandoned.extend(drain.abandoned);
            state.last_error = last_error.clone();
        }

        if let Some(message) = &last_error {
            inner.emitter.emit_error(message, true);
        }
        inner.emitter.emit_progress(report.pending, report.pushed);

        info!(
            household_id = %inner.config.household_id(),
            pushed = report.pushed,
            failed = report.failed,
            abandoned = report.abandoned,
            pulled = report.pulled,
            applied = report.applied,
            pending = report.pending,
            "Sync pass complete"
        );
        Ok(SyncOutcome::Completed(report))
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn status(&self) -> SyncStatus {
        let inner = &self.inner;
        let state = inner.state.read().await;
        SyncStatus {
            online: inner.connectivity.is_online(),
            syncing: inner.syncing.load(Ordering::SeqCst),
            pending_count: inner.queue.pending_count().await,
            last_sync_at: state.last_sync_at,
            last_error: state.last_error.clone(),
            abandoned_count: state.abandoned.len(),
            halted: inner.halted.load(Ordering::SeqCst),
            connection: inner.adapter.connection_status(),
        }
    }

    /// Queue entries, head first.
    pub async fn pending_actions(&self) -> Vec<SyncAction> {
        self.inner.queue.snapshot().await
    }

    /// Returns and clears the abandoned actions reported so far.
    pub async fn acknowledge_abandoned(&self) -> Vec<AbandonedAction> {
        let abandoned = std::mem::take(&mut self.inner.state.write().await.abandoned);
        self.publish_status().await;
        abandoned
    }

    /// Resumes automatic draining after a fatal error.
    pub async fn reset(&self) {
        self.inner.halted.store(false, Ordering::SeqCst);
        self.inner.state.write().await.last_error = None;
        info!(household_id = %self.inner.config.household_id(), "Sync reset");
        self.publish_status().await;
    }

    // =========================================================================
    // Presence
    // =========================================================================

    /// Broadcasts this user's presence. Failures are logged, never returned.
    pub async fn update_presence(&self, status: PresenceStatus) {
        let inner = &self.inner;
        if let Err(e) = inner.adapter.update_presence(status).await {
            warn!(error = %e, %status, "Presence update failed");
        }

        inner.state.write().await.presence = Some(PresenceInfo::new(
            inner.config.household_id(),
            inner.config.user_id(),
            status,
            inner.clock.now(),
        ));
    }

    /// This user's presence in the current session.
    pub async fn presence(&self) -> Option<PresenceInfo> {
        self.inner.state.read().await.presence.clone()
    }

    // =========================================================================
    // Entity Cache
    // =========================================================================

    pub async fn entity(&self, entity_type: &str, entity_id: &str) -> SyncResult<Option<EntityRecord>> {
        self.inner.store.entity(entity_type, entity_id).await
    }

    pub async fn entities(&self, entity_type: &str) -> SyncResult<Vec<EntityRecord>> {
        self.inner.store.entities(entity_type).await
    }

    // =========================================================================
    // Background Loop
    // =========================================================================

    /// Starts the background loop reacting to connectivity events and the
    /// poll interval.
    pub fn spawn(&self) -> OrchestratorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let events = self.inner.connectivity.subscribe();
        let task = tokio::spawn(self.clone().run(events, shutdown_rx));

        OrchestratorHandle { shutdown_tx, task }
    }

    async fn run(
        self,
        mut events: broadcast::Receiver<ConnectivityEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!(household_id = %self.inner.config.household_id(), "Sync orchestrator starting");

        let settle = self.inner.config.settle_delay();
        let mut ticker = self.inner.config.poll_interval().map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,

                event = events.recv() => match event {
                    Ok(ConnectivityEvent::BecameOnline) => {
                        self.persist_online(true).await;
                        tokio::select! {
                            _ = tokio::time::sleep(settle) => {}
                            _ = shutdown_rx.recv() => break,
                        }
                        if self.inner.connectivity.is_online() {
                            self.background_sync().await;
                        } else {
                            debug!("Went offline again while settling");
                        }
                    }
                    Ok(ConnectivityEvent::BecameOffline) => {
                        self.persist_online(false).await;
                        self.publish_status().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Connectivity events lagged");
                        if self.inner.connectivity.is_online() {
                            self.background_sync().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = next_tick(&mut ticker) => {
                    if self.inner.connectivity.is_online() {
                        self.background_sync().await;
                    }
                }
            }
        }

        info!(household_id = %self.inner.config.household_id(), "Sync orchestrator stopped");
    }

    async fn background_sync(&self) {
        match self.sync().await {
            Ok(outcome) => debug!(?outcome, "Background sync finished"),
            Err(SyncError::Halted) => debug!("Background sync skipped, halted"),
            Err(e) => error!(error = %e, "Background sync failed"),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn connection_failed(&self, e: &SyncError) {
        warn!(error = %e, adapter = self.inner.adapter.name(), "Could not connect to sync backend");
        self.inner.connectivity.report(false);
        self.persist_online(false).await;
        self.inner.state.write().await.last_error = Some(e.to_string());
        self.inner.emitter.emit_error(&e.to_string(), true);
    }

    /// Records a failure; storage failures halt automatic draining.
    async fn fail(&self, e: SyncError) -> SyncError {
        if e.is_fatal() {
            error!(error = %e, "Fatal sync error, halting");
            self.inner.halted.store(true, Ordering::SeqCst);
        }
        self.inner.state.write().await.last_error = Some(e.to_string());
        self.inner.emitter.emit_error(&e.to_string(), !e.is_fatal());
        self.publish_status().await;
        e
    }

    async fn persist_online(&self, online: bool) {
        if let Err(e) = self.inner.store.set_online(online).await {
            warn!(error = %e, online, "Could not persist online flag");
        }
    }

    async fn publish_status(&self) {
        let status = self.status().await;
        self.inner.emitter.emit_status(&status);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Controls a running background loop.
pub struct OrchestratorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) -> SyncResult<()> {
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| SyncError::ChannelError(format!("orchestrator task failed: {}", e)))
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`SyncOrchestrator`].
///
/// Anything not supplied comes from the config: the adapter from
/// [`SyncConfig::build_adapter`], the store from the configured database
/// path.
pub struct SyncOrchestratorBuilder {
    config: SyncConfig,
    adapter: Option<Arc<dyn SyncAdapter>>,
    store: Option<Arc<dyn LocalStore>>,
    connectivity: Option<ConnectivityMonitor>,
    clock: Option<Arc<dyn Clock>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl SyncOrchestratorBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncOrchestratorBuilder {
            config,
            adapter: None,
            store: None,
            connectivity: None,
            clock: None,
            emitter: None,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SyncAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Validates the config, restores the persisted queue and builds the
    /// orchestrator.
    pub async fn build(self) -> SyncResult<SyncOrchestrator> {
        self.config.validate()?;

        let adapter = match self.adapter {
            Some(adapter) => adapter,
            None => self.config.build_adapter()?,
        };
        let store: Arc<dyn LocalStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                SqliteStore::open(self.config.database_path(), self.config.household_id()).await?,
            ),
        };
        let connectivity = match self.connectivity {
            Some(connectivity) => connectivity,
            None => ConnectivityMonitor::new(store.is_online().await?),
        };

        let queue = OfflineQueue::open(store.clone(), self.config.retry_policy()).await?;
        let state = RunState {
            last_sync_at: store.last_sync().await?,
            ..Default::default()
        };

        info!(
            household_id = %self.config.household_id(),
            adapter = adapter.name(),
            pending = queue.pending_count().await,
            "Sync orchestrator built"
        );

        Ok(SyncOrchestrator {
            inner: Arc::new(Inner {
                inbound: InboundApplier::new(self.config.sync.conflict_mode),
                config: self.config,
                adapter,
                store,
                queue,
                connectivity,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                emitter: self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter)),
                syncing: AtomicBool::new(false),
                halted: AtomicBool::new(false),
                state: RwLock::new(state),
            }),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

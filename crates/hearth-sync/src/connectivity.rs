//! # Connectivity Monitor
//!
//! Turns a reachability signal into `BecameOnline` / `BecameOffline`
//! events on a broadcast channel.
//!
//! ```text
//! ┌──────────────────┐  report(bool)  ┌──────────────────────┐  broadcast  ┌──────────────┐
//! │ platform signal  │ ─────────────► │ ConnectivityMonitor  │ ──────────► │ Orchestrator │
//! │ or probe task    │                │ emits on transitions │             │ (subscriber) │
//! └──────────────────┘                └──────────────────────┘             └──────────────┘
//! ```
//!
//! Repeated reports of the same state emit nothing, so a flapping probe
//! cannot flood subscribers. The settle delay before draining belongs to
//! the orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Capacity of the event channel. Slow subscribers see `Lagged` and
/// should re-read [`ConnectivityMonitor::is_online`].
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// A reachability transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

#[derive(Debug)]
struct MonitorInner {
    online: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
}

/// Tracks whether the backend is reachable. Clones share state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ConnectivityMonitor {
            inner: Arc::new(MonitorInner {
                online: AtomicBool::new(initially_online),
                events,
            }),
        }
    }

    /// Records the latest reachability observation.
    ///
    /// Returns the event emitted, if the state changed.
    pub fn report(&self, reachable: bool) -> Option<ConnectivityEvent> {
        let was = self.inner.online.swap(reachable, Ordering::SeqCst);
        if was == reachable {
            return None;
        }

        let event = if reachable {
            ConnectivityEvent::BecameOnline
        } else {
            ConnectivityEvent::BecameOffline
        };
        info!(?event, "Connectivity changed");

        // No subscribers is fine.
        let _ = self.inner.events.send(event);
        Some(event)
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    /// Polls `probe` every `interval` and reports each result.
    ///
    /// The task runs until the handle is aborted.
    pub fn spawn_probe(
        &self,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let reachable = probe.probe().await;
                debug!(probe = ?probe, reachable, "Reachability probe");
                monitor.report(reachable);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        ConnectivityMonitor::new(false)
    }
}

// =============================================================================
// Probes
// =============================================================================

/// Source of reachability observations.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + std::fmt::Debug {
    async fn probe(&self) -> bool;
}

/// Reachable if a TCP connection to the backend opens in time.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    /// `addr` is `host:port`.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        TcpProbe {
            addr: addr.into(),
            timeout,
        }
    }

    /// Probe for the host and port of a backend URL.
    pub fn for_url(url: &str, timeout: Duration) -> SyncResult<Self> {
        let url = Url::parse(url)?;
        let host = url
            .host_str()
            .ok_or_else(|| SyncError::InvalidUrl(format!("no host in {}", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| SyncError::InvalidUrl(format!("no port for {}", url)))?;
        Ok(TcpProbe::new(format!("{}:{}", host, port), timeout))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_emits_only_on_transitions() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.report(false), None);
        assert_eq!(monitor.report(true), Some(ConnectivityEvent::BecameOnline));
        assert_eq!(monitor.report(true), None);
        assert_eq!(monitor.report(false), Some(ConnectivityEvent::BecameOffline));

        assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::BecameOnline);
        assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::BecameOffline);
        assert!(rx.try_recv().is_err());
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = ConnectivityMonitor::default();
        let other = monitor.clone();
        other.report(true);
        assert!(monitor.is_online());
    }

    #[derive(Debug, Default)]
    struct Toggle(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for Toggle {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_task_reports() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();
        let probe = Arc::new(Toggle::default());

        let task = monitor.spawn_probe(probe.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!monitor.is_online());

        probe.0.store(true, Ordering::SeqCst);
        assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::BecameOnline);

        probe.0.store(false, Ordering::SeqCst);
        assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::BecameOffline);
        task.abort();
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(probe.probe().await);

        drop(listener);
        assert!(!probe.probe().await);
    }

    #[test]
    fn test_probe_for_url() {
        let probe = TcpProbe::for_url("wss://sync.example.com/ws", Duration::from_secs(1)).unwrap();
        assert_eq!(probe.addr(), "sync.example.com:443");

        let probe = TcpProbe::for_url("ws://10.0.0.5:9000/ws", Duration::from_secs(1)).unwrap();
        assert_eq!(probe.addr(), "10.0.0.5:9000");
    }
}

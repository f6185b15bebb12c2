//! # WebSocket Adapter
//!
//! The network-backed adapter: one JSON request/response exchange per
//! push or pull over a WebSocket session.
//!
//! ## Session Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  connect(household, user)                                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────────┐  fail (transient)   ┌──────────────┐                 │
//! │  │ ws handshake │ ──────────────────► │   backoff    │──┐              │
//! │  │ Hello/Welcome│ ◄────────────────── │ (bounded by  │  │ elapsed >    │
//! │  └──────┬───────┘                     │ connect tmo) │  │ connect tmo  │
//! │         │ ok                          └──────────────┘  ▼              │
//! │         ▼                                        ConnectionError       │
//! │  ┌──────────────┐                                                      │
//! │  │  CONNECTED   │  push / pull, each bounded by request_timeout        │
//! │  └──────┬───────┘                                                      │
//! │         │ timeout / socket error                                       │
//! │         ▼                                                               │
//! │  session dropped, error surfaces as Push / Pull error                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests are serialized by the stream lock, so responses never
//! interleave. A hung backend cannot wedge the drain: the timeout fires,
//! the session is dropped, and the queue's retry policy takes over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use hearth_core::{ChangeSet, ConnectionStatus, PresenceStatus};

use super::{AdapterCounters, AdapterStats, SessionState, SyncAdapter};
use crate::error::{SyncError, SyncResult};
use crate::protocol::SyncMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Adapter talking to the sync backend over WebSocket.
pub struct WsAdapter {
    url: Url,
    connect_timeout: Duration,
    request_timeout: Duration,
    stream: Mutex<Option<WsStream>>,
    session: SessionState,
    counters: AdapterCounters,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for WsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsAdapter")
            .field("url", &self.url.as_str())
            .field("connected", &self.session.is_open())
            .finish()
    }
}

impl WsAdapter {
    /// Creates an adapter for a `ws://` or `wss://` URL. Does not connect.
    pub fn new(url: &str, connect_timeout: Duration, request_timeout: Duration) -> SyncResult<Self> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidUrl(format!(
                "expected ws:// or wss://, got: {}",
                url
            )));
        }

        Ok(WsAdapter {
            url,
            connect_timeout,
            request_timeout,
            stream: Mutex::new(None),
            session: SessionState::default(),
            counters: AdapterCounters::default(),
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// One connection attempt: WebSocket handshake, then Hello/Welcome.
    async fn open_session(
        &self,
        household_id: &str,
        user_id: &str,
    ) -> Result<WsStream, backoff::Error<SyncError>> {
        let (mut ws, response) = match timeout(self.connect_timeout, connect_async(self.url.as_str())).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(backoff::Error::transient(SyncError::Connection(e.to_string()))),
            Err(_) => {
                return Err(backoff::Error::transient(SyncError::Connection(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                ))))
            }
        };
        debug!(status = ?response.status(), "WebSocket handshake complete");

        send(&mut ws, &SyncMessage::hello(household_id, user_id))
            .await
            .map_err(|e| backoff::Error::transient(SyncError::Connection(e.to_string())))?;

        match timeout(self.connect_timeout, next_message(&mut ws)).await {
            Ok(Ok(SyncMessage::Welcome(welcome))) => {
                debug!(server_time = %welcome.server_time, "Session accepted");
                Ok(ws)
            }
            Ok(Ok(SyncMessage::Error { code, message })) => Err(backoff::Error::permanent(
                SyncError::Connection(format!("rejected by backend ({}): {}", code, message)),
            )),
            Ok(Ok(other)) => Err(backoff::Error::permanent(SyncError::Connection(format!(
                "expected Welcome, got {}",
                other.type_name()
            )))),
            Ok(Err(e)) => Err(backoff::Error::transient(SyncError::Connection(e.to_string()))),
            Err(_) => Err(backoff::Error::transient(SyncError::Connection(
                "handshake timed out".into(),
            ))),
        }
    }

    /// Sends a request and waits for the response carrying the same
    /// request id, bounded by the request timeout.
    ///
    /// Any failure drops the session. `NotConnected` is returned only when
    /// there was no session to send on.
    async fn round_trip(&self, request: SyncMessage) -> SyncResult<SyncMessage> {
        let mut guard = self.stream.lock().await;
        let ws = guard.as_mut().ok_or(SyncError::NotConnected)?;
        let request_id = request.request_id();
        let started = Instant::now();

        let exchange = async {
            send(ws, &request).await?;
            loop {
                match next_message(ws).await? {
                    SyncMessage::Ping { timestamp } => send(ws, &SyncMessage::pong(timestamp)).await?,
                    SyncMessage::Error { code, message } => {
                        return Err(SyncError::Protocol(format!("{}: {}", code, message)))
                    }
                    msg if msg.request_id().is_some() && msg.request_id() == request_id => {
                        return Ok(msg)
                    }
                    msg => debug!(msg_type = %msg.type_name(), "Ignoring unsolicited message"),
                }
            }
        };
        let outcome = timeout(self.request_timeout, exchange).await;

        match outcome {
            Ok(Ok(response)) => {
                self.session.heartbeat(started.elapsed());
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Request failed, dropping session");
                *guard = None;
                self.session.close();
                // The request may have reached the backend, so losing the
                // session now is a failed attempt, not a missing session.
                Err(match e {
                    SyncError::NotConnected => {
                        SyncError::Connection("backend closed the session mid-request".into())
                    }
                    other => other,
                })
            }
            Err(_) => {
                warn!(timeout = ?self.request_timeout, "Request timed out, dropping session");
                *guard = None;
                self.session.close();
                Err(SyncError::Connection(format!(
                    "no response within {:?}",
                    self.request_timeout
                )))
            }
        }
    }
}

async fn send(ws: &mut WsStream, msg: &SyncMessage) -> SyncResult<()> {
    ws.send(WsMessage::Text(msg.to_json()?.into())).await?;
    Ok(())
}

/// Next protocol message, answering transport-level pings on the way.
async fn next_message(ws: &mut WsStream) -> SyncResult<SyncMessage> {
    while let Some(frame) = ws.next().await {
        match frame? {
            WsMessage::Text(text) => return SyncMessage::from_json(&text),
            WsMessage::Ping(data) => ws.send(WsMessage::Pong(data)).await?,
            WsMessage::Close(frame) => {
                debug!(?frame, "Backend closed the session");
                return Err(SyncError::NotConnected);
            }
            _ => {}
        }
    }
    Err(SyncError::NotConnected)
}

#[async_trait]
impl SyncAdapter for WsAdapter {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&self, household_id: &str, user_id: &str) -> SyncResult<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() && self.session.is_open_for(household_id, user_id) {
            return Ok(());
        }

        if let Some(mut old) = guard.take() {
            let _ = old.close(None).await;
            self.session.close();
        }

        info!(url = %self.url, household_id = %household_id, "Connecting to sync backend");

        let policy = ExponentialBackoff {
            current_interval: Duration::from_millis(200),
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            multiplier: 2.0,
            max_elapsed_time: Some(self.connect_timeout),
            ..Default::default()
        };
        let ws = backoff::future::retry(policy, || async move {
            self.open_session(household_id, user_id).await.map_err(|e| {
                if let backoff::Error::Transient { ref err, .. } = e {
                    debug!(error = %err, "Connect attempt failed");
                }
                e
            })
        })
        .await?;

        *guard = Some(ws);
        self.session.open(household_id, user_id);
        info!(url = %self.url, "Connected to sync backend");
        Ok(())
    }

    async fn disconnect(&self) -> SyncResult<()> {
        let mut guard = self.stream.lock().await;
        if let Some(mut ws) = guard.take() {
            let _ = ws.close(None).await;
            info!(url = %self.url, "Disconnected from sync backend");
        }
        self.session.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_open()
    }

    async fn push(&self, change: &ChangeSet) -> SyncResult<()> {
        let request = SyncMessage::Push {
            request_id: self.next_id(),
            change: change.clone(),
        };

        match self.round_trip(request).await {
            Ok(SyncMessage::PushAck { .. }) => {
                self.counters.record_push();
                Ok(())
            }
            Ok(SyncMessage::PushRejected { reason, .. }) => {
                Err(SyncError::push(change.entity_id(), reason))
            }
            Ok(other) => Err(SyncError::push(
                change.entity_id(),
                format!("unexpected {}", other.type_name()),
            )),
            Err(SyncError::NotConnected) => Err(SyncError::NotConnected),
            Err(e) => Err(SyncError::push(change.entity_id(), e)),
        }
    }

    async fn pull(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<ChangeSet>> {
        let request = SyncMessage::Pull {
            request_id: self.next_id(),
            since,
        };

        match self.round_trip(request).await {
            Ok(SyncMessage::PullResult { changes, .. }) => {
                self.counters.record_pull(changes.len());
                Ok(changes)
            }
            Ok(other) => Err(SyncError::Pull(format!("unexpected {}", other.type_name()))),
            Err(SyncError::NotConnected) => Err(SyncError::NotConnected),
            Err(e) => Err(SyncError::Pull(e.to_string())),
        }
    }

    async fn update_presence(&self, status: PresenceStatus) -> SyncResult<()> {
        let session = self.session.current().ok_or(SyncError::NotConnected)?;
        let mut guard = self.stream.lock().await;
        let ws = guard.as_mut().ok_or(SyncError::NotConnected)?;

        let msg = SyncMessage::Presence {
            user_id: session.user_id,
            status,
            updated_at: Utc::now(),
        };
        send(ws, &msg).await
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.session.status()
    }

    fn stats(&self) -> AdapterStats {
        self.counters.snapshot()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

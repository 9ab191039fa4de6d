//! Connection registry.
//!
//! [`PreviewManager`] is the single source of truth for "what is the
//! current state of source X's preview". Each source has at most one entry;
//! each entry has at most one attempt allowed to change it. Failures are
//! recorded in the entry, never returned to the caller.

pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::PreviewConfig;
use crate::error::{PreviewError, Result};
use crate::peer::{MediaStream, PoolStats, RtcTransportFactory, TransportFactory, TransportPool, MAX_POOL_SIZE};
use crate::retry::Reconnect;
use crate::signaling::negotiator::cancellable;
use crate::signaling::{
    AvailabilityProber, HttpRelay, NegotiationOutcome, NegotiationTimeouts, Negotiator, RelayApi,
    SignalConnector, WsConnector,
};

pub use state::{ConnectionSnapshot, ConnectionStatus, StatusEvent};
use state::Connection;

const EVENT_CAPACITY: usize = 64;

struct Inner {
    config: PreviewConfig,
    relay: Arc<dyn RelayApi>,
    prober: AvailabilityProber,
    negotiator: Negotiator,
    connections: Mutex<HashMap<String, Connection>>,
    events: broadcast::Sender<StatusEvent>,
    next_attempt: AtomicU64,
}

/// Keyed registry of preview connections.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct PreviewManager {
    inner: Arc<Inner>,
}

impl PreviewManager {
    pub fn new(
        config: PreviewConfig,
        factory: Arc<dyn TransportFactory>,
        relay: Arc<dyn RelayApi>,
        connector: Arc<dyn SignalConnector>,
    ) -> Self {
        let pool = Arc::new(TransportPool::with_capacity(
            factory,
            config.pool.max_size.min(MAX_POOL_SIZE),
        ));
        let prober = AvailabilityProber::new(relay.clone(), config.probe_ttl(), config.probe_timeout());
        let negotiator = Negotiator::new(pool, relay.clone(), connector, NegotiationTimeouts::from(&config));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                relay,
                prober,
                negotiator,
                connections: Mutex::new(HashMap::new()),
                events,
                next_attempt: AtomicU64::new(0),
            }),
        }
    }

    /// Production wiring: webrtc-rs transports, HTTP relay, WebSocket signaling.
    pub fn from_config(config: PreviewConfig) -> Result<Self> {
        config.validate()?;
        let factory = Arc::new(RtcTransportFactory::new(&config.ice_servers)?);
        let relay = Arc::new(HttpRelay::new(&config.relay_url, config.request_timeout())?);
        Ok(Self::new(config, factory, relay, Arc::new(WsConnector)))
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.inner.config
    }

    /// Probe the relay and fill the transport pool ahead of the first start.
    ///
    /// Returns whether the relay answered.
    pub async fn pre_warm(&self) -> bool {
        let available = self.inner.prober.pre_warm().await;
        let count = self.inner.config.pool.pre_warm;
        match self.inner.negotiator.pool().pre_warm(count).await {
            Ok(added) => log::debug!("Pre-warm: relay available={}, {} transport(s) ready", available, added),
            Err(e) => log::warn!("Pre-warming transports failed: {}", e),
        }
        available
    }

    /// Start a preview for `source_id` and wait for the attempt to settle.
    ///
    /// A no-op while the source is loading, connecting or playing. Otherwise
    /// any previous attempt is cancelled and replaced. Dropping the returned
    /// future does not cancel the attempt; [`stop_connection`](Self::stop_connection) does.
    pub async fn start_connection(&self, source_id: &str) {
        let Some((attempt, cancel, finished)) = self.begin_attempt(source_id) else {
            log::debug!("[{}] Start ignored, attempt already active", source_id);
            return;
        };
        self.emit(source_id, ConnectionStatus::Loading);

        let manager = self.clone();
        let id = source_id.to_string();
        let handle = tokio::spawn(async move {
            let _finished = finished.drop_guard();
            manager.drive(&id, attempt, cancel).await
        });
        if let Err(e) = handle.await {
            log::error!("[{}] Connection attempt aborted: {}", source_id, e);
        }
    }

    /// Cancel any attempt, release the transport and forget the source.
    ///
    /// Returns only after a cancelled attempt has given its transport back.
    pub async fn stop_connection(&self, source_id: &str) {
        let Some(conn) = self.inner.connections.lock().remove(source_id) else {
            return;
        };
        conn.cancel.cancel();
        conn.finished.cancelled().await;

        if let Some(session) = conn.session {
            self.inner.negotiator.release(session).await;
        }
        if let Err(e) = self.inner.relay.stop_source(source_id).await {
            log::debug!("[{}] Ignoring stop-source failure: {}", source_id, e);
        }

        log::info!("[{}] Stopped", source_id);
        self.emit(source_id, ConnectionStatus::Idle);
    }

    /// Re-attempt a source in `error` or `unavailable`; ignored otherwise.
    pub async fn retry_connection(&self, source_id: &str) {
        let retry_count = {
            let mut connections = self.inner.connections.lock();
            match connections.get_mut(source_id) {
                Some(conn) if conn.status.is_retryable() => {
                    conn.retry_count += 1;
                    conn.status = ConnectionStatus::Idle;
                    conn.error_message = None;
                    Some(conn.retry_count)
                }
                _ => None,
            }
        };
        let Some(retry_count) = retry_count else {
            log::debug!("[{}] Retry ignored, nothing to retry", source_id);
            return;
        };

        log::info!("[{}] Retrying (attempt {})", source_id, retry_count);
        self.emit(source_id, ConnectionStatus::Idle);
        self.inner.prober.invalidate().await;
        self.start_connection(source_id).await;
    }

    /// Stop every source. Used for full teardown.
    pub async fn stop_all_connections(&self) {
        let ids: Vec<String> = self.inner.connections.lock().keys().cloned().collect();
        futures_util::future::join_all(ids.iter().map(|id| self.stop_connection(id))).await;
    }

    /// Stop everything and close pooled transports.
    pub async fn shutdown(&self) {
        self.stop_all_connections().await;
        self.inner.negotiator.pool().drain().await;
    }

    pub fn get_stream(&self, source_id: &str) -> Option<MediaStream> {
        self.inner.connections.lock().get(source_id).and_then(Connection::stream)
    }

    /// Unknown sources are `idle`.
    pub fn get_status(&self, source_id: &str) -> ConnectionStatus {
        self.inner
            .connections
            .lock()
            .get(source_id)
            .map(|c| c.status)
            .unwrap_or_default()
    }

    pub fn get_error(&self, source_id: &str) -> Option<String> {
        self.inner
            .connections
            .lock()
            .get(source_id)
            .and_then(|c| c.error_message.clone())
    }

    pub fn snapshot(&self, source_id: &str) -> Option<ConnectionSnapshot> {
        self.inner.connections.lock().get(source_id).map(Connection::snapshot)
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.inner.connections.lock().keys().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.events.subscribe()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.negotiator.pool().stats()
    }

    fn emit(&self, source_id: &str, status: ConnectionStatus) {
        let _ = self.inner.events.send(StatusEvent {
            source_id: source_id.to_string(),
            status,
        });
    }

    /// Claim the entry for a new attempt, cancelling the previous one.
    fn begin_attempt(&self, source_id: &str) -> Option<(u64, CancellationToken, CancellationToken)> {
        let mut connections = self.inner.connections.lock();
        let conn = connections
            .entry(source_id.to_string())
            .or_insert_with(Connection::new);
        if conn.status.is_active() {
            return None;
        }

        conn.cancel.cancel();
        conn.cancel = CancellationToken::new();
        conn.finished = CancellationToken::new();
        conn.attempt = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        conn.status = ConnectionStatus::Loading;
        conn.error_message = None;
        Some((conn.attempt, conn.cancel.clone(), conn.finished.clone()))
    }

    /// Apply a transition if `attempt` still owns the entry.
    fn transition(&self, source_id: &str, attempt: u64, status: ConnectionStatus, error: Option<String>) -> bool {
        {
            let mut connections = self.inner.connections.lock();
            match connections.get_mut(source_id) {
                Some(conn) if conn.is_current(attempt) => {
                    conn.status = status;
                    conn.error_message = error;
                }
                _ => return false,
            }
        }
        self.emit(source_id, status);
        true
    }

    async fn drive(&self, source_id: &str, attempt: u64, cancel: CancellationToken) {
        match cancellable(&cancel, async { Ok(self.inner.prober.is_available().await) }).await {
            Ok(true) => {}
            Ok(false) => {
                log::info!("[{}] Relay unreachable", source_id);
                self.transition(
                    source_id,
                    attempt,
                    ConnectionStatus::Unavailable,
                    Some("Relay is not reachable".into()),
                );
                return;
            }
            Err(_) => return,
        }

        let source = match cancellable(&cancel, self.inner.relay.start_source(source_id)).await {
            Ok(source) => source,
            Err(PreviewError::Cancelled) => return,
            Err(e @ PreviewError::Unavailable(_)) => {
                self.inner.prober.invalidate().await;
                self.transition(source_id, attempt, ConnectionStatus::Unavailable, Some(e.to_string()));
                return;
            }
            Err(e) => {
                log::warn!("[{}] Start source failed: {}", source_id, e);
                self.inner.prober.invalidate().await;
                self.transition(source_id, attempt, ConnectionStatus::Error, Some(e.to_string()));
                return;
            }
        };

        if !source.available {
            log::info!("[{}] Source not available", source_id);
            self.transition(
                source_id,
                attempt,
                ConnectionStatus::Unavailable,
                Some("Source is not available".into()),
            );
            return;
        }

        if !self.transition(source_id, attempt, ConnectionStatus::Connecting, None) {
            return;
        }

        match self.inner.negotiator.negotiate(source_id, &source, &cancel).await {
            NegotiationOutcome::Connected(session) => {
                let stale = {
                    let mut connections = self.inner.connections.lock();
                    match connections.get_mut(source_id) {
                        Some(conn) if conn.is_current(attempt) => {
                            conn.status = ConnectionStatus::Playing;
                            conn.error_message = None;
                            conn.retry_count = 0;
                            conn.session = Some(session);
                            None
                        }
                        _ => Some(session),
                    }
                };
                match stale {
                    Some(session) => {
                        log::debug!("[{}] Attempt {} superseded, releasing its transport", source_id, attempt);
                        self.inner.negotiator.release(session).await;
                    }
                    None => {
                        log::info!("[{}] Playing", source_id);
                        self.emit(source_id, ConnectionStatus::Playing);
                    }
                }
            }
            NegotiationOutcome::Cancelled => {
                log::debug!("[{}] Attempt {} cancelled", source_id, attempt);
            }
            NegotiationOutcome::Failed(e) => {
                self.transition(source_id, attempt, ConnectionStatus::Error, Some(e.to_string()));
            }
        }
    }
}

/// Drives [`PreviewManager::retry_connection`] from a
/// [`RetryController`](crate::retry::RetryController).
pub struct PreviewReconnect {
    manager: PreviewManager,
    source_id: String,
}

impl PreviewReconnect {
    pub fn new(manager: PreviewManager, source_id: &str) -> Self {
        Self {
            manager,
            source_id: source_id.to_string(),
        }
    }
}

#[async_trait]
impl Reconnect for PreviewReconnect {
    async fn reconnect(&self) -> Result<()> {
        match self.manager.get_status(&self.source_id) {
            ConnectionStatus::Playing => return Ok(()),
            ConnectionStatus::Idle => self.manager.start_connection(&self.source_id).await,
            _ => self.manager.retry_connection(&self.source_id).await,
        }

        match self.manager.get_status(&self.source_id) {
            ConnectionStatus::Playing => Ok(()),
            ConnectionStatus::Unavailable => Err(PreviewError::Unavailable(
                self.manager.get_error(&self.source_id).unwrap_or_default(),
            )),
            ConnectionStatus::Idle => Err(PreviewError::Cancelled),
            status => Err(PreviewError::Protocol(
                self.manager
                    .get_error(&self.source_id)
                    .unwrap_or_else(|| format!("Connection is {}", status)),
            )),
        }
    }
}

//! Drives one negotiation attempt end to end: borrow a transport, bind
//! fresh listeners, run the source's protocol, and either hand the live
//! session to the caller or give the transport back to the pool.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::relay::{NegotiationProtocol, RelayApi, SourceInfo};
use super::ws_channel::SignalConnector;
use super::{whep, ws_peer};
use crate::config::PreviewConfig;
use crate::error::{PreviewError, Result};
use crate::peer::{MediaStream, Transport, TransportEvents, TransportPool};

/// Run one suspending step unless the attempt has been cancelled.
///
/// The token is checked before the step, raced against it, and checked
/// again once it completes.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(PreviewError::Cancelled);
    }
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PreviewError::Cancelled),
        output = step => output?,
    };
    if cancel.is_cancelled() {
        return Err(PreviewError::Cancelled);
    }
    Ok(output)
}

#[derive(Debug, Clone, Copy)]
pub struct NegotiationTimeouts {
    /// Upper bound on waiting for local ICE gathering (request/response)
    pub ice_gather_grace: Duration,
    /// Upper bound on waiting for the first track (request/response)
    pub track: Duration,
    /// Overall bound on the message-based exchange
    pub signaling: Duration,
}

impl From<&PreviewConfig> for NegotiationTimeouts {
    fn from(config: &PreviewConfig) -> Self {
        Self {
            ice_gather_grace: config.ice_gather_grace(),
            track: config.track_timeout(),
            signaling: config.signaling_timeout(),
        }
    }
}

/// A negotiated, playing preview.
pub struct PreviewSession {
    transport: Arc<dyn Transport>,
    stream: MediaStream,
    trickle: Option<JoinHandle<()>>,
}

impl PreviewSession {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }
}

impl std::fmt::Debug for PreviewSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewSession")
            .field("transport", &self.transport.id())
            .field("stream", &self.stream)
            .field("trickle", &self.trickle.is_some())
            .finish()
    }
}

/// Result of [`Negotiator::negotiate`]. Cancellation is not a failure.
#[derive(Debug)]
pub enum NegotiationOutcome {
    Connected(PreviewSession),
    Cancelled,
    Failed(PreviewError),
}

pub struct Negotiator {
    pool: Arc<TransportPool>,
    relay: Arc<dyn RelayApi>,
    connector: Arc<dyn SignalConnector>,
    timeouts: NegotiationTimeouts,
}

impl Negotiator {
    pub fn new(
        pool: Arc<TransportPool>,
        relay: Arc<dyn RelayApi>,
        connector: Arc<dyn SignalConnector>,
        timeouts: NegotiationTimeouts,
    ) -> Self {
        Self {
            pool,
            relay,
            connector,
            timeouts,
        }
    }

    pub fn pool(&self) -> &Arc<TransportPool> {
        &self.pool
    }

    /// Negotiate a preview for `source_id` using the relay's start-source answer.
    ///
    /// On failure or cancellation the borrowed transport is already back in
    /// the pool when this returns.
    pub async fn negotiate(&self, source_id: &str, source: &SourceInfo, cancel: &CancellationToken) -> NegotiationOutcome {
        let Some(url) = source.negotiation_url.as_deref() else {
            return NegotiationOutcome::Failed(PreviewError::Protocol(format!(
                "Relay returned no negotiation URL for {}",
                source_id
            )));
        };

        if cancel.is_cancelled() {
            return NegotiationOutcome::Cancelled;
        }

        let transport = match self.pool.acquire().await {
            Ok(transport) => transport,
            Err(e) => return NegotiationOutcome::Failed(e),
        };
        let mut events = transport.bind();
        let protocol = source.protocol();
        log::debug!(
            "[{}] Negotiating over {:?} on transport {}",
            source_id,
            protocol,
            transport.id()
        );

        let result = match protocol {
            NegotiationProtocol::Whep => whep::negotiate(
                source_id,
                &transport,
                &mut events,
                self.relay.as_ref(),
                url,
                &self.timeouts,
                cancel,
            )
            .await
            .map(|stream| (stream, None)),
            NegotiationProtocol::Ws => ws_peer::negotiate(
                source_id,
                &transport,
                &mut events,
                self.connector.as_ref(),
                url,
                &self.timeouts,
                cancel,
            )
            .await
            .map(|(stream, link)| (stream, Some(link))),
        };

        // A late cancel wins over a success that raced it.
        let result = match result {
            Ok(_) if cancel.is_cancelled() => Err(PreviewError::Cancelled),
            other => other,
        };

        match result {
            Ok((stream, link)) => {
                let TransportEvents { candidates, .. } = events;
                let trickle = link.map(|link| {
                    ws_peer::spawn_trickle(
                        source_id.to_string(),
                        transport.clone(),
                        link,
                        candidates,
                        cancel.clone(),
                    )
                });
                NegotiationOutcome::Connected(PreviewSession {
                    transport,
                    stream,
                    trickle,
                })
            }
            Err(e) => {
                drop(events);
                self.pool.release(transport).await;
                if e.is_cancelled() {
                    log::debug!("[{}] Negotiation cancelled", source_id);
                    NegotiationOutcome::Cancelled
                } else {
                    log::warn!("[{}] Negotiation failed: {}", source_id, e);
                    NegotiationOutcome::Failed(e)
                }
            }
        }
    }

    /// Tear down a playing preview and return its transport to the pool.
    pub async fn release(&self, session: PreviewSession) {
        let PreviewSession {
            transport, trickle, ..
        } = session;
        if let Some(trickle) = trickle {
            trickle.abort();
        }
        self.pool.release(transport).await;
    }
}

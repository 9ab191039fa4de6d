//! Request/response negotiation (WHEP-style).
//!
//! Flow:
//! 1. Configure receive-only video and audio slots if the transport has none
//! 2. Create an offer and apply it locally
//! 3. Give local ICE gathering a short grace period
//! 4. POST the offer to the negotiation URL; the answer is the response body
//! 5. Apply the answer
//! 6. Wait for the first inbound track
//!
//! Every step checks the cancellation token before and after it suspends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::negotiator::{cancellable, NegotiationTimeouts};
use super::relay::RelayApi;
use crate::error::{PreviewError, Result};
use crate::peer::{MediaStream, Transport, TransportEvents, TransportState};

/// Add receive-only slots unless a previous use (or pre-warming) already did.
pub async fn ensure_receivers(transport: &dyn Transport) -> Result<()> {
    if transport.has_receivers() {
        return Ok(());
    }
    transport.add_receivers().await
}

/// Create the offer, apply it locally and return its SDP.
pub async fn create_local_offer(transport: &dyn Transport) -> Result<String> {
    transport.create_offer().await
}

/// Wait for ICE gathering to complete, but no longer than `grace`.
///
/// Returns whether gathering actually completed.
pub async fn wait_for_ice_gathering(gathering: &mut watch::Receiver<bool>, grace: Duration) -> bool {
    matches!(
        tokio::time::timeout(grace, gathering.wait_for(|done| *done)).await,
        Ok(Ok(_))
    )
}

/// POST the offer and return the relay's answer.
pub async fn exchange_offer(relay: &dyn RelayApi, negotiation_url: &str, offer_sdp: &str) -> Result<String> {
    relay.post_offer(negotiation_url, offer_sdp).await
}

/// Wait for the first inbound track.
///
/// Fails early if the transport reaches a terminal state first.
pub async fn wait_for_track(events: &mut TransportEvents, timeout: Duration) -> Result<MediaStream> {
    tokio::select! {
        stream = events.tracks.recv() => {
            stream.ok_or_else(|| PreviewError::Transport("Transport closed before a track arrived".into()))
        }
        state = terminal_state(&mut events.state) => {
            Err(PreviewError::Transport(format!("Transport {:?} while waiting for media", state)))
        }
        _ = tokio::time::sleep(timeout) => {
            Err(PreviewError::Timeout(format!("No media track within {:?}", timeout)))
        }
    }
}

/// Resolves once the state becomes terminal; never resolves if the sender is gone.
pub(crate) async fn terminal_state(state: &mut watch::Receiver<TransportState>) -> TransportState {
    // Copy out of the watch::Ref before suspending again; the Ref is not Send.
    let reached = state.wait_for(|s| s.is_terminal()).await.map(|s| *s);
    match reached {
        Ok(s) => s,
        Err(_) => std::future::pending().await,
    }
}

/// Run the full request/response negotiation on a bound transport.
pub async fn negotiate(
    source_id: &str,
    transport: &Arc<dyn Transport>,
    events: &mut TransportEvents,
    relay: &dyn RelayApi,
    negotiation_url: &str,
    timeouts: &NegotiationTimeouts,
    cancel: &CancellationToken,
) -> Result<MediaStream> {
    cancellable(cancel, ensure_receivers(transport.as_ref())).await?;

    let offer = cancellable(cancel, create_local_offer(transport.as_ref())).await?;

    let gathered = cancellable(cancel, async {
        Ok(wait_for_ice_gathering(&mut events.gathering_complete, timeouts.ice_gather_grace).await)
    })
    .await?;
    if !gathered {
        log::debug!("[{}] ICE gathering still running after {:?}, sending offer anyway", source_id, timeouts.ice_gather_grace);
    }

    // Prefer the local description: it carries whatever candidates were gathered.
    let local_sdp = cancellable(cancel, async { Ok(transport.local_description().await) })
        .await?
        .unwrap_or(offer);

    let answer = cancellable(cancel, exchange_offer(relay, negotiation_url, &local_sdp)).await?;
    log::debug!("[{}] Offer posted, answer received", source_id);

    cancellable(cancel, transport.apply_answer(&answer)).await?;

    let stream = cancellable(cancel, wait_for_track(events, timeouts.track)).await?;
    log::info!("[{}] First media track received (stream {})", source_id, stream.id());
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{MediaTrack, TrackKind};

    #[tokio::test]
    async fn test_gathering_wait_is_bounded() {
        let (_sink, mut events) = TransportEvents::channel(TransportState::New);
        let started = std::time::Instant::now();
        let completed = wait_for_ice_gathering(&mut events.gathering_complete, Duration::from_millis(50)).await;
        assert!(!completed);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_gathering_wait_resolves_early() {
        let (sink, mut events) = TransportEvents::channel(TransportState::New);
        sink.gathering_complete();
        let started = std::time::Instant::now();
        assert!(wait_for_ice_gathering(&mut events.gathering_complete, Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_track_wait_times_out() {
        let (_sink, mut events) = TransportEvents::channel(TransportState::New);
        let err = wait_for_track(&mut events, Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, PreviewError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_track_wait_fails_on_terminal_transport() {
        let (sink, mut events) = TransportEvents::channel(TransportState::Connecting);
        sink.set_state(TransportState::Failed);
        let err = wait_for_track(&mut events, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, PreviewError::Transport(_)));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_track_wait_future_is_send() {
        let (_sink, mut events) = TransportEvents::channel(TransportState::New);
        let wait = wait_for_track(&mut events, Duration::from_millis(10));
        assert_send(&wait);
        assert!(wait.await.is_err());

        let (_sink, mut events) = TransportEvents::channel(TransportState::New);
        let terminal = terminal_state(&mut events.state);
        assert_send(&terminal);
    }

    #[tokio::test]
    async fn test_terminal_state_pending_when_sender_gone() {
        let (sink, mut events) = TransportEvents::channel(TransportState::New);
        drop(sink);
        let result = tokio::time::timeout(Duration::from_millis(30), terminal_state(&mut events.state)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_track_wait_returns_stream() {
        let (sink, mut events) = TransportEvents::channel(TransportState::Connecting);
        sink.push_track("cam-1", MediaTrack::detached("v0", TrackKind::Video));
        let stream = wait_for_track(&mut events, Duration::from_secs(1)).await.unwrap();
        assert_eq!(stream.id(), "cam-1");
    }
}

//! Message-based negotiation over a persistent signaling channel.
//!
//! Flow:
//! 1. Open the channel for the source and send a capability request
//! 2. On `webrtc/offer`: apply it, answer, send the answer back
//! 3. On `webrtc/candidate`: apply it, or queue it until the offer is applied
//! 4. Forward every local candidate as `webrtc/candidate`
//! 5. Resolve on the first inbound track
//!
//! The whole exchange runs under one overall deadline. After success the
//! channel is handed to a trickle task that keeps exchanging late candidates.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::negotiator::{cancellable, NegotiationTimeouts};
use super::whep::terminal_state;
use super::ws_channel::{SignalConnector, SignalLink, SignalMessage};
use crate::error::{PreviewError, Result};
use crate::peer::{IceCandidateInfo, MediaStream, Transport, TransportEvents};

async fn apply_remote_candidate(source_id: &str, transport: &dyn Transport, candidate: IceCandidateInfo) {
    if let Err(e) = transport.add_remote_candidate(candidate).await {
        log::warn!("[{}] Skipping remote candidate: {}", source_id, e);
    }
}

/// Run the message-based negotiation on a bound transport.
///
/// Returns the first inbound stream and the still-open signaling link.
pub async fn negotiate(
    source_id: &str,
    transport: &Arc<dyn Transport>,
    events: &mut TransportEvents,
    connector: &dyn SignalConnector,
    url: &str,
    timeouts: &NegotiationTimeouts,
    cancel: &CancellationToken,
) -> Result<(MediaStream, SignalLink)> {
    let deadline = tokio::time::Instant::now() + timeouts.signaling;
    let timed_out = || PreviewError::Timeout(format!("Signaling did not complete within {:?}", timeouts.signaling));

    let mut link = cancellable(cancel, async {
        tokio::time::timeout_at(deadline, connector.connect(url))
            .await
            .map_err(|_| timed_out())?
    })
    .await?;
    log::debug!("[{}] Signaling channel open", source_id);

    link.send(SignalMessage::Request)?;

    let mut remote_applied = false;
    let mut pending: Vec<IceCandidateInfo> = Vec::new();
    let mut candidates_open = true;

    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(PreviewError::Cancelled),

            _ = &mut expiry => return Err(timed_out()),

            stream = events.tracks.recv() => {
                return match stream {
                    Some(stream) => {
                        log::info!("[{}] First media track received (stream {})", source_id, stream.id());
                        Ok((stream, link))
                    }
                    None => Err(PreviewError::Transport("Transport closed before a track arrived".into())),
                };
            }

            state = terminal_state(&mut events.state) => {
                return Err(PreviewError::Transport(format!("Transport {:?} during signaling", state)));
            }

            message = link.incoming.recv() => match message {
                Some(Ok(SignalMessage::Offer { sdp })) => {
                    log::debug!("[{}] Received offer", source_id);
                    let answer = tokio::select! {
                        biased;
                        _ = &mut expiry => return Err(timed_out()),
                        answer = cancellable(cancel, transport.accept_offer(&sdp)) => answer?,
                    };
                    link.send(SignalMessage::Answer { sdp: answer })?;
                    remote_applied = true;

                    for candidate in pending.drain(..) {
                        apply_remote_candidate(source_id, transport.as_ref(), candidate).await;
                    }
                }
                Some(Ok(SignalMessage::Candidate { candidate, sdp_mid, sdp_mline_index })) => {
                    let candidate = IceCandidateInfo { candidate, sdp_mid, sdp_mline_index };
                    if remote_applied {
                        apply_remote_candidate(source_id, transport.as_ref(), candidate).await;
                    } else {
                        pending.push(candidate);
                    }
                }
                Some(Ok(SignalMessage::Error { error })) => {
                    return Err(PreviewError::Protocol(format!("Relay rejected negotiation: {}", error)));
                }
                Some(Ok(other)) => {
                    log::debug!("[{}] Ignoring signaling message {:?}", source_id, other);
                }
                Some(Err(PreviewError::Protocol(e))) => {
                    log::warn!("[{}] {}", source_id, e);
                }
                Some(Err(e)) => return Err(e),
                None => return Err(PreviewError::Signaling("Signaling channel closed".into())),
            },

            candidate = events.candidates.recv(), if candidates_open => match candidate {
                Some(candidate) => link.send(SignalMessage::candidate(candidate))?,
                None => candidates_open = false,
            },
        }
    }
}

/// Keep exchanging candidates on an established preview until it is
/// cancelled or the channel closes. Dropping the link closes the channel.
pub fn spawn_trickle(
    source_id: String,
    transport: Arc<dyn Transport>,
    mut link: SignalLink,
    mut candidates: mpsc::UnboundedReceiver<IceCandidateInfo>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut candidates_open = true;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                candidate = candidates.recv(), if candidates_open => match candidate {
                    Some(candidate) => {
                        if link.send(SignalMessage::candidate(candidate)).is_err() {
                            break;
                        }
                    }
                    None => candidates_open = false,
                },

                message = link.incoming.recv() => match message {
                    Some(Ok(SignalMessage::Candidate { candidate, sdp_mid, sdp_mline_index })) => {
                        let candidate = IceCandidateInfo { candidate, sdp_mid, sdp_mline_index };
                        apply_remote_candidate(&source_id, transport.as_ref(), candidate).await;
                    }
                    Some(Ok(other)) => log::debug!("[{}] Ignoring late signaling message {:?}", source_id, other),
                    Some(Err(PreviewError::Protocol(e))) => log::warn!("[{}] {}", source_id, e),
                    Some(Err(e)) => {
                        log::warn!("[{}] Signaling channel failed: {}", source_id, e);
                        break;
                    }
                    None => break,
                },
            }
        }
        log::debug!("[{}] Signaling channel closed", source_id);
    })
}

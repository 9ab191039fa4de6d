//! webrtc-rs backed transport.
//!
//! Wraps RTCPeerConnection and forwards its callbacks into [`TransportEvents`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::transport::{
    IceCandidateInfo, MediaTrack, TrackKind, Transport, TransportEvents, TransportFactory,
    TransportState,
};
use crate::error::{PreviewError, Result};
use crate::ice::IceServerConfig;

/// A single RTCPeerConnection used as a preview transport
pub struct RtcTransport {
    id: u64,
    peer_connection: Arc<RTCPeerConnection>,
    /// Last observed connection state (TransportState as u8)
    state: Arc<AtomicU8>,
    receivers_ready: AtomicBool,
}

impl RtcTransport {
    /// Create a new peer connection.
    pub async fn new(id: u64, api: &API, config: RTCConfiguration) -> Result<Self> {
        let peer_connection = api
            .new_peer_connection(config)
            .await
            .map_err(|e| PreviewError::Transport(format!("Failed to create peer connection: {}", e)))?;

        let peer_connection = Arc::new(peer_connection);
        let state = Arc::new(AtomicU8::new(TransportState::New as u8));

        let state_clone = state.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            state_clone.store(TransportState::from(s) as u8, Ordering::SeqCst);
            Box::pin(async {})
        }));

        Ok(Self {
            id,
            peer_connection,
            state,
            receivers_ready: AtomicBool::new(false),
        })
    }

    /// Get the peer connection for advanced usage
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    async fn add_receiver(&self, kind: RTPCodecType) -> Result<()> {
        self.peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| PreviewError::Transport(format!("Failed to add {:?} transceiver: {}", kind, e)))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for RtcTransport {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn has_receivers(&self) -> bool {
        self.receivers_ready.load(Ordering::SeqCst)
    }

    async fn add_receivers(&self) -> Result<()> {
        self.add_receiver(RTPCodecType::Video).await?;
        self.add_receiver(RTPCodecType::Audio).await?;
        self.receivers_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn bind(&self) -> TransportEvents {
        let (sink, events) = TransportEvents::channel(self.state());

        let state = self.state.clone();
        let state_sink = sink.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let mapped = TransportState::from(s);
                state.store(mapped as u8, Ordering::SeqCst);
                state_sink.set_state(mapped);
                Box::pin(async {})
            }));

        let candidate_sink = sink.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = candidate_sink.clone();
                Box::pin(async move {
                    let Some(c) = candidate else { return };
                    match c.to_json() {
                        Ok(init) => sink.push_candidate(IceCandidateInfo {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(e) => log::debug!("Skipping unserializable local candidate: {}", e),
                    }
                })
            }));

        let gathering_sink = sink.clone();
        self.peer_connection
            .on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
                if s == RTCIceGathererState::Complete {
                    gathering_sink.gathering_complete();
                }
                Box::pin(async {})
            }));

        let track_sink = sink;
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let stream_id = track.stream_id();
                    let media = MediaTrack::from_remote(track.id(), kind, track);
                    track_sink.push_track(&stream_id, media);
                }
                Box::pin(async {})
            },
        ));

        events
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| PreviewError::Transport(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PreviewError::Transport(format!("Failed to set local description: {}", e)))?;

        Ok(offer.sdp)
    }

    async fn local_description(&self) -> Option<String> {
        self.peer_connection.local_description().await.map(|d| d.sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| PreviewError::Protocol(format!("Invalid answer SDP: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| PreviewError::Protocol(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| PreviewError::Protocol(format!("Invalid offer SDP: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| PreviewError::Protocol(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| PreviewError::Transport(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PreviewError::Transport(format!("Failed to set local description: {}", e)))?;

        Ok(answer.sdp)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidateInfo) -> Result<()> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| PreviewError::Protocol(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn strip_tracks(&self) {
        for sender in self.peer_connection.get_senders().await {
            if sender.track().await.is_none() {
                continue;
            }
            if let Err(e) = self.peer_connection.remove_track(&sender).await {
                log::debug!("Transport {}: failed to remove track: {}", self.id, e);
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            log::warn!("Transport {}: failed to close peer connection: {}", self.id, e);
        }
        self.state.store(TransportState::Closed as u8, Ordering::SeqCst);
    }
}

/// Builds [`RtcTransport`]s from one shared webrtc-rs API instance
pub struct RtcTransportFactory {
    api: API,
    config: RTCConfiguration,
    next_id: AtomicU64,
}

impl RtcTransportFactory {
    /// Create a factory with default codecs and interceptors.
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PreviewError::Transport(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PreviewError::Transport(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(|s| s.to_rtc_ice_server()).collect(),
            ..Default::default()
        };

        Ok(Self {
            api,
            config,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self) -> Result<Arc<dyn Transport>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transport = RtcTransport::new(id, &self.api, self.config.clone()).await?;
        log::debug!("Created transport {}", id);
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_transport_starts_fresh() {
        let factory = RtcTransportFactory::new(&[]).unwrap();
        let transport = factory.create().await.unwrap();
        assert_eq!(transport.state(), TransportState::New);
        assert!(!transport.has_receivers());

        transport.add_receivers().await.unwrap();
        assert!(transport.has_receivers());

        let offer = transport.create_offer().await.unwrap();
        assert!(offer.contains("m=video"));
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("a=recvonly"));

        transport.close().await;
        assert!(transport.state().is_terminal());
    }

    #[tokio::test]
    async fn test_factory_assigns_distinct_ids() {
        let factory = RtcTransportFactory::new(&[]).unwrap();
        let a = factory.create().await.unwrap();
        let b = factory.create().await.unwrap();
        assert_ne!(a.id(), b.id());
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_rejected_answer_maps_to_protocol_error() {
        let factory = RtcTransportFactory::new(&[]).unwrap();
        let transport = factory.create().await.unwrap();
        let err = transport.apply_answer("not an sdp").await.unwrap_err();
        assert!(matches!(err, PreviewError::Protocol(_)), "{:?}", err);
        transport.close().await;
    }
}
